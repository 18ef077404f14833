//! Payloads carried inside invocation arguments.
//!
//! All types serialize with camelCase field names, matching the JSON the
//! hub and the REST layer exchange.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// A latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
}

impl GeoPoint {
    /// Construct from degrees.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Postal address produced by reverse geocoding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    /// Street line.
    #[serde(default)]
    pub line1: Option<String>,
    /// Secondary line (suite, unit).
    #[serde(default)]
    pub line2: Option<String>,
    /// City or locality.
    #[serde(default)]
    pub city: Option<String>,
    /// State or region.
    #[serde(default)]
    pub state: Option<String>,
    /// Postal code.
    #[serde(default)]
    pub zip_code: Option<String>,
    /// Country name.
    #[serde(default)]
    pub country: Option<String>,
}

/// Payload of `SendGeolocationData`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeolocationUpdate {
    /// Truck the driver is assigned to.
    pub truck_id: String,
    /// Tenant the truck belongs to.
    pub tenant_id: String,
    /// Position of the fix.
    pub current_location: GeoPoint,
    /// Reverse-geocoded address; `null` when geocoding failed.
    #[serde(default)]
    pub current_address: Option<Address>,
    /// Display number of the truck.
    #[serde(default)]
    pub truck_number: Option<String>,
    /// Display name(s) of the driver(s).
    #[serde(default)]
    pub drivers_name: Option<String>,
}

/// A chat message as pushed through `ReceiveMessage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Server-assigned message id; used for de-duplication.
    pub id: String,
    /// Conversation the message belongs to.
    pub conversation_id: String,
    /// Author's user id.
    pub sender_id: String,
    /// Author's display name.
    #[serde(default)]
    pub sender_name: Option<String>,
    /// Message body.
    #[serde(default)]
    pub content: String,
    /// Server timestamp.
    #[serde(default, deserialize_with = "deserialize_lenient_timestamp")]
    pub sent_at: Option<DateTime<Utc>>,
    /// Whether the message has been read by the recipient.
    #[serde(default)]
    pub is_read: bool,
    /// Soft-delete marker.
    #[serde(default)]
    pub is_deleted: bool,
}

/// Payload of the `TypingIndicator` push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingIndicator {
    /// Conversation the user is typing in.
    #[serde(default)]
    pub conversation_id: String,
    /// User who is typing.
    #[serde(default)]
    pub user_id: String,
    /// `true` when typing started, `false` when it stopped.
    #[serde(default)]
    pub is_typing: bool,
}

/// Parsed `MessageRead(messageId, readById)` push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageReadNotification {
    /// Message that was read.
    pub message_id: String,
    /// User who read it.
    pub read_by_id: String,
}

impl MessageReadNotification {
    /// Parse positional arguments. Anything other than two strings yields `None`.
    pub fn from_arguments(arguments: &[serde_json::Value]) -> Option<Self> {
        match arguments {
            [message_id, read_by_id] => Some(Self {
                message_id: message_id.as_str()?.to_string(),
                read_by_id: read_by_id.as_str()?.to_string(),
            }),
            _ => None,
        }
    }
}

/// Parse a timestamp that may or may not carry an offset.
///
/// Offset-less values are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

// Unparseable timestamps become `None` rather than failing the whole message.
fn deserialize_lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_timestamp))
}
