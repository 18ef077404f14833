//! Hub wire protocol: frame codec and invocation payloads.
//!
//! ```text
//! socket text message
//!     │  split on U+001E
//!     ▼
//! framing::decode ──► Frame::{Invocation, Completion, Ping, Close, Handshake*}
//!                          │
//!                          └── arguments: Vec<serde_json::Value>
//!                                  │
//!                                  ▼
//!                          models::{GeolocationUpdate, ChatMessage, TypingIndicator, ...}
//! ```

pub mod framing;
pub mod models;

pub use framing::{decode, encode_all, encode_handshake_request, Frame, Invocation, RECORD_SEPARATOR};
pub use models::{
    Address, ChatMessage, GeoPoint, GeolocationUpdate, MessageReadNotification, TypingIndicator,
};

/// Hub method names used by both sides.
pub mod methods {
    /// Client → server: join the tenant group.
    pub const REGISTER_TENANT: &str = "RegisterTenant";
    /// Client → server: leave the tenant group.
    pub const UNREGISTER_TENANT: &str = "UnregisterTenant";
    /// Client → server: bind the connection to a user id.
    pub const REGISTER_USER: &str = "RegisterUser";
    /// Client → server: join a conversation group.
    pub const JOIN_CONVERSATION: &str = "JoinConversation";
    /// Client → server: leave a conversation group.
    pub const LEAVE_CONVERSATION: &str = "LeaveConversation";
    /// Client → server: typing started/stopped.
    pub const SEND_TYPING_INDICATOR: &str = "SendTypingIndicator";
    /// Client → server: a message was read.
    pub const MARK_AS_READ: &str = "MarkAsRead";
    /// Client → server: latest truck position.
    pub const SEND_GEOLOCATION_DATA: &str = "SendGeolocationData";
    /// Server → client: new chat message.
    pub const RECEIVE_MESSAGE: &str = "ReceiveMessage";
    /// Server → client: typing indicator.
    pub const TYPING_INDICATOR: &str = "TypingIndicator";
    /// Server → client: read receipt.
    pub const MESSAGE_READ: &str = "MessageRead";
}
