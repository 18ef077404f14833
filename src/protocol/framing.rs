//! Wire protocol codec for the JSON hub protocol.
//!
//! Every frame is a compact JSON object followed by a single record
//! separator byte (U+001E). A socket text message may carry several
//! frames back to back:
//!
//! ```text
//! {"type":6}\x1e{"type":1,"target":"ReceiveMessage","arguments":[...]}\x1e
//! ```
//!
//! Frame types:
//! - `1`: Invocation (client ⇄ server)
//! - `3`: Completion (result of an invocation with an id)
//! - `6`: Ping (keep-alive, echoed back)
//! - `7`: Close (server terminates the connection)
//!
//! The handshake request/response are the only frames without a `type`.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame terminator.
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Protocol name sent in the handshake.
pub const PROTOCOL_NAME: &str = "json";

/// Protocol version sent in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Frame type constants.
pub mod frame_type {
    /// Remote method invocation.
    pub const INVOCATION: u64 = 1;
    /// Invocation completion.
    pub const COMPLETION: u64 = 3;
    /// Keep-alive ping.
    pub const PING: u64 = 6;
    /// Connection close.
    pub const CLOSE: u64 = 7;
}

/// A named remote method call.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    /// Method name on the receiving side (case-sensitive).
    pub target: String,
    /// Positional arguments.
    pub arguments: Vec<Value>,
    /// Present when the caller expects a completion; `None` for fire-and-forget.
    pub invocation_id: Option<String>,
}

impl Invocation {
    /// Fire-and-forget invocation (no invocation id).
    pub fn fire_and_forget(target: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            target: target.into(),
            arguments,
            invocation_id: None,
        }
    }

    /// Invocation carrying an id.
    pub fn with_id(
        target: impl Into<String>,
        arguments: Vec<Value>,
        invocation_id: impl Into<String>,
    ) -> Self {
        Self {
            target: target.into(),
            arguments,
            invocation_id: Some(invocation_id.into()),
        }
    }
}

/// A decoded hub protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Client → server protocol selection.
    HandshakeRequest {
        /// Protocol name (always `json` for this client).
        protocol: String,
        /// Protocol version.
        version: u32,
    },
    /// Server → client handshake acknowledgement.
    HandshakeResponse {
        /// Set when the server rejected the handshake.
        error: Option<String>,
    },
    /// Remote method call.
    Invocation(Invocation),
    /// Completion of an invocation with an id.
    Completion {
        /// Id of the completed invocation.
        invocation_id: String,
        /// Set when the invocation failed.
        error: Option<String>,
    },
    /// Keep-alive.
    Ping,
    /// Server-initiated close.
    Close {
        /// Reason supplied by the server, if any.
        error: Option<String>,
    },
}

impl Frame {
    /// The handshake request this client always sends.
    pub fn handshake_request() -> Self {
        Frame::HandshakeRequest {
            protocol: PROTOCOL_NAME.to_string(),
            version: PROTOCOL_VERSION,
        }
    }

    /// Encode this frame into wire text, including the trailing separator.
    ///
    /// Fails only when an invocation argument cannot be represented as JSON.
    pub fn encode(&self) -> Result<String> {
        let value = match self {
            Frame::HandshakeRequest { protocol, version } => to_value(&HandshakeRequestWire {
                protocol,
                version: *version,
            }),
            Frame::HandshakeResponse { error } => to_value(&HandshakeResponseWire {
                error: error.as_deref(),
            }),
            Frame::Invocation(invocation) => to_value(&InvocationWire {
                kind: frame_type::INVOCATION,
                invocation_id: invocation.invocation_id.as_deref(),
                target: &invocation.target,
                arguments: &invocation.arguments,
            }),
            Frame::Completion {
                invocation_id,
                error,
            } => to_value(&CompletionWire {
                kind: frame_type::COMPLETION,
                invocation_id,
                error: error.as_deref(),
            }),
            Frame::Ping => to_value(&TypeOnlyWire {
                kind: frame_type::PING,
            }),
            Frame::Close { error } => to_value(&CloseWire {
                kind: frame_type::CLOSE,
                error: error.as_deref(),
            }),
        };

        let mut text = value?;
        text.push(RECORD_SEPARATOR);
        Ok(text)
    }
}

// Wire shapes. Field order is the order on the wire.

#[derive(Serialize)]
struct HandshakeRequestWire<'a> {
    protocol: &'a str,
    version: u32,
}

#[derive(Serialize)]
struct HandshakeResponseWire<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

#[derive(Serialize)]
struct InvocationWire<'a> {
    #[serde(rename = "type")]
    kind: u64,
    #[serde(rename = "invocationId", skip_serializing_if = "Option::is_none")]
    invocation_id: Option<&'a str>,
    target: &'a str,
    arguments: &'a [Value],
}

#[derive(Serialize)]
struct CompletionWire<'a> {
    #[serde(rename = "type")]
    kind: u64,
    #[serde(rename = "invocationId")]
    invocation_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

#[derive(Serialize)]
struct TypeOnlyWire {
    #[serde(rename = "type")]
    kind: u64,
}

#[derive(Serialize)]
struct CloseWire<'a> {
    #[serde(rename = "type")]
    kind: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

#[derive(Deserialize)]
struct IncomingInvocation {
    target: String,
    #[serde(default)]
    arguments: Vec<Value>,
    #[serde(rename = "invocationId", default)]
    invocation_id: Option<String>,
}

#[derive(Deserialize)]
struct IncomingCompletion {
    #[serde(rename = "invocationId", default)]
    invocation_id: String,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct IncomingClose {
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct IncomingHandshakeRequest {
    protocol: String,
    version: u32,
}

#[derive(Deserialize)]
struct IncomingHandshakeResponse {
    #[serde(default)]
    error: Option<String>,
}

fn to_value<T: Serialize>(wire: &T) -> Result<String> {
    serde_json::to_string(wire).context("Failed to encode frame")
}

/// Wire text of the handshake request: `{"protocol":"json","version":1}` + separator.
pub fn encode_handshake_request() -> String {
    format!("{{\"protocol\":\"{PROTOCOL_NAME}\",\"version\":{PROTOCOL_VERSION}}}{RECORD_SEPARATOR}")
}

/// Encode several frames into one socket message.
pub fn encode_all<'a>(frames: impl IntoIterator<Item = &'a Frame>) -> Result<String> {
    frames.into_iter().map(Frame::encode).collect()
}

/// Decode every frame in a socket message.
///
/// Empty segments (two consecutive separators) are skipped. Frames whose
/// `type` is not understood are skipped silently. A segment that is not
/// valid JSON produces an `Err` entry; the remaining segments are still
/// decoded.
pub fn decode(buffer: &str) -> Vec<Result<Frame>> {
    buffer
        .split(RECORD_SEPARATOR)
        .filter(|segment| !segment.trim().is_empty())
        .filter_map(|segment| decode_segment(segment).transpose())
        .collect()
}

/// Decode a single segment (without separator).
///
/// Returns `Ok(None)` for frame types this client does not handle.
fn decode_segment(segment: &str) -> Result<Option<Frame>> {
    let value: Value = serde_json::from_str(segment)
        .map_err(|e| anyhow!("Invalid JSON frame: {e}"))?;

    let Some(object) = value.as_object() else {
        return Err(anyhow!("Frame is not a JSON object"));
    };

    let Some(kind) = object.get("type") else {
        return decode_handshake(value).map(Some);
    };

    let kind = kind
        .as_u64()
        .ok_or_else(|| anyhow!("Frame type is not an integer: {kind}"))?;

    let frame = match kind {
        frame_type::INVOCATION => {
            let wire: IncomingInvocation =
                serde_json::from_value(value).context("Malformed invocation frame")?;
            Frame::Invocation(Invocation {
                target: wire.target,
                arguments: wire.arguments,
                invocation_id: wire.invocation_id,
            })
        }
        frame_type::COMPLETION => {
            let wire: IncomingCompletion =
                serde_json::from_value(value).context("Malformed completion frame")?;
            Frame::Completion {
                invocation_id: wire.invocation_id,
                error: wire.error,
            }
        }
        frame_type::PING => Frame::Ping,
        frame_type::CLOSE => {
            let wire: IncomingClose =
                serde_json::from_value(value).context("Malformed close frame")?;
            Frame::Close { error: wire.error }
        }
        _ => return Ok(None),
    };

    Ok(Some(frame))
}

fn decode_handshake(value: Value) -> Result<Frame> {
    if value.get("protocol").is_some() {
        let wire: IncomingHandshakeRequest =
            serde_json::from_value(value).context("Malformed handshake request")?;
        Ok(Frame::HandshakeRequest {
            protocol: wire.protocol,
            version: wire.version,
        })
    } else {
        let wire: IncomingHandshakeResponse =
            serde_json::from_value(value).context("Malformed handshake response")?;
        Ok(Frame::HandshakeResponse { error: wire.error })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode_ok(buffer: &str) -> Vec<Frame> {
        decode(buffer)
            .into_iter()
            .map(|r| r.expect("frame should decode"))
            .collect()
    }

    #[test]
    fn test_handshake_request_exact_bytes() {
        assert_eq!(
            encode_handshake_request(),
            "{\"protocol\":\"json\",\"version\":1}\u{1e}"
        );
    }

    #[test]
    fn test_invocation_wire_shape_with_id() {
        let frame = Frame::Invocation(Invocation::with_id(
            "MarkAsRead",
            vec![json!("c1"), json!("m1"), json!("u1")],
            "7",
        ));
        assert_eq!(
            frame.encode().unwrap(),
            "{\"type\":1,\"invocationId\":\"7\",\"target\":\"MarkAsRead\",\"arguments\":[\"c1\",\"m1\",\"u1\"]}\u{1e}"
        );
    }

    #[test]
    fn test_fire_and_forget_omits_invocation_id() {
        let frame = Frame::Invocation(Invocation::fire_and_forget(
            "JoinConversation",
            vec![json!("c1")],
        ));
        let text = frame.encode().unwrap();
        assert!(!text.contains("invocationId"));
        assert_eq!(
            text,
            "{\"type\":1,\"target\":\"JoinConversation\",\"arguments\":[\"c1\"]}\u{1e}"
        );
    }

    #[test]
    fn test_handshake_request_matches_frame_encoding() {
        assert_eq!(
            encode_handshake_request(),
            Frame::handshake_request().encode().unwrap()
        );
    }

    #[test]
    fn test_completion_error_shape() {
        let failed = Frame::Completion {
            invocation_id: "9".into(),
            error: Some("Unknown method Nope".into()),
        };
        assert_eq!(
            failed.encode().unwrap(),
            "{\"type\":3,\"invocationId\":\"9\",\"error\":\"Unknown method Nope\"}\u{1e}"
        );
        let ok = Frame::Completion {
            invocation_id: "9".into(),
            error: None,
        };
        assert_eq!(ok.encode().unwrap(), "{\"type\":3,\"invocationId\":\"9\"}\u{1e}");
    }

    #[test]
    fn test_ping_and_close_shapes() {
        assert_eq!(Frame::Ping.encode().unwrap(), "{\"type\":6}\u{1e}");
        assert_eq!(Frame::Close { error: None }.encode().unwrap(), "{\"type\":7}\u{1e}");
        assert_eq!(
            Frame::Close {
                error: Some("bye".into())
            }
            .encode().unwrap(),
            "{\"type\":7,\"error\":\"bye\"}\u{1e}"
        );
    }

    #[test]
    fn test_every_variant_survives_encode_decode() {
        let frames = vec![
            Frame::handshake_request(),
            Frame::HandshakeResponse { error: None },
            Frame::HandshakeResponse {
                error: Some("unsupported protocol".into()),
            },
            Frame::Invocation(Invocation::fire_and_forget(
                "SendGeolocationData",
                vec![json!({"truckId": "t1", "currentLocation": {"latitude": 1.5, "longitude": -2.0}})],
            )),
            Frame::Invocation(Invocation::with_id("RegisterUser", vec![json!("u1")], "1")),
            Frame::Completion {
                invocation_id: "1".into(),
                error: None,
            },
            Frame::Completion {
                invocation_id: "2".into(),
                error: Some("Unknown method".into()),
            },
            Frame::Ping,
            Frame::Close { error: None },
            Frame::Close {
                error: Some("server shutting down".into()),
            },
        ];

        for frame in &frames {
            assert_eq!(decode_ok(&frame.encode().unwrap()), vec![frame.clone()]);
        }
    }

    #[test]
    fn test_concatenated_frames_keep_order() {
        let frames = vec![
            Frame::Ping,
            Frame::Invocation(Invocation::fire_and_forget("A", vec![json!(1)])),
            Frame::Invocation(Invocation::fire_and_forget("B", vec![json!(2)])),
            Frame::Close { error: None },
        ];
        let buffer = encode_all(&frames).unwrap();
        assert_eq!(decode_ok(&buffer), frames);
    }

    #[test]
    fn test_empty_segments_are_ignored() {
        let a = Frame::Invocation(Invocation::fire_and_forget("A", vec![]));
        let b = Frame::Ping;
        let with_gap = format!("{}\u{1e}{}\u{1e}", a.encode().unwrap(), b.encode().unwrap());
        let without_gap = format!("{}{}", a.encode().unwrap(), b.encode().unwrap());
        assert_eq!(decode_ok(&with_gap), decode_ok(&without_gap));
        assert_eq!(decode_ok(&with_gap).len(), 2);
    }

    #[test]
    fn test_unknown_type_is_skipped() {
        let buffer = "{\"type\":2,\"invocationId\":\"1\",\"item\":5}\u{1e}{\"type\":6}\u{1e}";
        assert_eq!(decode_ok(buffer), vec![Frame::Ping]);
    }

    #[test]
    fn test_malformed_segment_does_not_poison_the_rest() {
        let buffer = "{\"type\":6}\u{1e}{not json\u{1e}{\"type\":7}\u{1e}";
        let results = decode(buffer);
        assert_eq!(results.len(), 3);
        assert!(matches!(results[0], Ok(Frame::Ping)));
        assert!(results[1].is_err());
        assert!(matches!(results[2], Ok(Frame::Close { error: None })));
    }

    #[test]
    fn test_invocation_without_arguments_defaults_to_empty() {
        let frames = decode_ok("{\"type\":1,\"target\":\"Noop\"}\u{1e}");
        assert_eq!(
            frames,
            vec![Frame::Invocation(Invocation::fire_and_forget("Noop", vec![]))]
        );
    }

    #[test]
    fn test_completion_extra_fields_ignored() {
        let frames = decode_ok("{\"type\":3,\"invocationId\":\"4\",\"result\":null}\u{1e}");
        assert_eq!(
            frames,
            vec![Frame::Completion {
                invocation_id: "4".into(),
                error: None,
            }]
        );
    }

    #[test]
    fn test_empty_handshake_response() {
        assert_eq!(
            decode_ok("{}\u{1e}"),
            vec![Frame::HandshakeResponse { error: None }]
        );
    }

    #[test]
    fn test_non_object_segment_is_error() {
        let results = decode("[1,2]\u{1e}");
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }
}
