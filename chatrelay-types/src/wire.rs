//! Client/server WebSocket frame DTOs for the session hub (§6).
//!
//! Inbound payloads are variant: clients may send `hello`, `presence`,
//! `broadcast`, or anything else, which is echoed back rather than rejected.
//! [`ClientFrame`] models the three recognized kinds; [`parse_client_frame`]
//! additionally classifies payloads that parse as JSON but don't match any
//! known `type`, so the caller can echo them instead of treating them as a
//! protocol error.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ConnectionId, SessionId};

/// A frame sent by a client after it has been admitted (or, for `hello`,
/// the admission message itself).
///
/// Also used by the worker bridge (`chatrelay-bridge`) to emit its own
/// `hello`/`broadcast` frames: the bridge is a WebSocket client of the hub
/// just like a browser, so it speaks the exact same request shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// `{"type":"hello","user_type":"patient"|"operator"|"ai"}`
    Hello {
        /// The requested role, case-insensitive, validated by the caller.
        user_type: Option<String>,
    },
    /// `{"type":"presence"}`
    Presence,
    /// `{"type":"broadcast","msg"?:string,"data"?:object}`
    Broadcast {
        /// Free-text message payload.
        #[serde(default)]
        msg: Option<String>,
        /// Structured payload.
        #[serde(default)]
        data: Option<Value>,
    },
}

/// The result of attempting to classify a raw inbound text frame.
pub enum ParsedClientFrame {
    /// Parsed into one of the known [`ClientFrame`] kinds.
    Known(ClientFrame),
    /// Valid JSON, but `type` is missing or not one of the known kinds.
    /// Callers should echo this value back to the sender.
    Unknown(Value),
    /// Not valid JSON at all.
    InvalidJson,
}

/// Parses a raw text frame received from a client.
///
/// Never fails: malformed JSON is reported as [`ParsedClientFrame::InvalidJson`]
/// rather than propagated as an error, matching the "drop unknown variants,
/// never throw" guidance for this boundary.
pub fn parse_client_frame(raw: &str) -> ParsedClientFrame {
    let Ok(value) = serde_json::from_str::<Value>(raw) else {
        return ParsedClientFrame::InvalidJson;
    };
    match serde_json::from_value::<ClientFrame>(value.clone()) {
        Ok(frame) => ParsedClientFrame::Known(frame),
        Err(_) => ParsedClientFrame::Unknown(value),
    }
}

/// A frame sent by the hub to a client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Sent immediately on socket accept, before the role is known.
    Connected {
        /// The session this socket joined.
        session_id: SessionId,
        /// The server-assigned connection id.
        connection_id: ConnectionId,
        /// Always `true`: the first inbound message must be a `hello`.
        user_type_required: bool,
    },
    /// Acknowledges a successful `hello`.
    HelloAck {
        /// The session this socket joined.
        session_id: SessionId,
        /// The server-assigned connection id.
        connection_id: ConnectionId,
        /// The now-latched role.
        user_type: &'static str,
    },
    /// Answers a `presence` request.
    Presence {
        /// The session queried.
        session_id: SessionId,
        /// Total number of live members.
        count: usize,
        /// Member count bucketed by role.
        by_type: std::collections::BTreeMap<&'static str, usize>,
        /// The members themselves.
        members: Vec<PresenceMemberWire>,
    },
    /// Human-origin fan-out delivery.
    SessionMessage {
        /// The role of the original sender.
        user_type: &'static str,
        /// Free-text payload (may be blanked per the routing policy).
        msg: Option<String>,
        /// Structured payload (may be blanked per the routing policy).
        data: Option<Value>,
    },
    /// AI-origin fan-out delivery, kept on a distinct wire frame type so
    /// clients can render streamed replies separately from human chat.
    Broadcast {
        /// The role of the original sender (always `ai` in practice).
        user_type: &'static str,
        /// Free-text payload (may be blanked per the routing policy).
        msg: Option<String>,
        /// Structured payload (may be blanked per the routing policy).
        data: Option<Value>,
    },
    /// Echoes an unrecognized inbound payload back to its sender.
    Echo {
        /// The original, unmodified payload.
        data: Value,
    },
    /// A structured error surfaced to one connection.
    Error {
        /// A short machine-readable error code.
        error: &'static str,
        /// An optional human-readable detail.
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

/// A single entry of the `members` array in a [`ServerFrame::Presence`].
#[derive(Debug, Clone, Serialize)]
pub struct PresenceMemberWire {
    /// The connection id of the member.
    pub connection_id: ConnectionId,
    /// The member's latched role.
    pub user_type: &'static str,
    /// Unix timestamp (seconds) the connection was first admitted.
    pub connected_at: i64,
    /// Unix timestamp (seconds) of the member's last activity.
    pub last_seen: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hello_frame() {
        match parse_client_frame(r#"{"type":"hello","user_type":"patient"}"#) {
            ParsedClientFrame::Known(ClientFrame::Hello { user_type }) => {
                assert_eq!(user_type.as_deref(), Some("patient"));
            }
            _ => panic!("expected known hello frame"),
        }
    }

    #[test]
    fn unknown_type_is_echo_candidate() {
        match parse_client_frame(r#"{"type":"ping"}"#) {
            ParsedClientFrame::Unknown(value) => {
                assert_eq!(value["type"], "ping");
            }
            _ => panic!("expected unknown frame"),
        }
    }

    #[test]
    fn invalid_json_is_reported() {
        assert!(matches!(
            parse_client_frame("not json"),
            ParsedClientFrame::InvalidJson
        ));
    }

    #[test]
    fn broadcast_frame_allows_missing_fields() {
        match parse_client_frame(r#"{"type":"broadcast"}"#) {
            ParsedClientFrame::Known(ClientFrame::Broadcast { msg, data }) => {
                assert!(msg.is_none());
                assert!(data.is_none());
            }
            _ => panic!("expected known broadcast frame"),
        }
    }
}
