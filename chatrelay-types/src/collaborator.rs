//! DTOs exchanged with the generation collaborator (the LLM backend): the
//! four control-plane request/response bodies, and the streamed events the
//! bridge consumes while a reply is produced.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of `POST /thread/connect`.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadConnectRequest {
    /// The session/thread the bridge should (idempotently) dial into.
    pub thread_id: String,
}

/// Response of `POST /thread/connect`.
#[derive(Debug, Clone, Deserialize)]
pub struct ThreadConnectResponse {
    /// Always `"connected"` on success.
    pub status: String,
    /// Echoes the requested thread id.
    pub thread_id: String,
}

/// Body of `POST /thread/summarize`.
#[derive(Debug, Clone, Serialize)]
pub struct SummarizeRequest {
    /// The thread to summarize.
    pub thread_id: String,
}

/// Response of `POST /thread/summarize`.
#[derive(Debug, Clone, Deserialize)]
pub struct SummarizeResponse {
    /// Echoes the requested thread id.
    pub thread_id: String,
    /// The generated summary text.
    pub summary: String,
}

/// Body of `POST /thread/history`.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadHistoryRequest {
    /// The thread whose message history is requested.
    pub thread_id: String,
}

/// Response of `POST /thread/history`.
#[derive(Debug, Clone, Deserialize)]
pub struct ThreadHistoryResponse {
    /// Echoes the requested thread id.
    pub thread_id: String,
    /// The thread's messages, oldest first.
    pub messages: Vec<HistoryMessage>,
}

/// A single history entry, as formatted by the collaborator.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HistoryMessage {
    /// `"user"` or `"ai"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// The rendered message text.
    pub content: String,
    /// A stable message id (assigned by the collaborator).
    pub id: String,
    /// ISO-8601 timestamp the message was sent, if known.
    pub sent_at: Option<String>,
    /// ISO-8601 timestamp the message was read, if known.
    pub read_at: Option<String>,
    /// The id of the message immediately preceding this one, if any.
    pub previous_message_id: Option<String>,
}

/// The channel a chat message originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Routed through the web session hub.
    Web,
    /// Routed through the SMS gateway.
    Sms,
}

/// Body of `POST /chat/sms`: a single-shot, non-streamed reply request.
#[derive(Debug, Clone, Serialize)]
pub struct SmsChatRequest {
    /// The thread this message belongs to.
    pub thread_id: String,
    /// The inbound message text.
    pub message: String,
    /// Optional invoice context injected into the system prompt only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice: Option<Value>,
    /// Optional web-app deep link surfaced to the collaborator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webapp_link: Option<String>,
}

/// Response of `POST /chat/sms`.
#[derive(Debug, Clone, Deserialize)]
pub struct SmsChatResponse {
    /// The generated reply text.
    pub message: String,
}

/// Body used to open a streamed reply for a chat message arriving over the
/// hub (sent by the bridge to the collaborator's streaming endpoint).
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    /// The thread this message belongs to.
    pub thread_id: String,
    /// The inbound message text.
    pub message: String,
    /// The channel the message arrived on.
    pub channel: Channel,
    /// Optional invoice context injected into the system prompt only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice: Option<Value>,
    /// Optional Stripe payment link surfaced to the collaborator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stripe_link: Option<String>,
    /// Optional web-app deep link surfaced to the collaborator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webapp_link: Option<String>,
}

/// One event of a streamed reply, in the strict order the bridge expects:
/// zero or more [`StreamEvent::Token`], an optional [`StreamEvent::Static`],
/// exactly one [`StreamEvent::Escalation`], then exactly one
/// [`StreamEvent::End`]. [`StreamEvent::Error`] may appear in place of the
/// remainder of that sequence and is always followed directly by an
/// [`StreamEvent::End`], with no escalation event in between.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    /// A chunk of generated reply content.
    Token {
        /// The chunk text.
        content: String,
    },
    /// A fixed, channel-specific closing message appended after an
    /// in-scope reply (e.g. a post-script link). Never sent for
    /// out-of-scope or escalated replies.
    Static {
        /// The static text.
        content: String,
    },
    /// Whether this reply should hand the conversation to a human operator.
    Escalation {
        /// `true` if a human should take over.
        should_escalate: bool,
    },
    /// Marks the end of the stream. Always the final event.
    End {
        /// Unused, kept for wire-shape parity with the collaborator.
        #[serde(default, skip_serializing_if = "String::is_empty")]
        content: String,
    },
    /// An unrecoverable error occurred while generating the reply. The
    /// bridge treats this as `should_escalate: false` and still emits the
    /// trailing end event, with no escalation event in between.
    Error {
        /// A human-readable error message.
        content: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_event_round_trips_through_json() {
        let events = vec![
            StreamEvent::Token { content: "hi".into() },
            StreamEvent::Static { content: "thanks".into() },
            StreamEvent::Escalation { should_escalate: false },
            StreamEvent::End { content: String::new() },
        ];
        for event in events {
            let json = serde_json::to_string(&event).unwrap();
            let parsed: StreamEvent = serde_json::from_str(&json).unwrap();
            assert_eq!(
                serde_json::to_value(&parsed).unwrap(),
                serde_json::to_value(&event).unwrap()
            );
        }
    }

    #[test]
    fn escalation_event_parses_from_collaborator_shape() {
        let parsed: StreamEvent =
            serde_json::from_str(r#"{"type":"escalation","should_escalate":true}"#).unwrap();
        assert!(matches!(
            parsed,
            StreamEvent::Escalation { should_escalate: true }
        ));
    }
}
