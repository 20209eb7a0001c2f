#![deny(missing_docs)]
//! The worker bridge (spec component C4): an on-demand, idempotent outbound
//! WebSocket client that attaches to a session as the `ai` role, drives the
//! generation collaborator's streaming produce-reply operation, and fans
//! the resulting events back into the session.
//!
//! [`BridgeRegistry::start`] is the only entry point a caller needs
//! (`chatrelay-hub`'s control plane calls it directly in this single-binary
//! deployment, per the Open Question decision recorded in `DESIGN.md`). The
//! registry owns exactly one in-flight [`tokio::task`] per session id and
//! guarantees idempotent starts (§4.4.1): a generation counter tags each
//! spawned task so a late self-deregistration from an old, already
//! superseded task can never clobber a fresher one.

use std::{collections::HashMap, sync::Arc};

use backon::{BackoffBuilder as _, ExponentialBuilder, Retryable as _};
use chatrelay_collaborator_client::CollaboratorService;
use chatrelay_types::{
    SessionId,
    collaborator::{Channel, ChatRequest, StreamEvent},
    wire::ClientFrame,
};
use parking_lot::Mutex;
use secrecy::SecretString;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

mod ws;
use ws::{BridgeSocket, InboundFrame};

/// Errors produced by the bridge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `start_bridge` was called with an empty session id.
    #[error("session_id must not be empty")]
    EmptySessionId,
    /// No relay URL is configured for the bridge to dial back into.
    #[error("relay URL is not configured")]
    MissingRelayUrl,
    /// The dial-back endpoint was not a valid WebSocket URL.
    #[error("invalid relay URL: {0}")]
    InvalidUrl(tokio_tungstenite::tungstenite::Error),
    /// The shared secret contained bytes that are not a valid header value.
    #[error("shared secret is not a valid header value")]
    InvalidSecret,
    /// The underlying WebSocket transport failed.
    #[error(transparent)]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    /// The collaborator call failed.
    #[error(transparent)]
    Collaborator(#[from] chatrelay_collaborator_client::Error),
}

/// Configuration the bridge needs to dial back into the hub.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Base URL of the hub (`ws(s)://...`), e.g. `RELAY_URL`.
    pub relay_url: String,
    /// `Origin` header to present on the outbound dial, if any.
    pub relay_origin: Option<String>,
    /// Shared secret presented as `X-API-KEY` on the outbound dial.
    pub shared_secret: Option<SecretString>,
}

/// The outcome of a [`BridgeRegistry::start`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A fresh connection task was spawned for this session.
    Started,
    /// A task for this session was already running; nothing new was spawned.
    AlreadyActive,
}

struct Slot {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Process-local registry of in-flight bridge tasks, one per session id.
///
/// Cheap to clone (an `Arc` newtype); cloning shares the same table, the
/// same idiom the hub's own service handles use (§9 "global mutable state
/// ... express as a component value passed by the composition root").
#[derive(Clone)]
pub struct BridgeRegistry {
    tasks: Arc<Mutex<HashMap<SessionId, Slot>>>,
    next_generation: Arc<Mutex<u64>>,
    cancellation_token: CancellationToken,
}

impl BridgeRegistry {
    /// Creates an empty registry. `cancellation_token` is cancelled by the
    /// composition root on shutdown; every running bridge task observes it
    /// and unwinds its connection loop (§5 "Cancellation").
    pub fn new(cancellation_token: CancellationToken) -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_generation: Arc::new(Mutex::new(0)),
            cancellation_token,
        }
    }

    /// Idempotently starts a bridge task for `session_id` (§4.4.1).
    ///
    /// Returns promptly: the outbound dial itself happens inside the
    /// spawned task, not before this call returns. If a task for
    /// `session_id` is already running, returns
    /// [`StartOutcome::AlreadyActive`] without touching it; if the previous
    /// task has already finished, it is discarded and a fresh one is
    /// spawned.
    #[instrument(level = "debug", skip(self, config, collaborator))]
    pub fn start(
        &self,
        session_id: SessionId,
        config: Arc<BridgeConfig>,
        collaborator: CollaboratorService,
    ) -> Result<StartOutcome, Error> {
        if session_id.as_str().is_empty() {
            return Err(Error::EmptySessionId);
        }
        if config.relay_url.trim().is_empty() {
            return Err(Error::MissingRelayUrl);
        }

        let mut tasks = self.tasks.lock();
        if let Some(slot) = tasks.get(&session_id) {
            if !slot.handle.is_finished() {
                return Ok(StartOutcome::AlreadyActive);
            }
        }

        let generation = {
            let mut next = self.next_generation.lock();
            let generation = *next;
            *next += 1;
            generation
        };

        let registry = self.clone();
        let task_session_id = session_id.clone();
        let cancellation_token = self.cancellation_token.clone();
        let handle = tokio::spawn(async move {
            run_connection_loop(
                task_session_id.clone(),
                config,
                collaborator,
                cancellation_token,
            )
            .await;
            registry.deregister(&task_session_id, generation);
        });
        tasks.insert(session_id, Slot { generation, handle });
        Ok(StartOutcome::Started)
    }

    fn deregister(&self, session_id: &SessionId, generation: u64) {
        let mut tasks = self.tasks.lock();
        if tasks.get(session_id).is_some_and(|slot| slot.generation == generation) {
            tasks.remove(session_id);
        }
    }

    /// Whether a live (not-yet-finished) bridge task is registered for
    /// `session_id`. Exposed for tests and diagnostics; routing itself never
    /// consults this (the hub's `ai`-role admission is unconditional, §4.4.1
    /// Open Question: duplicate `ai` admission is tolerated).
    pub fn is_active(&self, session_id: &SessionId) -> bool {
        self.tasks
            .lock()
            .get(session_id)
            .is_some_and(|slot| !slot.handle.is_finished())
    }
}

const MAX_DIAL_ATTEMPTS: usize = 5;

#[instrument(level = "info", skip_all, fields(session_id = %session_id))]
async fn run_connection_loop(
    session_id: SessionId,
    config: Arc<BridgeConfig>,
    collaborator: CollaboratorService,
    cancellation_token: CancellationToken,
) {
    let backoff = ExponentialBuilder::default()
        .with_max_times(MAX_DIAL_ATTEMPTS)
        .with_jitter()
        .build();
    let dial = {
        let session_id = session_id.clone();
        let config = config.clone();
        move || {
            let session_id = session_id.clone();
            let config = config.clone();
            async move {
                BridgeSocket::connect(
                    &config.relay_url,
                    session_id.as_str(),
                    config.relay_origin.as_deref(),
                    config.shared_secret.as_ref(),
                )
                .await
            }
        }
    };
    let socket = match dial
        .retry(backoff)
        .sleep(tokio::time::sleep)
        .notify(|err, duration| {
            tracing::warn!(?err, ?duration, "bridge dial failed, retrying");
        })
        .await
    {
        Ok(socket) => socket,
        Err(err) => {
            tracing::error!(?err, "bridge could not dial back into the hub, giving up");
            return;
        }
    };

    if let Err(err) = drive_session(socket, &session_id, &collaborator, &cancellation_token).await
    {
        tracing::warn!(?err, "bridge connection loop ended with an error");
    }
}

async fn drive_session(
    mut socket: BridgeSocket,
    session_id: &SessionId,
    collaborator: &CollaboratorService,
    cancellation_token: &CancellationToken,
) -> Result<(), Error> {
    // drain the initial `connected` frame (§4.4.2 step 1).
    let _ = socket.recv().await?;

    socket
        .send(&ClientFrame::Hello {
            user_type: Some("ai".to_owned()),
        })
        .await?;
    // drain (and log) the `hello_ack`; any other shape is tolerated.
    match socket.recv().await? {
        Some(InboundFrame::HelloAck) => tracing::debug!("bridge admitted as ai"),
        other => tracing::debug!(?other, "unexpected frame while awaiting hello_ack"),
    }

    loop {
        let frame = tokio::select! {
            frame = socket.recv() => frame?,
            _ = cancellation_token.cancelled() => {
                tracing::info!("bridge connection loop cancelled");
                return Ok(());
            }
        };
        let Some(frame) = frame else {
            return Ok(());
        };
        let InboundFrame::SessionMessage { data: Some(data) } = frame else {
            continue;
        };
        let Some(request) = parse_chat_request(session_id, &data) else {
            continue;
        };

        let should_close = run_turn(&mut socket, collaborator, request).await?;
        if should_close {
            socket.close().await;
            return Ok(());
        }
    }
}

/// Drives one turn (one chat request's worth of streamed events) and
/// reports whether the bridge should now close and exit (escalation).
async fn run_turn(
    socket: &mut BridgeSocket,
    collaborator: &CollaboratorService,
    request: ChatRequest,
) -> Result<bool, Error> {
    use futures::StreamExt as _;

    let mut stream = match collaborator.stream_reply(request).await {
        Ok(stream) => stream,
        Err(err) => {
            emit_error_and_end(socket, &err.to_string()).await?;
            return Ok(false);
        }
    };

    let mut escalate = false;
    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => {
                if let StreamEvent::Escalation { should_escalate } = &event {
                    escalate = *should_escalate;
                }
                emit_event(socket, &event).await?;
            }
            Err(err) => {
                emit_error_and_end(socket, &err.to_string()).await?;
                return Ok(false);
            }
        }
    }
    Ok(escalate)
}

async fn emit_event(socket: &mut BridgeSocket, event: &StreamEvent) -> Result<(), Error> {
    let data = serde_json::to_value(event).expect("StreamEvent always serializes");
    socket
        .send(&ClientFrame::Broadcast {
            msg: None,
            data: Some(data),
        })
        .await
}

async fn emit_error_and_end(socket: &mut BridgeSocket, detail: &str) -> Result<(), Error> {
    emit_event(
        socket,
        &StreamEvent::Error {
            content: detail.to_owned(),
        },
    )
    .await?;
    emit_event(
        socket,
        &StreamEvent::End {
            content: String::new(),
        },
    )
    .await
}

/// Parses a `session_message`'s `data` field into a [`ChatRequest`], per
/// §4.4.2 step 3. Returns `None` for any shape that isn't a recognized chat
/// payload — the receive loop simply ignores it (§9 "drop unknown
/// variants, never throw").
fn parse_chat_request(session_id: &SessionId, data: &Value) -> Option<ChatRequest> {
    let kind = data.get("type").and_then(Value::as_str)?;
    if kind != "chat" && kind != "chat_message" {
        return None;
    }
    let message = data.get("message").and_then(Value::as_str)?.trim();
    if message.is_empty() {
        return None;
    }
    let thread_id = data
        .get("thread_id")
        .and_then(Value::as_str)
        .unwrap_or(session_id.as_str())
        .to_owned();
    let channel = match data.get("channel").and_then(Value::as_str) {
        Some(channel) if channel.eq_ignore_ascii_case("sms") => Channel::Sms,
        _ => Channel::Web,
    };
    let invoice = data.get("invoice").cloned();
    let stripe_link = data
        .get("stripe_payment_link")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .or_else(|| {
            invoice
                .as_ref()
                .and_then(|invoice| invoice.get("stripe_payment_link"))
                .and_then(Value::as_str)
                .map(str::to_owned)
        });
    let webapp_link = data
        .get("web_app_link")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .or_else(|| {
            invoice
                .as_ref()
                .and_then(|invoice| invoice.get("web_app_link"))
                .and_then(Value::as_str)
                .map(str::to_owned)
        });

    Some(ChatRequest {
        thread_id,
        message: message.to_owned(),
        channel,
        invoice,
        stripe_link,
        webapp_link,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid() -> SessionId {
        SessionId::sanitize("s1")
    }

    #[test]
    fn rejects_empty_session_id() {
        let registry = BridgeRegistry::new(CancellationToken::new());
        let config = Arc::new(BridgeConfig {
            relay_url: "ws://localhost:8080".into(),
            relay_origin: None,
            shared_secret: None,
        });
        let collaborator: CollaboratorService = Arc::new(NullCollaborator);
        let err = registry
            .start(SessionId::sanitize(""), config, collaborator)
            .unwrap_err();
        assert!(matches!(err, Error::EmptySessionId));
    }

    #[test]
    fn rejects_missing_relay_url() {
        let registry = BridgeRegistry::new(CancellationToken::new());
        let config = Arc::new(BridgeConfig {
            relay_url: "".into(),
            relay_origin: None,
            shared_secret: None,
        });
        let collaborator: CollaboratorService = Arc::new(NullCollaborator);
        let err = registry.start(sid(), config, collaborator).unwrap_err();
        assert!(matches!(err, Error::MissingRelayUrl));
    }

    #[test]
    fn parses_legacy_chat_message_kind() {
        let data = serde_json::json!({"type": "chat_message", "message": "hi"});
        let request = parse_chat_request(&sid(), &data).unwrap();
        assert_eq!(request.message, "hi");
        assert_eq!(request.thread_id, "s1");
    }

    #[test]
    fn rejects_blank_message() {
        let data = serde_json::json!({"type": "chat", "message": "   "});
        assert!(parse_chat_request(&sid(), &data).is_none());
    }

    #[test]
    fn falls_back_to_invoice_nested_links() {
        let data = serde_json::json!({
            "type": "chat",
            "message": "hi",
            "invoice": {"stripe_payment_link": "https://pay", "web_app_link": "https://app"}
        });
        let request = parse_chat_request(&sid(), &data).unwrap();
        assert_eq!(request.stripe_link.as_deref(), Some("https://pay"));
        assert_eq!(request.webapp_link.as_deref(), Some("https://app"));
    }

    struct NullCollaborator;

    #[async_trait::async_trait]
    impl chatrelay_collaborator_client::CollaboratorClient for NullCollaborator {
        async fn thread_connect(
            &self,
            _thread_id: &str,
        ) -> Result<
            chatrelay_types::collaborator::ThreadConnectResponse,
            chatrelay_collaborator_client::Error,
        > {
            unimplemented!()
        }

        async fn summarize(
            &self,
            _thread_id: &str,
        ) -> Result<
            chatrelay_types::collaborator::SummarizeResponse,
            chatrelay_collaborator_client::Error,
        > {
            unimplemented!()
        }

        async fn history(
            &self,
            _thread_id: &str,
        ) -> Result<
            Vec<chatrelay_types::collaborator::HistoryMessage>,
            chatrelay_collaborator_client::Error,
        > {
            unimplemented!()
        }

        async fn chat_sms(
            &self,
            _request: chatrelay_types::collaborator::SmsChatRequest,
        ) -> Result<String, chatrelay_collaborator_client::Error> {
            unimplemented!()
        }

        async fn stream_reply(
            &self,
            _request: ChatRequest,
        ) -> Result<
            std::pin::Pin<
                Box<
                    dyn futures::Stream<Item = Result<StreamEvent, chatrelay_collaborator_client::Error>>
                        + Send,
                >,
            >,
            chatrelay_collaborator_client::Error,
        > {
            unimplemented!()
        }
    }
}
