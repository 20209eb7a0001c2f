//! `GET /ws/session/{session_id}/` — the session hub's WebSocket endpoint
//! (spec component C3).
//!
//! Upgrades with `max_message_size`/`on_failed_upgrade` set, then runs one
//! task per connection that logs its own error via
//! [`WsError::into_close_frame`]: subscribe to the session's fan-out group
//! on accept, latch a role on the first inbound message, then loop,
//! dispatching control messages and relaying fan-out envelopes per the
//! routing policy (§4.3.4).

use axum::{
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
};
use chatrelay_types::{
    ConnectionId, Role, SessionId,
    wire::{ClientFrame, ParsedClientFrame, PresenceMemberWire, ServerFrame, parse_client_frame},
};
use futures::{SinkExt as _, StreamExt as _};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    HubState,
    api::{auth, errors::WsError},
    metrics::{METRICS_ID_ADMISSION_REJECTED, METRICS_ID_BRIDGE_ESCALATION, METRICS_ID_FANOUT_DELIVER},
    services::{
        connections::{ConnectionGuard, ConnectionSink},
        fanout_bus::{Envelope, FanoutBus as _, Subscription},
        presence_store::{PresenceService, PresenceStore as _},
    },
};

/// Builds the `/ws/session/{session_id}/` route.
pub(crate) fn routes() -> axum::Router<HubState> {
    axum::Router::new().route("/ws/session/{session_id}/", get(upgrade))
}

#[instrument(level = "debug", skip_all, fields(session_id = %session_id_raw))]
async fn upgrade(
    State(state): State<HubState>,
    Path(session_id_raw): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let outcome = auth::check_ws(&headers, state.config.shared_secret.as_ref());
    if matches!(outcome, auth::WsAuthOutcome::Denied) {
        ::metrics::counter!(METRICS_ID_ADMISSION_REJECTED).increment(1);
        return axum::http::StatusCode::UNAUTHORIZED.into_response();
    }

    let session_id = SessionId::sanitize(&session_id_raw);
    let mut upgrade = ws
        .max_message_size(state.config.ws_max_message_size)
        .on_failed_upgrade(|err| tracing::warn!(?err, "failed websocket upgrade"));
    if let auth::WsAuthOutcome::Subprotocol(echoed) = outcome {
        upgrade = upgrade.protocols([echoed]);
    }
    upgrade.on_upgrade(move |socket| handle_socket(socket, session_id, state))
}

#[instrument(level = "debug", skip_all, fields(session_id = %session_id))]
async fn handle_socket(socket: WebSocket, session_id: SessionId, state: HubState) {
    let connection_id = ConnectionId::new();
    let _connection_guard = ConnectionGuard::new();
    let (sink, mut stream) = socket.split();
    let sink = ConnectionSink::new(sink);

    let _ = sink
        .send_frame(&ServerFrame::Connected {
            session_id: session_id.clone(),
            connection_id,
            user_type_required: true,
        })
        .await;

    let subscription = state.bus.subscribe(&session_id);

    let Some(role) = admit(&mut stream, &sink, &session_id).await else {
        return;
    };

    state.presence.upsert(&session_id, connection_id, role);
    let _ = sink
        .send_frame(&ServerFrame::HelloAck {
            session_id: session_id.clone(),
            connection_id,
            user_type: role.as_str(),
        })
        .await;

    let local_cancel = CancellationToken::new();
    let forward_handle = tokio::spawn(forward_loop(
        subscription,
        sink.clone(),
        connection_id,
        role,
        local_cancel.clone(),
    ));
    let refresh_handle = tokio::spawn(refresh_loop(
        state.presence.clone(),
        session_id.clone(),
        connection_id,
        role,
        state.config.presence_refresh_interval,
        local_cancel.clone(),
    ));

    read_loop(&mut stream, &sink, &state, &session_id, connection_id, role).await;

    local_cancel.cancel();
    forward_handle.abort();
    refresh_handle.abort();
    state.presence.remove(&session_id, &connection_id);
}

/// Waits for the admission message (§4.3.2): the first inbound frame must be
/// a `hello` carrying a recognized `user_type`. Malformed JSON keeps the
/// socket open (§4.3.6); any other well-formed frame, or an invalid role,
/// closes with 4401.
async fn admit(
    stream: &mut futures::stream::SplitStream<WebSocket>,
    sink: &ConnectionSink,
    session_id: &SessionId,
) -> Option<Role> {
    loop {
        let text = match stream.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => return None,
            Some(Ok(_)) => continue,
            Some(Err(_)) => return None,
        };

        match parse_client_frame(&text) {
            ParsedClientFrame::Known(ClientFrame::Hello { user_type }) => {
                let parsed = user_type.as_deref().and_then(|value| value.parse::<Role>().ok());
                match parsed {
                    Some(role) => return Some(role),
                    None => {
                        deny(sink, "invalid_user_type", Some("user_type must be 'patient', 'operator', or 'ai'")).await;
                        return None;
                    }
                }
            }
            ParsedClientFrame::InvalidJson => {
                let _ = sink
                    .send_frame(&ServerFrame::Error {
                        error: "invalid_json",
                        detail: None,
                    })
                    .await;
            }
            ParsedClientFrame::Known(_) | ParsedClientFrame::Unknown(_) => {
                tracing::debug!(session_id = %session_id, "non-hello frame before admission");
                deny(sink, "user_type_required", None).await;
                return None;
            }
        }
    }
}

async fn deny(sink: &ConnectionSink, error: &'static str, detail: Option<&str>) {
    let _ = sink
        .send_frame(&ServerFrame::Error {
            error,
            detail: detail.map(str::to_owned),
        })
        .await;
    sink.close(
        WsError::AdmissionFailed(error.to_owned())
            .into_close_frame()
            .expect("admission failures always produce a close frame"),
    )
    .await;
}

/// Periodically refreshes this connection's presence record so the TTL
/// sweep never evicts a live connection (§3). If the record has already
/// been evicted (raced with a sweep), re-registers it.
async fn refresh_loop(
    presence: PresenceService,
    session_id: SessionId,
    connection_id: ConnectionId,
    role: Role,
    interval: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if presence.refresh(&session_id, &connection_id).is_err() {
                    presence.upsert(&session_id, connection_id, role);
                }
            }
            _ = cancel.cancelled() => return,
        }
    }
}

/// Relays fan-out envelopes to this connection according to the routing
/// policy (§4.3.4): no self-delivery, operator messages visible only to
/// patients, AI-origin deliveries use the distinct `broadcast` frame type
/// and have their content blanked for operator recipients.
async fn forward_loop(
    mut subscription: Subscription,
    sink: ConnectionSink,
    connection_id: ConnectionId,
    role: Role,
    cancel: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            envelope = subscription.recv() => envelope,
            _ = cancel.cancelled() => return,
        };
        let Some(envelope) = envelope else { return };
        deliver(&sink, connection_id, role, envelope).await;
    }
}

async fn deliver(sink: &ConnectionSink, connection_id: ConnectionId, role: Role, envelope: Envelope) {
    if envelope.sender_channel == connection_id {
        return;
    }
    if envelope.sender_role == Role::Operator && role != Role::Patient {
        return;
    }

    if envelope.sender_role == Role::Ai {
        if is_escalation(&envelope.data) {
            ::metrics::counter!(METRICS_ID_BRIDGE_ESCALATION).increment(1);
        }
        let (msg, data) = if role == Role::Operator {
            (blank_if_present(envelope.msg), blank_content(envelope.data))
        } else {
            (envelope.msg, envelope.data)
        };
        ::metrics::counter!(METRICS_ID_FANOUT_DELIVER).increment(1);
        let _ = sink
            .send_frame(&ServerFrame::Broadcast {
                user_type: envelope.sender_role.as_str(),
                msg,
                data,
            })
            .await;
        return;
    }

    ::metrics::counter!(METRICS_ID_FANOUT_DELIVER).increment(1);
    let _ = sink
        .send_frame(&ServerFrame::SessionMessage {
            user_type: envelope.sender_role.as_str(),
            msg: envelope.msg,
            data: envelope.data,
        })
        .await;
}

/// Whether an AI-origin envelope carries an `escalation` event with
/// `should_escalate == true` (§4.4.3), for the escalation-count metric.
fn is_escalation(data: &Option<serde_json::Value>) -> bool {
    data.as_ref().is_some_and(|value| {
        value.get("type").and_then(serde_json::Value::as_str) == Some("escalation")
            && value
                .get("should_escalate")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false)
    })
}

fn blank_if_present(msg: Option<String>) -> Option<String> {
    msg.map(|_| String::new())
}

fn blank_content(data: Option<serde_json::Value>) -> Option<serde_json::Value> {
    data.map(|mut value| {
        if let Some(object) = value.as_object_mut()
            && object.contains_key("content")
        {
            object.insert("content".to_owned(), serde_json::Value::String(String::new()));
        }
        value
    })
}

/// Reads frames after admission, dispatching control messages (`hello`,
/// `presence`, `broadcast`) and echoing anything else (§4.3.3).
async fn read_loop(
    stream: &mut futures::stream::SplitStream<WebSocket>,
    sink: &ConnectionSink,
    state: &HubState,
    session_id: &SessionId,
    connection_id: ConnectionId,
    role: Role,
) {
    loop {
        let text = match stream.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => continue,
            Some(Err(_)) => return,
        };

        if state.presence.refresh(session_id, &connection_id).is_err() {
            state.presence.upsert(session_id, connection_id, role);
        }

        match parse_client_frame(&text) {
            ParsedClientFrame::Known(ClientFrame::Hello { .. }) => {
                let _ = sink
                    .send_frame(&ServerFrame::HelloAck {
                        session_id: session_id.clone(),
                        connection_id,
                        user_type: role.as_str(),
                    })
                    .await;
            }
            ParsedClientFrame::Known(ClientFrame::Presence) => {
                send_presence(sink, state, session_id).await;
            }
            ParsedClientFrame::Known(ClientFrame::Broadcast { msg, data }) => {
                state.bus.publish(
                    session_id,
                    Envelope {
                        sender_role: role,
                        sender_channel: connection_id,
                        msg,
                        data,
                    },
                );
            }
            ParsedClientFrame::Unknown(value) => {
                let _ = sink.send_frame(&ServerFrame::Echo { data: value }).await;
            }
            ParsedClientFrame::InvalidJson => {
                let _ = sink
                    .send_frame(&ServerFrame::Error {
                        error: "invalid_json",
                        detail: None,
                    })
                    .await;
            }
        }
    }
}

async fn send_presence(sink: &ConnectionSink, state: &HubState, session_id: &SessionId) {
    let snapshot = state.presence.list(session_id);
    let mut by_type = std::collections::BTreeMap::new();
    for role in [Role::Patient, Role::Operator, Role::Ai] {
        let count = snapshot.count_by_role(role);
        if count > 0 {
            by_type.insert(role.as_str(), count);
        }
    }
    let members = snapshot
        .members
        .iter()
        .map(|(connection_id, record)| PresenceMemberWire {
            connection_id: *connection_id,
            user_type: record.role.as_str(),
            connected_at: record.connected_at,
            last_seen: record.last_seen,
        })
        .collect();
    let _ = sink
        .send_frame(&ServerFrame::Presence {
            session_id: session_id.clone(),
            count: snapshot.count(),
            by_type,
            members,
        })
        .await;
}
