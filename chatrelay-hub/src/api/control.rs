//! The HTTP control plane (spec component C5): `/thread/connect`,
//! `/thread/summarize`, `/thread/history`, `/chat/sms`.
//!
//! Grounded on [`views.py`](../../../examples/original_source/ws_server/realtime/views.py):
//! each handler gates on the shared secret, parses a JSON body permissively
//! (`{}` when the body is empty), validates `thread_id` is non-empty, then
//! either calls the bridge directly (`thread/connect`) or proxies to the
//! generation collaborator, mapping failures through [`HttpError`].

use std::time::Instant;

use axum::{Json, body::Bytes, extract::State, http::HeaderMap, routing::post};
use chatrelay_types::SessionId;
use serde::{Deserialize, Serialize};

use crate::{
    HubState,
    api::errors::HttpError,
    metrics::{
        METRICS_ID_BRIDGE_START, METRICS_ID_COLLABORATOR_CALL_DURATION,
        METRICS_ID_COLLABORATOR_CALL_RESULT,
    },
};

/// Builds the four control-plane routes.
pub(crate) fn routes() -> axum::Router<HubState> {
    axum::Router::new()
        .route("/thread/connect", post(thread_connect))
        .route("/thread/summarize", post(thread_summarize))
        .route("/thread/history", post(thread_history))
        .route("/chat/sms", post(chat_sms))
}

#[derive(Debug, Default, Deserialize)]
struct ThreadConnectBody {
    #[serde(default)]
    thread_id: String,
    #[serde(default)]
    user_type: Option<String>,
}

#[derive(Serialize)]
struct ThreadConnectResponse {
    status: &'static str,
    thread_id: String,
    llm_connected: bool,
}

async fn thread_connect(
    State(state): State<HubState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ThreadConnectResponse>, HttpError> {
    require_auth(&headers, &state)?;
    let body: ThreadConnectBody = parse_json(&body)?;
    let thread_id = require_thread_id(&body.thread_id)?;

    let user_type = body.user_type.as_deref().unwrap_or("").trim().to_ascii_lowercase();
    if user_type == "operator" {
        return Ok(Json(ThreadConnectResponse {
            status: "ok",
            thread_id: thread_id.to_owned(),
            llm_connected: false,
        }));
    }

    let session_id = SessionId::sanitize(thread_id);
    match state
        .bridge_registry
        .start(session_id, state.bridge_config.clone(), state.collaborator.clone())
    {
        Ok(outcome) => {
            ::metrics::counter!(METRICS_ID_BRIDGE_START, "outcome" => bridge_outcome_label(outcome))
                .increment(1);
            Ok(Json(ThreadConnectResponse {
                status: "ok",
                thread_id: thread_id.to_owned(),
                llm_connected: true,
            }))
        }
        Err(err) => {
            ::metrics::counter!(METRICS_ID_BRIDGE_START, "outcome" => "error").increment(1);
            Err(HttpError::BadRequest(err.to_string()))
        }
    }
}

fn bridge_outcome_label(outcome: chatrelay_bridge::StartOutcome) -> &'static str {
    match outcome {
        chatrelay_bridge::StartOutcome::Started => "started",
        chatrelay_bridge::StartOutcome::AlreadyActive => "already_active",
    }
}

#[derive(Debug, Default, Deserialize)]
struct ThreadIdBody {
    #[serde(default)]
    thread_id: String,
}

#[derive(Serialize)]
struct SummarizeResponse {
    thread_id: String,
    summary: String,
}

async fn thread_summarize(
    State(state): State<HubState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SummarizeResponse>, HttpError> {
    require_auth(&headers, &state)?;
    let body: ThreadIdBody = parse_json(&body)?;
    let thread_id = require_thread_id(&body.thread_id)?;

    let response = timed_call("summarize", state.collaborator.summarize(thread_id)).await?;
    Ok(Json(SummarizeResponse {
        thread_id: response.thread_id,
        summary: response.summary,
    }))
}

#[derive(Serialize)]
struct HistoryResponse {
    thread_id: String,
    messages: Vec<chatrelay_types::collaborator::HistoryMessage>,
}

async fn thread_history(
    State(state): State<HubState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<HistoryResponse>, HttpError> {
    require_auth(&headers, &state)?;
    let body: ThreadIdBody = parse_json(&body)?;
    let thread_id = require_thread_id(&body.thread_id)?;

    let messages = timed_call("history", state.collaborator.history(thread_id)).await?;
    Ok(Json(HistoryResponse {
        thread_id: thread_id.to_owned(),
        messages: stabilize_history(thread_id, messages),
    }))
}

/// Assigns a deterministic fallback id to any message the collaborator
/// returned without one, then re-derives `previous_message_id` from the
/// returned order so the chain is internally consistent regardless of what
/// the collaborator reported (§4.2 "history id stability").
fn stabilize_history(
    thread_id: &str,
    mut messages: Vec<chatrelay_types::collaborator::HistoryMessage>,
) -> Vec<chatrelay_types::collaborator::HistoryMessage> {
    for (index, message) in messages.iter_mut().enumerate() {
        if message.id.trim().is_empty() {
            message.id = fallback_history_id(thread_id, index, &message.content);
        }
    }
    let mut previous = None;
    for message in messages.iter_mut() {
        message.previous_message_id = previous.clone();
        previous = Some(message.id.clone());
    }
    messages
}

fn fallback_history_id(thread_id: &str, index: usize, content: &str) -> String {
    use std::hash::{Hash as _, Hasher as _};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    thread_id.hash(&mut hasher);
    index.hash(&mut hasher);
    content.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[derive(Debug, Default, Deserialize)]
struct SmsChatBody {
    #[serde(default)]
    thread_id: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    invoice: Option<serde_json::Value>,
    #[serde(default)]
    webapp_link: Option<String>,
}

#[derive(Serialize)]
struct SmsChatResponse {
    thread_id: String,
    message: String,
}

async fn chat_sms(
    State(state): State<HubState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SmsChatResponse>, HttpError> {
    require_auth(&headers, &state)?;
    let body: SmsChatBody = parse_json(&body)?;
    let thread_id = require_thread_id(&body.thread_id)?;

    let request = chatrelay_types::collaborator::SmsChatRequest {
        thread_id: thread_id.to_owned(),
        message: body.message,
        invoice: body.invoice,
        webapp_link: body.webapp_link,
    };
    let message = timed_call("chat_sms", state.collaborator.chat_sms(request)).await?;
    Ok(Json(SmsChatResponse {
        thread_id: thread_id.to_owned(),
        message,
    }))
}

fn require_auth(headers: &HeaderMap, state: &HubState) -> Result<(), HttpError> {
    if super::auth::check_http(headers, state.config.shared_secret.as_ref()) {
        Ok(())
    } else {
        Err(HttpError::Unauthorized)
    }
}

fn require_thread_id(thread_id: &str) -> Result<&str, HttpError> {
    let trimmed = thread_id.trim();
    if trimmed.is_empty() {
        Err(HttpError::BadRequest("thread_id is required".to_owned()))
    } else {
        Ok(trimmed)
    }
}

fn parse_json<T: serde::de::DeserializeOwned + Default>(body: &[u8]) -> Result<T, HttpError> {
    if body.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|_| HttpError::BadRequest("Invalid JSON".to_owned()))
}

async fn timed_call<T>(
    endpoint: &'static str,
    future: impl std::future::Future<Output = Result<T, chatrelay_collaborator_client::Error>>,
) -> Result<T, HttpError> {
    let start = Instant::now();
    let result = future.await;
    ::metrics::histogram!(METRICS_ID_COLLABORATOR_CALL_DURATION, "endpoint" => endpoint)
        .record(start.elapsed().as_millis() as f64);
    ::metrics::counter!(
        METRICS_ID_COLLABORATOR_CALL_RESULT,
        "endpoint" => endpoint,
        "result" => if result.is_ok() { "ok" } else { "error" }
    )
    .increment(1);
    result.map_err(HttpError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatrelay_types::collaborator::HistoryMessage;

    fn message(id: &str, content: &str) -> HistoryMessage {
        HistoryMessage {
            kind: "patient".to_owned(),
            content: content.to_owned(),
            id: id.to_owned(),
            sent_at: None,
            read_at: None,
            previous_message_id: Some("stale".to_owned()),
        }
    }

    #[test]
    fn stabilize_history_chains_previous_message_ids() {
        let messages = vec![message("a", "hi"), message("b", "there"), message("c", "!")];
        let chained = stabilize_history("t1", messages);
        assert_eq!(chained[0].previous_message_id, None);
        assert_eq!(chained[1].previous_message_id, Some("a".to_owned()));
        assert_eq!(chained[2].previous_message_id, Some("b".to_owned()));
    }

    #[test]
    fn stabilize_history_fills_in_missing_ids_deterministically() {
        let a = message("", "hi");
        let run1 = stabilize_history("t1", vec![a.clone()]);
        let run2 = stabilize_history("t1", vec![a.clone()]);
        assert!(!run1[0].id.is_empty());
        assert_eq!(run1[0].id, run2[0].id, "identical inputs must yield identical ids");

        let mut b = a;
        b.content = "different".to_owned();
        let run3 = stabilize_history("t1", vec![b]);
        assert_ne!(run1[0].id, run3[0].id);
    }
}
