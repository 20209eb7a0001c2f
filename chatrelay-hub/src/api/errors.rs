//! Error types for both surfaces of the hub: the WebSocket session endpoint
//! (§4.3.6/§7, mapped to a [`axum::extract::ws::CloseFrame`]) and the HTTP
//! control plane (§6, mapped to a JSON `{"detail": ...}` body and status
//! code).

use axum::{
    Json,
    extract::ws::{CloseFrame, close_code},
    http::StatusCode,
    response::IntoResponse,
};
use chatrelay_types::error_codes::CLOSE_ADMISSION_FAILED;
use serde::Serialize;
use tracing::instrument;

/// Errors that can terminate a session WebSocket connection.
#[derive(Debug, thiserror::Error)]
pub(crate) enum WsError {
    /// The shared-secret gate rejected the connection.
    #[error("admission denied: {0}")]
    AdmissionDenied(&'static str),
    /// The first inbound message was not a well-formed `hello`, or a
    /// `broadcast` arrived before admission.
    #[error("admission failed: {0}")]
    AdmissionFailed(String),
    /// The peer closed the connection or the transport otherwise failed.
    #[error("connection closed")]
    ConnectionClosed,
    #[error(transparent)]
    Axum(#[from] axum::Error),
}

impl WsError {
    /// Maps the error to a close frame, or `None` if nothing should be sent
    /// (the peer is already gone).
    #[instrument(level = "debug", skip_all)]
    pub(crate) fn into_close_frame(self) -> Option<CloseFrame> {
        tracing::debug!("{self:?}");
        match self {
            WsError::ConnectionClosed => None,
            WsError::Axum(_) => Some(CloseFrame {
                code: close_code::ERROR,
                reason: "unexpected error".into(),
            }),
            WsError::AdmissionDenied(reason) => Some(CloseFrame {
                code: CLOSE_ADMISSION_FAILED,
                reason: reason.into(),
            }),
            WsError::AdmissionFailed(reason) => Some(CloseFrame {
                code: CLOSE_ADMISSION_FAILED,
                reason: reason.into(),
            }),
        }
    }
}

/// Errors surfaced by the four HTTP control-plane endpoints (§6/§7).
#[derive(Debug, thiserror::Error)]
pub(crate) enum HttpError {
    /// Missing or incorrect `X-API-KEY`.
    #[error("missing or invalid X-API-KEY")]
    Unauthorized,
    /// Malformed JSON body or an empty required field.
    #[error("{0}")]
    BadRequest(String),
    /// The collaborator was reachable but responded with an error, or the
    /// call itself failed (connect, timeout, TLS).
    #[error("collaborator unreachable: {0}")]
    CollaboratorUnreachable(String),
    /// No collaborator base URL is configured for this deployment.
    #[error("collaborator endpoint not configured")]
    CollaboratorNotConfigured,
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            HttpError::Unauthorized => StatusCode::UNAUTHORIZED,
            HttpError::BadRequest(_) => StatusCode::BAD_REQUEST,
            HttpError::CollaboratorUnreachable(_) => StatusCode::BAD_GATEWAY,
            HttpError::CollaboratorNotConfigured => StatusCode::SERVICE_UNAVAILABLE,
        };
        (
            status,
            Json(ErrorBody {
                detail: self.to_string(),
            }),
        )
            .into_response()
    }
}

impl From<chatrelay_collaborator_client::Error> for HttpError {
    fn from(value: chatrelay_collaborator_client::Error) -> Self {
        match value {
            chatrelay_collaborator_client::Error::NotConfigured => {
                HttpError::CollaboratorNotConfigured
            }
            other => HttpError::CollaboratorUnreachable(other.to_string()),
        }
    }
}
