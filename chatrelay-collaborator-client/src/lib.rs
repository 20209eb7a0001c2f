#![deny(missing_docs)]
//! HTTP client for the generation collaborator: the external subsystem that
//! owns prompt templates, model invocation, guardrails and the conversation
//! checkpoint store, reached only through the four RPCs and one streaming
//! endpoint described in §6.
//!
//! The [`CollaboratorClient`] trait is the seam the hub's control plane and
//! the bridge code against; [`HttpCollaboratorClient`] is the only
//! production implementation, but tests substitute a mock.

use std::time::Duration;

use async_trait::async_trait;
use chatrelay_types::collaborator::{
    ChatRequest, HistoryMessage, SmsChatRequest, SmsChatResponse, StreamEvent, SummarizeRequest,
    SummarizeResponse, ThreadConnectRequest, ThreadConnectResponse, ThreadHistoryRequest,
    ThreadHistoryResponse,
};
use futures::{Stream, StreamExt as _, TryStreamExt as _};
use secrecy::{ExposeSecret as _, SecretString};

/// Errors produced while calling the collaborator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The collaborator endpoint is not configured for this operation.
    #[error("collaborator endpoint not configured")]
    NotConfigured,
    /// The HTTP call itself failed (connect, timeout, TLS, ...).
    #[error("collaborator request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The collaborator responded with a non-success status.
    #[error("collaborator returned status {status}: {body}")]
    Status {
        /// The HTTP status code returned.
        status: u16,
        /// The response body, truncated for logging.
        body: String,
    },
    /// A line of the streamed response was not valid JSON / not a known
    /// [`StreamEvent`] variant.
    #[error("malformed stream event: {0}")]
    MalformedEvent(String),
}

/// The durations a [`CollaboratorClient`] call is bounded by.
///
/// Mirrors the per-endpoint defaults fixed by §5/§10.1 so every call site
/// shares one source of truth instead of hard-coding timeouts.
#[derive(Debug, Clone, Copy)]
pub struct CollaboratorTimeouts {
    /// Bound for `thread/connect`.
    pub thread_connect: Duration,
    /// Bound for `thread/history`.
    pub thread_history: Duration,
    /// Bound for `summarize`.
    pub summarize: Duration,
    /// Bound for `chat/sms`.
    pub chat_sms: Duration,
}

impl Default for CollaboratorTimeouts {
    fn default() -> Self {
        Self {
            thread_connect: Duration::from_secs(10),
            thread_history: Duration::from_secs(30),
            summarize: Duration::from_secs(60),
            chat_sms: Duration::from_secs(60),
        }
    }
}

/// Dynamic trait object for the collaborator client, shared across the hub's
/// control-plane handlers and the bridge's connection loop.
pub type CollaboratorService = std::sync::Arc<dyn CollaboratorClient + Send + Sync>;

/// The generation collaborator's external surface, as consumed by this
/// relay. Every method maps to exactly one RPC of §6; none of them retry
/// internally, callers decide whether a failure is fatal.
#[async_trait]
pub trait CollaboratorClient {
    /// `POST /thread/connect` — ensures a worker is attached to `thread_id`.
    async fn thread_connect(&self, thread_id: &str) -> Result<ThreadConnectResponse, Error>;

    /// `POST /thread/summarize` — summarizes the named thread.
    async fn summarize(&self, thread_id: &str) -> Result<SummarizeResponse, Error>;

    /// `POST /thread/history` — fetches the reconstructed message history.
    async fn history(&self, thread_id: &str) -> Result<Vec<HistoryMessage>, Error>;

    /// `POST /chat/sms` — a single-shot, non-streaming reply.
    async fn chat_sms(&self, request: SmsChatRequest) -> Result<String, Error>;

    /// The streaming produce-reply operation consumed only by the bridge.
    /// Returns a stream of [`StreamEvent`]s in the order described by
    /// §4.4.3; the stream ends after the terminal `End` event or on error.
    async fn stream_reply(
        &self,
        request: ChatRequest,
    ) -> Result<std::pin::Pin<Box<dyn Stream<Item = Result<StreamEvent, Error>> + Send>>, Error>;
}

/// The production [`CollaboratorClient`], backed by `reqwest`.
pub struct HttpCollaboratorClient {
    http: reqwest::Client,
    base_url: String,
    shared_secret: Option<SecretString>,
    timeouts: CollaboratorTimeouts,
}

impl HttpCollaboratorClient {
    /// Builds a client for the collaborator hosted at `base_url`.
    ///
    /// `shared_secret`, if set, is sent as `X-API-KEY` on every call. The
    /// underlying `reqwest::Client` has no default timeout: every request
    /// is bounded individually via `timeouts` so a slow `thread/history`
    /// call can't be starved by a short default meant for `thread/connect`.
    pub fn new(
        base_url: impl Into<String>,
        shared_secret: Option<SecretString>,
        timeouts: CollaboratorTimeouts,
    ) -> eyre::Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            shared_secret,
            timeouts,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }

    fn request(&self, method: reqwest::Method, path: &str, timeout: Duration) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, self.url(path)).timeout(timeout);
        if let Some(secret) = &self.shared_secret {
            builder = builder.header("X-API-KEY", secret.expose_secret());
        }
        builder
    }

    async fn send_json<Req: serde::Serialize + ?Sized, Res: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        timeout: Duration,
        body: &Req,
    ) -> Result<Res, Error> {
        let response = self.request(method, path, timeout).json(body).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Status { status, body });
        }
        Ok(response.json::<Res>().await?)
    }
}

#[async_trait]
impl CollaboratorClient for HttpCollaboratorClient {
    async fn thread_connect(&self, thread_id: &str) -> Result<ThreadConnectResponse, Error> {
        self.send_json(
            reqwest::Method::POST,
            "/thread/connect",
            self.timeouts.thread_connect,
            &ThreadConnectRequest {
                thread_id: thread_id.to_owned(),
            },
        )
        .await
    }

    async fn summarize(&self, thread_id: &str) -> Result<SummarizeResponse, Error> {
        self.send_json(
            reqwest::Method::POST,
            "/thread/summarize",
            self.timeouts.summarize,
            &SummarizeRequest {
                thread_id: thread_id.to_owned(),
            },
        )
        .await
    }

    async fn history(&self, thread_id: &str) -> Result<Vec<HistoryMessage>, Error> {
        let response: ThreadHistoryResponse = self
            .send_json(
                reqwest::Method::POST,
                "/thread/history",
                self.timeouts.thread_history,
                &ThreadHistoryRequest {
                    thread_id: thread_id.to_owned(),
                },
            )
            .await?;
        Ok(response.messages)
    }

    async fn chat_sms(&self, request: SmsChatRequest) -> Result<String, Error> {
        let response: SmsChatResponse = self
            .send_json(reqwest::Method::POST, "/chat/sms", self.timeouts.chat_sms, &request)
            .await?;
        Ok(response.message)
    }

    async fn stream_reply(
        &self,
        request: ChatRequest,
    ) -> Result<std::pin::Pin<Box<dyn Stream<Item = Result<StreamEvent, Error>> + Send>>, Error> {
        let response = self
            .request(reqwest::Method::POST, "/chat/stream", self.timeouts.chat_sms)
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Status { status, body });
        }

        let byte_stream = response.bytes_stream().map_err(Error::from);
        let line_stream = ndjson_lines(byte_stream).map(|line| {
            let line = line?;
            serde_json::from_str::<StreamEvent>(&line)
                .map_err(|err| Error::MalformedEvent(format!("{err}: {line}")))
        });
        Ok(Box::pin(line_stream))
    }
}

/// Splits a byte stream on `\n` and yields complete, non-empty UTF-8 lines.
///
/// The collaborator's streaming endpoint is newline-delimited JSON, not SSE:
/// one [`StreamEvent`] object per line, no `data: ` prefix or blank
/// separators to strip.
fn ndjson_lines(
    chunks: impl Stream<Item = Result<bytes::Bytes, Error>> + Send + 'static,
) -> impl Stream<Item = Result<String, Error>> + Send + 'static {
    async_stream::try_stream! {
        let mut buf = Vec::new();
        futures::pin_mut!(chunks);
        while let Some(chunk) = chunks.next().await {
            buf.extend_from_slice(&chunk?);
            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
                if !line.trim().is_empty() {
                    yield line;
                }
            }
        }
        if !buf.is_empty() {
            let line = String::from_utf8_lossy(&buf).into_owned();
            if !line.trim().is_empty() {
                yield line;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatrelay_types::collaborator::Channel;

    #[tokio::test]
    async fn thread_connect_round_trips_against_a_mock_server() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/thread/connect"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"status": "connected", "thread_id": "s1"}),
            ))
            .mount(&server)
            .await;

        let client =
            HttpCollaboratorClient::new(server.uri(), None, CollaboratorTimeouts::default())
                .unwrap();
        let response = client.thread_connect("s1").await.unwrap();
        assert_eq!(response.status, "connected");
        assert_eq!(response.thread_id, "s1");
    }

    #[tokio::test]
    async fn non_success_status_is_reported_as_status_error() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/thread/summarize"))
            .respond_with(wiremock::ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client =
            HttpCollaboratorClient::new(server.uri(), None, CollaboratorTimeouts::default())
                .unwrap();
        let err = client.summarize("s1").await.unwrap_err();
        assert!(matches!(err, Error::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn stream_reply_parses_ndjson_events_in_order() {
        let server = wiremock::MockServer::start().await;
        let body = concat!(
            r#"{"type":"token","content":"hi"}"#,
            "\n",
            r#"{"type":"escalation","should_escalate":false}"#,
            "\n",
            r#"{"type":"end","content":""}"#,
            "\n",
        );
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/chat/stream"))
            .respond_with(
                wiremock::ResponseTemplate::new(200)
                    .set_body_raw(body, "application/x-ndjson"),
            )
            .mount(&server)
            .await;

        let client =
            HttpCollaboratorClient::new(server.uri(), None, CollaboratorTimeouts::default())
                .unwrap();
        let request = ChatRequest {
            thread_id: "s1".into(),
            message: "hi".into(),
            channel: Channel::Web,
            invoice: None,
            stripe_link: None,
            webapp_link: None,
        };
        let events: Vec<StreamEvent> = client
            .stream_reply(request)
            .await
            .unwrap()
            .try_collect::<Vec<_>>()
            .await
            .unwrap();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[2], StreamEvent::End { .. }));
    }
}
