//! Thin outbound WebSocket session used by the bridge to dial back into the
//! hub as the `ai` role (§4.4.2).
//!
//! A minimal wrapper around a `tokio-tungstenite` stream that serializes one
//! message type on send and classifies frames on read, closing on any
//! unexpected shape on a best-effort basis. Speaks JSON over `Text` frames,
//! matching the hub's own wire format (§6).

use chatrelay_types::wire::ClientFrame;
use futures::{SinkExt as _, StreamExt as _};
use secrecy::{ExposeSecret as _, SecretString};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream,
    tungstenite::{
        self,
        client::IntoClientRequest as _,
        http::{HeaderValue, header},
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};

use crate::Error;

type Transport = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A frame received from the hub, classified just enough for the bridge's
/// receive loop (§4.4.2) to act on it. Any frame shape the bridge does not
/// care about collapses to [`InboundFrame::Other`] rather than failing to
/// parse (§9 "Dynamic JSON shapes": drop unknown variants, never throw).
#[derive(Debug)]
pub(crate) enum InboundFrame {
    /// The initial `connected` frame, sent before the role is latched.
    Connected,
    /// Acknowledges the bridge's `hello`.
    HelloAck,
    /// A human-origin fan-out delivery possibly carrying a chat payload.
    SessionMessage {
        /// The envelope's structured payload, if any.
        data: Option<Value>,
    },
    /// Any other recognized or unrecognized frame kind.
    Other,
}

/// One outbound connection to the hub, registered as the `ai` role.
pub(crate) struct BridgeSocket {
    inner: Transport,
}

impl BridgeSocket {
    /// Dials `{relay_url}/ws/session/{session_id}/`, presenting the shared
    /// secret as `X-API-KEY` and, if configured, an `Origin` header (§6).
    pub(crate) async fn connect(
        relay_url: &str,
        session_id: &str,
        relay_origin: Option<&str>,
        shared_secret: Option<&SecretString>,
    ) -> Result<Self, Error> {
        let endpoint = ws_endpoint(relay_url, session_id);
        let mut request = endpoint.into_client_request().map_err(Error::InvalidUrl)?;
        let headers = request.headers_mut();
        if let Some(secret) = shared_secret {
            headers.insert(
                "x-api-key",
                HeaderValue::from_str(secret.expose_secret()).map_err(|_| Error::InvalidSecret)?,
            );
        }
        if let Some(origin) = relay_origin {
            headers.insert(
                header::ORIGIN,
                HeaderValue::from_str(origin).map_err(|_| Error::InvalidSecret)?,
            );
        }
        let (inner, _response) = tokio_tungstenite::connect_async(request).await?;
        Ok(Self { inner })
    }

    /// Sends a [`ClientFrame`] as a single JSON text message.
    pub(crate) async fn send(&mut self, frame: &ClientFrame) -> Result<(), Error> {
        let text = serde_json::to_string(frame).expect("ClientFrame always serializes");
        if let Err(err) = self.inner.send(tungstenite::Message::text(text)).await {
            let _ = self.close_with(CloseCode::Error, "error during ws send").await;
            return Err(Error::Transport(err));
        }
        Ok(())
    }

    /// Reads and classifies the next frame. Returns `Ok(None)` once the
    /// peer has cleanly closed the connection.
    pub(crate) async fn recv(&mut self) -> Result<Option<InboundFrame>, Error> {
        loop {
            match self.inner.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    return Ok(Some(classify(&text)));
                }
                Some(Ok(tungstenite::Message::Binary(_))) => {
                    // the bridge never expects binary frames from the hub;
                    // treat them like any other frame we don't act on.
                    continue;
                }
                Some(Ok(tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_))) => {
                    continue;
                }
                Some(Ok(tungstenite::Message::Close(_))) => {
                    let _ = self.inner.close(None).await;
                    return Ok(None);
                }
                Some(Ok(tungstenite::Message::Frame(_))) => continue,
                Some(Err(err)) => {
                    let _ = self
                        .close_with(CloseCode::Error, &err.to_string())
                        .await;
                    return Err(Error::Transport(err));
                }
                None => return Ok(None),
            }
        }
    }

    /// Gracefully closes the connection (§4.4.2 step 3: "after draining the
    /// current generation, close the socket and exit the loop").
    pub(crate) async fn close(mut self) {
        let _ = self.close_with(CloseCode::Normal, "turn complete").await;
    }

    async fn close_with(&mut self, code: CloseCode, reason: &str) -> Result<(), Error> {
        self.inner
            .close(Some(CloseFrame {
                code,
                reason: reason.to_owned().into(),
            }))
            .await
            .map_err(Error::Transport)
    }
}

fn ws_endpoint(relay_url: &str, session_id: &str) -> String {
    let base = relay_url
        .trim_end_matches('/')
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1);
    format!("{base}/ws/session/{session_id}/")
}

fn classify(text: &str) -> InboundFrame {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return InboundFrame::Other;
    };
    match value.get("type").and_then(Value::as_str) {
        Some("connected") => InboundFrame::Connected,
        Some("hello_ack") => InboundFrame::HelloAck,
        Some("session_message") => InboundFrame::SessionMessage {
            data: value.get("data").cloned(),
        },
        _ => InboundFrame::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_endpoint_rewrites_scheme_and_appends_path() {
        assert_eq!(
            ws_endpoint("http://localhost:8080", "abc"),
            "ws://localhost:8080/ws/session/abc/"
        );
        assert_eq!(
            ws_endpoint("https://relay.example/", "abc"),
            "wss://relay.example/ws/session/abc/"
        );
    }

    #[test]
    fn classify_recognizes_known_frame_types() {
        assert!(matches!(classify(r#"{"type":"connected"}"#), InboundFrame::Connected));
        assert!(matches!(classify(r#"{"type":"hello_ack"}"#), InboundFrame::HelloAck));
        assert!(matches!(
            classify(r#"{"type":"session_message","data":{"type":"chat"}}"#),
            InboundFrame::SessionMessage { data: Some(_) }
        ));
        assert!(matches!(classify("not json"), InboundFrame::Other));
        assert!(matches!(classify(r#"{"type":"echo"}"#), InboundFrame::Other));
    }
}
