//! Per-connection send serialization and open-connection accounting.
//!
//! Concurrent deliveries can target the same socket from two independent
//! tasks: the connection's own read loop (replying to `hello`/`presence`/
//! unknown frames) and the fan-out forwarder relaying envelopes published by
//! other sessions' participants. Axum's `WebSocket` sink is not `Sync`-safe
//! for concurrent `send` calls, so both tasks share one [`ConnectionSink`]
//! guarded by a local `tokio::sync::Mutex` — a lock per connection, never a
//! global one (§9 "Per-connection serialization of sends").
//!
//! [`ConnectionGuard`] is a plain RAII accounting guard: it increments a
//! gauge on creation and decrements it on drop, so the connection count
//! metric can never drift from reality regardless of which path (clean
//! close, error, panic unwind) tears the connection down.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use chatrelay_types::wire::ServerFrame;
use futures::{SinkExt as _, stream::SplitSink};
use tokio::sync::Mutex;

use crate::metrics::METRICS_ID_CONNECTIONS_OPEN;

/// The writable half of a connection's WebSocket, serialized behind a mutex
/// so frames from different producer tasks never interleave on the wire.
#[derive(Clone)]
pub(crate) struct ConnectionSink {
    inner: Arc<Mutex<SplitSink<WebSocket, Message>>>,
}

impl ConnectionSink {
    /// Wraps the sink half of an accepted WebSocket.
    pub(crate) fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(sink)),
        }
    }

    /// Serializes `frame` as JSON and sends it as a single text message.
    pub(crate) async fn send_frame(&self, frame: &ServerFrame) -> Result<(), axum::Error> {
        let text = serde_json::to_string(frame).expect("ServerFrame always serializes");
        let mut guard = self.inner.lock().await;
        guard.send(Message::text(text)).await
    }

    /// Sends a raw close frame, best-effort (errors are not reported: by the
    /// time we want to close, the peer may already be gone).
    pub(crate) async fn close(&self, frame: axum::extract::ws::CloseFrame) {
        let mut guard = self.inner.lock().await;
        let _ = guard.send(Message::Close(Some(frame))).await;
    }
}

/// RAII handle tracking one admitted connection against the
/// [`METRICS_ID_CONNECTIONS_OPEN`] gauge. Created on socket accept, dropped
/// on disconnect regardless of cause.
pub(crate) struct ConnectionGuard;

impl ConnectionGuard {
    /// Registers a newly accepted connection.
    pub(crate) fn new() -> Self {
        ::metrics::gauge!(METRICS_ID_CONNECTIONS_OPEN).increment(1.0);
        Self
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        ::metrics::gauge!(METRICS_ID_CONNECTIONS_OPEN).decrement(1.0);
    }
}
