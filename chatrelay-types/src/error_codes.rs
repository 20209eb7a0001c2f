//! Application-level WebSocket close codes used by the hub.
//!
//! These live in the `4000..=4999` private-use range reserved by RFC 6455
//! for application protocols, so they never collide with codes the
//! `tokio-tungstenite`/browser stack assigns on its own.

/// The admission handshake failed: missing/invalid shared secret, or the
/// first message after connect was not a well-formed `hello`.
pub const CLOSE_ADMISSION_FAILED: u16 = 4401;
