#![deny(missing_docs)]
//! Shared wire types for the chat-relay system.
//!
//! This crate groups together the types passed across the boundaries of the
//! relay: session and connection identifiers (see [`ids`]), the admission
//! [`role`], the client/server WebSocket frames (see [`wire`]), the DTOs and
//! streamed events exchanged with the generation collaborator (see
//! [`collaborator`]), and the application-level WebSocket close codes (see
//! [`error_codes`]).
//!
//! Use these types to pass, store, and (de)serialize relay messages in a
//! type-safe way throughout the hub, the bridge and the collaborator client.

pub mod collaborator;
pub mod error_codes;
pub mod ids;
pub mod role;
pub mod wire;

pub use ids::{ConnectionId, SessionId};
pub use role::Role;
