//! Stateful services owned by the hub: presence tracking, fan-out and
//! per-connection send serialization.

pub mod connections;
pub mod fanout_bus;
pub mod presence_store;
