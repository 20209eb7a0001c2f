#![deny(missing_docs)]
//! The session hub: the relay's always-on process composing presence
//! tracking (C1), the fan-out bus (C2), the session WebSocket endpoint (C3),
//! and the HTTP control plane (C5) into one `axum::Router`.
//!
//! [`build_router`] wires shared services into handler state and spawns the
//! background tasks the hub needs, returning a ready-to-serve router rather
//! than a binary that also owns its own CLI parsing or shutdown plumbing
//! (that lives in the `chatrelay-server` binary crate).

use std::sync::Arc;

use axum::Router;
use chatrelay_bridge::{BridgeConfig, BridgeRegistry};
use chatrelay_collaborator_client::CollaboratorService;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

pub mod config;
pub mod metrics;

mod api;
mod services;

use config::RelayConfig;
use services::{
    fanout_bus::{FanoutBus, InMemoryFanoutBus},
    presence_store::{InMemoryPresenceStore, PresenceService, PresenceStore},
};

/// Shared application state threaded through every axum handler.
#[derive(Clone)]
pub(crate) struct HubState {
    /// CLI/environment configuration for this relay instance.
    pub(crate) config: Arc<RelayConfig>,
    /// Presence tracking (C1), behind a trait object.
    pub(crate) presence: PresenceService,
    /// Per-session fan-out bus (C2), behind a trait object.
    pub(crate) bus: Arc<dyn FanoutBus>,
    /// Client for the generation collaborator (§6).
    pub(crate) collaborator: CollaboratorService,
    /// Registry of in-flight worker bridges (C4).
    pub(crate) bridge_registry: BridgeRegistry,
    /// Shared connection settings the bridge dials back in with.
    pub(crate) bridge_config: Arc<BridgeConfig>,
}

/// Builds the hub's `axum::Router` and spawns its background presence-sweep
/// task (C1).
///
/// `cancellation_token` governs both the sweep task spawned here and every
/// per-connection task the router's handlers spawn; dropping or cancelling
/// it is how the composition root (`chatrelay-server`) unwinds the hub
/// during graceful shutdown.
pub fn build_router(
    config: RelayConfig,
    collaborator: CollaboratorService,
    bridge_registry: BridgeRegistry,
    cancellation_token: CancellationToken,
) -> Router {
    metrics::describe_metrics();

    let presence: PresenceService = Arc::new(InMemoryPresenceStore::new());
    let bus: Arc<dyn FanoutBus> = Arc::new(InMemoryFanoutBus::new());
    let ttl = config.presence_ttl;
    let sweep_interval = config.presence_refresh_interval;

    let bridge_config = Arc::new(BridgeConfig {
        relay_url: config.relay_url.clone(),
        relay_origin: config.relay_origin.clone(),
        shared_secret: config.shared_secret.clone(),
    });

    let state = HubState {
        config: Arc::new(config),
        presence: presence.clone(),
        bus,
        collaborator,
        bridge_registry,
        bridge_config,
    };

    tokio::spawn(presence_sweep_task(presence, ttl, sweep_interval, cancellation_token));

    Router::new()
        .merge(api::health::routes())
        .merge(api::ws::routes())
        .merge(api::control::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Periodically evicts presence records whose TTL has elapsed (§3). Runs at
/// `sweep_interval` cadence — the same cadence connections refresh at — so
/// no live session can be stale for longer than `ttl + sweep_interval`.
async fn presence_sweep_task(
    presence: PresenceService,
    ttl: std::time::Duration,
    sweep_interval: std::time::Duration,
    cancellation_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(sweep_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let touched = presence.sweep_expired(ttl);
                if !touched.is_empty() {
                    ::metrics::counter!(metrics::METRICS_ID_PRESENCE_EXPIRED).increment(touched.len() as u64);
                    tracing::debug!(sessions = touched.len(), "presence sweep evicted stale connections");
                }
            }
            _ = cancellation_token.cancelled() => return,
        }
    }
}
