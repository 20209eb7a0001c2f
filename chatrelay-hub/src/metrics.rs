//! Metrics definitions for the chat relay.
//!
//! Mirrors the reference template's `metrics.rs`: one `const` per metric key
//! plus a [`describe_metrics`] that registers metadata for all of them via
//! the `metrics` crate's `describe_*` macros.

/// Number of currently admitted connections, by role.
pub const METRICS_ID_CONNECTIONS_OPEN: &str = "chatrelay.hub.connections.open";
/// Number of admission attempts rejected by the shared-secret gate.
pub const METRICS_ID_ADMISSION_REJECTED: &str = "chatrelay.hub.admission.rejected";
/// Duration of presence-store operations.
pub const METRICS_ID_PRESENCE_OP_DURATION: &str = "chatrelay.hub.presence.op.duration";
/// Count of presence-store operation outcomes.
pub const METRICS_ID_PRESENCE_OP_RESULT: &str = "chatrelay.hub.presence.op.result";
/// Count of presence records expired by the background sweep.
pub const METRICS_ID_PRESENCE_EXPIRED: &str = "chatrelay.hub.presence.expired";
/// Count of fan-out publications.
pub const METRICS_ID_FANOUT_PUBLISH: &str = "chatrelay.hub.fanout.publish";
/// Count of fan-out deliveries to individual subscribers.
pub const METRICS_ID_FANOUT_DELIVER: &str = "chatrelay.hub.fanout.deliver";
/// Count of fan-out deliveries dropped (lagging subscriber, closed group).
pub const METRICS_ID_FANOUT_DROPPED: &str = "chatrelay.hub.fanout.dropped";
/// Count of worker-bridge start requests by outcome (`started`, `already_active`, `error`).
pub const METRICS_ID_BRIDGE_START: &str = "chatrelay.hub.bridge.start";
/// Count of turns that ended in escalation.
pub const METRICS_ID_BRIDGE_ESCALATION: &str = "chatrelay.hub.bridge.escalation";
/// Duration of collaborator HTTP calls, by endpoint.
pub const METRICS_ID_COLLABORATOR_CALL_DURATION: &str = "chatrelay.hub.collaborator.call.duration";
/// Count of collaborator HTTP call outcomes, by endpoint and result.
pub const METRICS_ID_COLLABORATOR_CALL_RESULT: &str = "chatrelay.hub.collaborator.call.result";

/// Registers metadata for all metrics this crate emits.
pub fn describe_metrics() {
    metrics::describe_gauge!(
        METRICS_ID_CONNECTIONS_OPEN,
        metrics::Unit::Count,
        "Number of currently admitted WebSocket connections"
    );
    metrics::describe_counter!(
        METRICS_ID_ADMISSION_REJECTED,
        metrics::Unit::Count,
        "Number of admission attempts rejected by the shared-secret gate or role handshake"
    );
    metrics::describe_histogram!(
        METRICS_ID_PRESENCE_OP_DURATION,
        metrics::Unit::Milliseconds,
        "Duration of presence-store operations"
    );
    metrics::describe_counter!(
        METRICS_ID_PRESENCE_OP_RESULT,
        metrics::Unit::Count,
        "Outcome of presence-store operations"
    );
    metrics::describe_counter!(
        METRICS_ID_PRESENCE_EXPIRED,
        metrics::Unit::Count,
        "Number of presence records removed by TTL expiry"
    );
    metrics::describe_counter!(
        METRICS_ID_FANOUT_PUBLISH,
        metrics::Unit::Count,
        "Number of envelopes published to the fan-out bus"
    );
    metrics::describe_counter!(
        METRICS_ID_FANOUT_DELIVER,
        metrics::Unit::Count,
        "Number of envelopes delivered to individual subscribers"
    );
    metrics::describe_counter!(
        METRICS_ID_FANOUT_DROPPED,
        metrics::Unit::Count,
        "Number of envelope deliveries dropped (lag or unsubscribed group)"
    );
    metrics::describe_counter!(
        METRICS_ID_BRIDGE_START,
        metrics::Unit::Count,
        "Outcome of worker-bridge start requests"
    );
    metrics::describe_counter!(
        METRICS_ID_BRIDGE_ESCALATION,
        metrics::Unit::Count,
        "Number of bridge turns that ended in escalation"
    );
    metrics::describe_histogram!(
        METRICS_ID_COLLABORATOR_CALL_DURATION,
        metrics::Unit::Milliseconds,
        "Duration of HTTP calls to the generation collaborator"
    );
    metrics::describe_counter!(
        METRICS_ID_COLLABORATOR_CALL_RESULT,
        metrics::Unit::Count,
        "Outcome of HTTP calls to the generation collaborator"
    );
}
