//! Process-external pub/sub of per-session message groups (spec component
//! C2).
//!
//! Specified as a black box behind the [`FanoutBus`] trait: `subscribe`
//! joins a session's group, `publish` fans an [`Envelope`] out to every
//! subscriber of that group, including the publisher, in per-publisher
//! FIFO order, best-effort. [`InMemoryFanoutBus`] realizes that contract
//! with a per-session `tokio::sync::broadcast` channel; a networked broker
//! is a drop-in behind the same two operations. Group membership itself
//! needs no explicit "leave" call: a [`Subscription`] is a receiver handle,
//! and dropping it (on disconnect) is what "leaves on disconnect" means in
//! practice — the same RAII idiom used elsewhere in this crate for
//! connection and presence accounting, applied here to group membership
//! instead.

use std::{collections::HashMap, sync::Arc};

use chatrelay_types::{ConnectionId, Role, SessionId};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::metrics::{METRICS_ID_FANOUT_DROPPED, METRICS_ID_FANOUT_PUBLISH};

/// How many unconsumed envelopes a session group buffers before a lagging
/// subscriber starts missing messages. Sessions are small (§4.1 "single
/// digits typical"); this comfortably outpaces any plausible burst.
const GROUP_CAPACITY: usize = 256;

/// A message published to a session group, carrying enough provenance for
/// the hub's routing policy (§4.3.4) to decide, per recipient, whether and
/// how to deliver it.
#[derive(Debug, Clone)]
pub(crate) struct Envelope {
    /// The role of the connection that published this envelope.
    pub(crate) sender_role: Role,
    /// Opaque back-reference to the publishing connection, used to suppress
    /// self-delivery.
    pub(crate) sender_channel: ConnectionId,
    /// Free-text payload.
    pub(crate) msg: Option<String>,
    /// Structured payload.
    pub(crate) data: Option<Value>,
}

#[derive(Default)]
struct Groups {
    channels: HashMap<SessionId, broadcast::Sender<Envelope>>,
}

/// C2: process-external pub/sub of per-session message groups, reached
/// only through `subscribe`/`publish` so a networked broker can stand in
/// for the in-memory implementation without touching call sites.
pub(crate) trait FanoutBus: Send + Sync {
    /// Joins `session_id`'s group, creating it if this is the first member.
    fn subscribe(&self, session_id: &SessionId) -> Subscription;

    /// Publishes `envelope` to `session_id`'s group. A publish with no
    /// subscribers (group already torn down) is not an error: best-effort
    /// delivery means there is nobody to notify.
    fn publish(&self, session_id: &SessionId, envelope: Envelope);
}

/// The only [`FanoutBus`] implementation shipped here: a per-session
/// `tokio::sync::broadcast` channel held in memory by this process. Cheap
/// to clone (an `Arc` newtype).
#[derive(Clone, Default)]
pub(crate) struct InMemoryFanoutBus {
    inner: Arc<RwLock<Groups>>,
}

/// A connection's membership in one session group. Dropping it unsubscribes;
/// once the last subscription to a session is dropped the group's channel is
/// torn down so the session stops existing per the presence index (§3).
pub(crate) struct Subscription {
    session_id: SessionId,
    groups: Arc<RwLock<Groups>>,
    receiver: broadcast::Receiver<Envelope>,
}

impl InMemoryFanoutBus {
    /// Creates an empty bus.
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

impl FanoutBus for InMemoryFanoutBus {
    fn subscribe(&self, session_id: &SessionId) -> Subscription {
        let mut guard = self.inner.write();
        let sender = guard
            .channels
            .entry(session_id.clone())
            .or_insert_with(|| broadcast::channel(GROUP_CAPACITY).0)
            .clone();
        Subscription {
            session_id: session_id.clone(),
            groups: self.inner.clone(),
            receiver: sender.subscribe(),
        }
    }

    fn publish(&self, session_id: &SessionId, envelope: Envelope) {
        ::metrics::counter!(METRICS_ID_FANOUT_PUBLISH).increment(1);
        let guard = self.inner.read();
        if let Some(sender) = guard.channels.get(session_id) {
            // `send` only errors when there are zero receivers, which is not
            // an error for a best-effort bus (§4.2 "Delivery").
            let _ = sender.send(envelope);
        }
    }
}

impl Subscription {
    /// Awaits the next envelope published to this session, transparently
    /// skipping past a lag gap (the only failure mode `broadcast` exposes)
    /// rather than terminating the subscription over it.
    pub(crate) async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    ::metrics::counter!(METRICS_ID_FANOUT_DROPPED).increment(skipped);
                    tracing::warn!(
                        session_id = %self.session_id,
                        skipped,
                        "fan-out subscriber lagged, dropping oldest envelopes"
                    );
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut guard = self.groups.write();
        if let Some(sender) = guard.channels.get(&self.session_id)
            && sender.receiver_count() == 0
        {
            guard.channels.remove(&self.session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(role: Role) -> Envelope {
        Envelope {
            sender_role: role,
            sender_channel: ConnectionId::new(),
            msg: Some("hi".to_owned()),
            data: None,
        }
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber_including_the_publisher() {
        let bus = InMemoryFanoutBus::new();
        let session_id = SessionId::sanitize("s1");
        let mut subscriber_a = bus.subscribe(&session_id);
        let mut subscriber_b = bus.subscribe(&session_id);

        bus.publish(&session_id, envelope(Role::Patient));

        assert!(subscriber_a.recv().await.is_some());
        assert!(subscriber_b.recv().await.is_some());
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_is_not_an_error() {
        let bus = InMemoryFanoutBus::new();
        let session_id = SessionId::sanitize("empty");
        bus.publish(&session_id, envelope(Role::Operator));
    }

    #[tokio::test]
    async fn group_is_torn_down_once_every_subscriber_drops() {
        let bus = InMemoryFanoutBus::new();
        let session_id = SessionId::sanitize("s2");
        let subscription = bus.subscribe(&session_id);
        drop(subscription);
        assert!(bus.inner.read().channels.get(&session_id).is_none());
    }

    #[tokio::test]
    async fn per_publisher_order_is_preserved() {
        let bus = InMemoryFanoutBus::new();
        let session_id = SessionId::sanitize("s3");
        let mut subscriber = bus.subscribe(&session_id);
        for i in 0..5 {
            bus.publish(
                &session_id,
                Envelope {
                    sender_role: Role::Patient,
                    sender_channel: ConnectionId::new(),
                    msg: Some(i.to_string()),
                    data: None,
                },
            );
        }
        for i in 0..5 {
            let envelope = subscriber.recv().await.unwrap();
            assert_eq!(envelope.msg.as_deref(), Some(i.to_string().as_str()));
        }
    }
}
