//! In-process presence tracking (spec component C1).
//!
//! Modeled as a trait ([`PresenceStore`]) so C3 only ever calls
//! `upsert`/`refresh`/`remove`/`list` through a trait object, the same
//! seam `CollaboratorClient` gives the bridge and control plane. The only
//! implementation shipped here, [`InMemoryPresenceStore`], is an
//! `Arc<RwLock<HashMap<...>>>` newtype guarded by `parking_lot`. Each
//! session owns a map of connection id to [`PresenceRecord`]; a background
//! sweep (spawned by the hub builder) periodically evicts records whose
//! `last_seen` has aged past the configured TTL.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use chatrelay_types::{ConnectionId, Role, SessionId};
use parking_lot::RwLock;
use tracing::instrument;

use crate::metrics::{METRICS_ID_PRESENCE_OP_DURATION, METRICS_ID_PRESENCE_OP_RESULT};

type Result<T> = std::result::Result<T, PresenceError>;

/// Records a presence-store call's duration and outcome against the
/// `chatrelay.hub.presence.op.*` metrics (§4.1).
fn observe(op: &'static str, start: std::time::Instant, ok: bool) {
    ::metrics::histogram!(METRICS_ID_PRESENCE_OP_DURATION, "op" => op)
        .record(start.elapsed().as_secs_f64() * 1000.0);
    ::metrics::counter!(
        METRICS_ID_PRESENCE_OP_RESULT,
        "op" => op,
        "result" => if ok { "ok" } else { "error" }
    )
    .increment(1);
}

/// Dynamic trait object for the presence store, shared across the hub's
/// WebSocket handler and its background sweep task.
pub(crate) type PresenceService = Arc<dyn PresenceStore>;

/// Errors returned by [`PresenceStore`] operations.
#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    /// The connection id was not present in the named session's table.
    #[error("connection {connection_id} is not present in session {session_id}")]
    UnknownConnection {
        /// Session the caller expected the connection to belong to.
        session_id: SessionId,
        /// Connection id that was not found.
        connection_id: ConnectionId,
    },
}

/// A single connection's presence entry.
#[derive(Debug, Clone)]
pub struct PresenceRecord {
    /// The role this connection latched during its hello handshake.
    pub role: Role,
    /// Unix timestamp (seconds) the connection was admitted.
    pub connected_at: i64,
    /// Unix timestamp (seconds) of the most recent refresh.
    pub last_seen: i64,
}

/// A snapshot of one session's presence, ready to serialize as a `presence`
/// server frame.
#[derive(Debug, Clone, Default)]
pub struct PresenceSnapshot {
    /// All current members of the session, in insertion order.
    pub members: Vec<(ConnectionId, PresenceRecord)>,
}

impl PresenceSnapshot {
    /// Total number of members in the snapshot.
    pub fn count(&self) -> usize {
        self.members.len()
    }

    /// Count of members by role, e.g. for the `by_type` wire field.
    pub fn count_by_role(&self, role: Role) -> usize {
        self.members
            .iter()
            .filter(|(_, record)| record.role == role)
            .count()
    }
}

#[derive(Default)]
struct SessionTable {
    connections: HashMap<ConnectionId, PresenceRecord>,
    order: Vec<ConnectionId>,
}

/// C1: tracks which connections are live in which session, bucketed by
/// role, with a TTL-based eviction sweep. `chatrelay-hub` only ever reaches
/// this through a trait object so the in-memory implementation can be
/// swapped for a networked one without touching call sites.
pub(crate) trait PresenceStore: Send + Sync {
    /// Inserts or refreshes a connection's presence record for a session,
    /// stamping `connected_at` on first insert and `last_seen` on every
    /// call. Returns the resulting snapshot of the session.
    fn upsert(&self, session_id: &SessionId, connection_id: ConnectionId, role: Role) -> PresenceSnapshot;

    /// Refreshes `last_seen` for an already-present connection. Returns
    /// [`PresenceError::UnknownConnection`] if the connection was already
    /// removed (e.g. raced with expiry).
    fn refresh(&self, session_id: &SessionId, connection_id: &ConnectionId) -> Result<PresenceSnapshot>;

    /// Removes a connection from a session's table, dropping the session's
    /// entry entirely once it becomes empty. Idempotent: removing an
    /// already-absent connection is not an error.
    fn remove(&self, session_id: &SessionId, connection_id: &ConnectionId) -> PresenceSnapshot;

    /// Returns the current snapshot for a session, empty if the session has
    /// no live connections.
    fn list(&self, session_id: &SessionId) -> PresenceSnapshot;

    /// Sweeps every session, evicting connections whose `last_seen` is older
    /// than `ttl`. Returns the sessions that had at least one eviction, so
    /// the caller can re-broadcast updated presence to the survivors.
    fn sweep_expired(&self, ttl: Duration) -> Vec<SessionId>;
}

/// The only [`PresenceStore`] implementation shipped here: a plain
/// `Arc<RwLock<HashMap<...>>>` held in memory by this process. Cloning
/// shares the underlying table (it is an `Arc` newtype).
#[derive(Clone, Default)]
pub(crate) struct InMemoryPresenceStore {
    inner: Arc<RwLock<HashMap<SessionId, SessionTable>>>,
}

impl InMemoryPresenceStore {
    /// Creates an empty store.
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

impl PresenceStore for InMemoryPresenceStore {
    #[instrument(level = "debug", skip(self))]
    fn upsert(&self, session_id: &SessionId, connection_id: ConnectionId, role: Role) -> PresenceSnapshot {
        let start = std::time::Instant::now();
        let now = unix_now();
        let mut guard = self.inner.write();
        let table = guard.entry(session_id.clone()).or_default();
        match table.connections.get_mut(&connection_id) {
            Some(record) => record.last_seen = now,
            None => {
                table.connections.insert(
                    connection_id.clone(),
                    PresenceRecord {
                        role,
                        connected_at: now,
                        last_seen: now,
                    },
                );
                table.order.push(connection_id);
            }
        }
        let snapshot = snapshot_of(table);
        drop(guard);
        observe("upsert", start, true);
        snapshot
    }

    #[instrument(level = "debug", skip(self))]
    fn refresh(&self, session_id: &SessionId, connection_id: &ConnectionId) -> Result<PresenceSnapshot> {
        let start = std::time::Instant::now();
        let now = unix_now();
        let mut guard = self.inner.write();
        let result: Result<PresenceSnapshot> = (|| {
            let table = guard
                .get_mut(session_id)
                .ok_or_else(|| unknown(session_id, connection_id))?;
            let record = table
                .connections
                .get_mut(connection_id)
                .ok_or_else(|| unknown(session_id, connection_id))?;
            record.last_seen = now;
            Ok(snapshot_of(table))
        })();
        drop(guard);
        observe("refresh", start, result.is_ok());
        result
    }

    #[instrument(level = "debug", skip(self))]
    fn remove(&self, session_id: &SessionId, connection_id: &ConnectionId) -> PresenceSnapshot {
        let start = std::time::Instant::now();
        let mut guard = self.inner.write();
        let Some(table) = guard.get_mut(session_id) else {
            drop(guard);
            observe("remove", start, true);
            return PresenceSnapshot::default();
        };
        table.connections.remove(connection_id);
        table.order.retain(|id| id != connection_id);
        let snapshot = snapshot_of(table);
        if table.connections.is_empty() {
            guard.remove(session_id);
        }
        drop(guard);
        observe("remove", start, true);
        snapshot
    }

    fn list(&self, session_id: &SessionId) -> PresenceSnapshot {
        let start = std::time::Instant::now();
        let guard = self.inner.read();
        let snapshot = guard.get(session_id).map(snapshot_of).unwrap_or_default();
        drop(guard);
        observe("list", start, true);
        snapshot
    }

    #[instrument(level = "debug", skip(self))]
    fn sweep_expired(&self, ttl: Duration) -> Vec<SessionId> {
        let cutoff = unix_now() - ttl.as_secs() as i64;
        let mut touched = Vec::new();
        let mut guard = self.inner.write();
        guard.retain(|session_id, table| {
            let before = table.connections.len();
            table.connections.retain(|_, record| record.last_seen >= cutoff);
            table.order.retain(|id| table.connections.contains_key(id));
            if table.connections.len() != before {
                touched.push(session_id.clone());
            }
            !table.connections.is_empty()
        });
        touched
    }
}

fn snapshot_of(table: &SessionTable) -> PresenceSnapshot {
    PresenceSnapshot {
        members: table
            .order
            .iter()
            .filter_map(|id| table.connections.get(id).map(|record| (id.clone(), record.clone())))
            .collect(),
    }
}

fn unknown(session_id: &SessionId, connection_id: &ConnectionId) -> PresenceError {
    PresenceError::UnknownConnection {
        session_id: session_id.clone(),
        connection_id: connection_id.clone(),
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid() -> SessionId {
        SessionId::sanitize("session-a")
    }

    #[test]
    fn upsert_then_list_reflects_one_member() {
        let store = InMemoryPresenceStore::new();
        let session_id = sid();
        let connection_id = ConnectionId::new();
        store.upsert(&session_id, connection_id.clone(), Role::Patient);
        let snapshot = store.list(&session_id);
        assert_eq!(snapshot.count(), 1);
        assert_eq!(snapshot.count_by_role(Role::Patient), 1);
    }

    #[test]
    fn remove_drops_the_session_once_empty() {
        let store = InMemoryPresenceStore::new();
        let session_id = sid();
        let connection_id = ConnectionId::new();
        store.upsert(&session_id, connection_id.clone(), Role::Operator);
        store.remove(&session_id, &connection_id);
        assert_eq!(store.list(&session_id).count(), 0);
    }

    #[test]
    fn refresh_of_unknown_connection_is_an_error() {
        let store = InMemoryPresenceStore::new();
        let session_id = sid();
        store.upsert(&session_id, ConnectionId::new(), Role::Ai);
        let stranger = ConnectionId::new();
        assert!(store.refresh(&session_id, &stranger).is_err());
    }

    #[test]
    fn sweep_expired_evicts_stale_records_only() {
        let store = InMemoryPresenceStore::new();
        let session_id = sid();
        let fresh = ConnectionId::new();
        store.upsert(&session_id, fresh.clone(), Role::Patient);
        {
            let mut guard = store.inner.write();
            let table = guard.get_mut(&session_id).unwrap();
            table.connections.get_mut(&fresh).unwrap().last_seen -= 1000;
        }
        let touched = store.sweep_expired(Duration::from_secs(120));
        assert_eq!(touched, vec![session_id.clone()]);
        assert_eq!(store.list(&session_id).count(), 0);
    }
}
