//! Connection identity and live-connection tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Keep a handle to every live connection so shutdown can reach it
//! - Report the active connection count

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::join_all;

use crate::observability::metrics;
use crate::worker::JobSource;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

type LiveConnections = DashMap<ConnectionId, Arc<dyn JobSource>>;

/// Registry of live server connections.
#[derive(Clone, Default)]
pub struct ConnectionTracker {
    live: Arc<LiveConnections>,
}

impl ConnectionTracker {
    /// Create a new connection tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a live connection. Returns a guard that unregisters it on drop.
    pub fn track(&self, id: ConnectionId, connection: Arc<dyn JobSource>) -> ConnectionGuard {
        self.live.insert(id, connection);
        metrics::record_active_connections(self.live.len());
        ConnectionGuard {
            live: Arc::clone(&self.live),
            id,
        }
    }

    /// Get current active connection count.
    pub fn active_count(&self) -> usize {
        self.live.len()
    }

    /// Destroy every tracked connection. Returns how many were closed by this call.
    pub async fn destroy_all(&self) -> usize {
        // Collect first: no map shard lock may be held across an await.
        let connections: Vec<Arc<dyn JobSource>> =
            self.live.iter().map(|entry| Arc::clone(entry.value())).collect();
        let closed = join_all(connections.iter().map(|conn| conn.destroy())).await;
        closed.into_iter().filter(|closed| *closed).count()
    }

    /// Wait until every tracked connection has been dropped.
    pub async fn wait_for_drain(&self) {
        while !self.live.is_empty() {
            tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        }
    }
}

/// Guard that tracks a connection's lifetime.
/// Unregisters the connection when dropped.
pub struct ConnectionGuard {
    live: Arc<LiveConnections>,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.live.remove(&self.id);
        metrics::record_active_connections(self.live.len());
        tracing::trace!(connection_id = %self.id, "Connection untracked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::pool::tests::RecordingSource;

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
        assert_eq!(id1.to_string(), format!("conn-{}", id1.as_u64()));
    }

    #[tokio::test]
    async fn tracker_counts_and_destroys() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.active_count(), 0);

        let a = Arc::new(RecordingSource::default());
        let b = Arc::new(RecordingSource::default());
        let guard_a = tracker.track(ConnectionId::new(), a.clone());
        let guard_b = tracker.track(ConnectionId::new(), b.clone());
        assert_eq!(tracker.active_count(), 2);

        assert_eq!(tracker.destroy_all().await, 2);
        assert!(!a.is_alive());
        assert!(!b.is_alive());
        // Already closed: nothing left to destroy.
        assert_eq!(tracker.destroy_all().await, 0);

        drop(guard_a);
        assert_eq!(tracker.active_count(), 1);
        drop(guard_b);
        tracker.wait_for_drain().await;
        assert_eq!(tracker.active_count(), 0);
    }
}
