//! Live connection set and fan-out.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use metrics::counter;
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::connection::{CloseReason, Connection, ConnectionId};
use super::frame::Frame;
use crate::errors::SendError;
use crate::metrics::{WS_BROADCAST_DROPS_TOTAL, WS_SLOW_CLIENT_EVICTIONS_TOTAL};

/// One connection that did not receive a broadcast frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryFailure {
    /// Connection that missed the frame.
    pub connection_id: ConnectionId,
    /// Why.
    pub error: SendError,
}

/// Per-connection outcome of one broadcast.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections in the snapshot.
    pub recipients: usize,
    /// Connections the frame was queued for.
    pub delivered: usize,
    /// Connections the frame was not queued for.
    pub failures: Vec<DeliveryFailure>,
}

impl BroadcastReport {
    /// Whether every recipient got the frame.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Connections that missed the frame.
    pub fn failed_ids(&self) -> impl Iterator<Item = &ConnectionId> {
        self.failures.iter().map(|f| &f.connection_id)
    }
}

/// The set of currently open connections.
///
/// Locks are held only to copy or mutate the map, never across a send or a
/// host callback, so a callback may broadcast reentrantly.
pub struct ConnectionRegistry {
    connections: RwLock<BTreeMap<ConnectionId, Arc<Connection>>>,
    active_count: AtomicUsize,
    max_dropped_frames: u64,
}

impl ConnectionRegistry {
    /// Empty registry. Connections that drop `max_dropped_frames` frames on a
    /// full queue are evicted during broadcast.
    pub fn new(max_dropped_frames: u64) -> Self {
        Self {
            connections: RwLock::new(BTreeMap::new()),
            active_count: AtomicUsize::new(0),
            max_dropped_frames,
        }
    }

    /// Insert a connection. A duplicate id replaces the previous entry.
    pub fn add(&self, connection: Arc<Connection>) {
        let id = connection.id().clone();
        let previous = self.connections.write().insert(id, connection);
        match previous {
            Some(prev) => warn!(conn_id = %prev.id(), "duplicate connection id, replacing entry"),
            None => {
                let _ = self.active_count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Remove by id. Returns the removed connection; absent ids are a no-op.
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let removed = self.connections.write().remove(id);
        if removed.is_some() {
            let _ = self.active_count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Remove `connection` only if the registered entry is that same instance.
    pub(crate) fn unregister(&self, connection: &Arc<Connection>) -> bool {
        let mut conns = self.connections.write();
        let same = conns
            .get(connection.id())
            .is_some_and(|current| Arc::ptr_eq(current, connection));
        if same {
            let _ = conns.remove(connection.id());
            let _ = self.active_count.fetch_sub(1, Ordering::Relaxed);
        }
        same
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.read().contains_key(id)
    }

    /// Point-in-time copy of the live set, in connect order.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().values().cloned().collect()
    }

    /// Registered ids, in connect order.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.read().keys().cloned().collect()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }

    /// Whether no connections are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue `frame` on every connection in a snapshot of the live set.
    ///
    /// Connections that turn out to be closed, or that have dropped too many
    /// frames, are removed afterwards. A connection that joins mid-broadcast
    /// may or may not receive the frame.
    pub fn broadcast(&self, frame: &Frame) -> BroadcastReport {
        let snapshot = self.snapshot();
        let mut report = BroadcastReport {
            recipients: snapshot.len(),
            ..BroadcastReport::default()
        };
        let mut evict = Vec::new();

        for conn in &snapshot {
            match conn.send(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(error) => {
                    match error {
                        SendError::QueueFull => {
                            counter!(WS_BROADCAST_DROPS_TOTAL).increment(1);
                            let drops = conn.drop_count();
                            if drops >= self.max_dropped_frames {
                                warn!(conn_id = %conn.id(), drops, "disconnecting slow client");
                                counter!(WS_SLOW_CLIENT_EVICTIONS_TOTAL).increment(1);
                                let _ = conn.close(CloseReason::SlowConsumer);
                                evict.push(Arc::clone(conn));
                            } else {
                                debug!(conn_id = %conn.id(), drops, "outbound queue full, frame dropped");
                            }
                        }
                        SendError::Closed => evict.push(Arc::clone(conn)),
                        SendError::TooLarge { .. } => {}
                    }
                    report.failures.push(DeliveryFailure {
                        connection_id: conn.id().clone(),
                        error,
                    });
                }
            }
        }

        for conn in &evict {
            let _ = self.unregister(conn);
        }

        debug!(
            kind = frame.kind(),
            size = frame.len(),
            recipients = report.recipients,
            delivered = report.delivered,
            failed = report.failures.len(),
            "broadcast frame"
        );
        report
    }

    /// Begin closing every registered connection. Returns how many were
    /// newly closed.
    pub fn close_all(&self, reason: &CloseReason) -> usize {
        self.snapshot()
            .iter()
            .filter(|conn| conn.close(reason.clone()))
            .count()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(crate::DEFAULT_MAX_DROPPED_FRAMES)
    }
}
