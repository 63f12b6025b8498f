//! Per-connection bookkeeping, independent of the transport.
//!
//! The registry exclusively owns [`Connection`] records. Each record keeps the sending half
//! of the connection's outbound queue and the token that closes its socket task, so a
//! removal here is what actually tears the session down.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::RelayError;

/// A connection whose error count exceeds this is evicted on the next sweep.
pub const ERROR_EVICTION_THRESHOLD: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What a transport task hands to the registry: identity, outbound queue and close signal.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<Arc<str>>,
    closer: CancellationToken,
}

impl ConnectionHandle {
    /// Creates a handle plus the receiving end the socket writer drains.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (outbound, rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                id: ConnectionId::new(),
                outbound,
                closer: CancellationToken::new(),
            },
            rx,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn closer(&self) -> CancellationToken {
        self.closer.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// The client is not draining its queue fast enough.
    Full,
    /// The socket writer has gone away.
    Closed,
}

impl fmt::Display for SendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendFailure::Full => f.write_str("outbound queue full"),
            SendFailure::Closed => f.write_str("outbound queue closed"),
        }
    }
}

/// Heartbeat state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    AwaitingPong,
    TimedOut,
}

#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub client_id: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_ping: Instant,
    pub last_pong: Instant,
    pub subscribed_topics: HashSet<String>,
    pub message_count: u64,
    pub error_count: u64,
    eviction_requested: bool,
    opened: Instant,
    outbound: mpsc::Sender<Arc<str>>,
    closer: CancellationToken,
}

impl Connection {
    pub fn liveness(&self, now: Instant, timeout: Duration) -> Liveness {
        if now.saturating_duration_since(self.last_pong) > timeout {
            Liveness::TimedOut
        } else if self.last_ping > self.last_pong {
            Liveness::AwaitingPong
        } else {
            Liveness::Alive
        }
    }

    pub fn should_evict(&self) -> bool {
        self.eviction_requested || self.error_count > ERROR_EVICTION_THRESHOLD
    }

    pub(crate) fn request_eviction(&mut self) {
        self.eviction_requested = true;
    }

    pub(crate) fn try_send(&self, frame: Arc<str>) -> Result<(), SendFailure> {
        self.outbound.try_send(frame).map_err(|err| match err {
            TrySendError::Full(_) => SendFailure::Full,
            TrySendError::Closed(_) => SendFailure::Closed,
        })
    }

    /// Signals the socket task to send a close frame and exit.
    pub(crate) fn close(&self) {
        self.closer.cancel();
    }

    pub fn info(&self) -> ConnectionInfo {
        let mut subscriptions: Vec<String> = self.subscribed_topics.iter().cloned().collect();
        subscriptions.sort();
        ConnectionInfo {
            connection_id: self.id,
            client_id: self.client_id.clone(),
            connected_at: self.connected_at,
            connected_duration_seconds: self.opened.elapsed().as_secs_f64(),
            message_count: self.message_count,
            error_count: self.error_count,
            subscriptions,
        }
    }
}

/// Read-only snapshot of a [`Connection`].
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub client_id: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub connected_duration_seconds: f64,
    pub message_count: u64,
    pub error_count: u64,
    pub subscriptions: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub active_connections: usize,
    pub total_connections: u64,
    pub total_messages: u64,
    pub total_errors: u64,
    pub uptime_seconds: f64,
}

#[derive(Debug)]
pub(crate) enum Delivery {
    Delivered,
    Failed { failure: SendFailure, flagged: bool },
    Missing,
}

#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Connection>,
    total_connections: u64,
    total_messages: u64,
    total_errors: u64,
    started_at: Instant,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
            total_connections: 0,
            total_messages: 0,
            total_errors: 0,
            started_at: Instant::now(),
        }
    }

    pub fn register(
        &mut self,
        handle: ConnectionHandle,
        client_id: Option<String>,
    ) -> Result<ConnectionInfo, RelayError> {
        if self.connections.contains_key(&handle.id) {
            return Err(RelayError::DuplicateConnection(handle.id));
        }
        let now = Instant::now();
        let connection = Connection {
            id: handle.id,
            client_id,
            connected_at: Utc::now(),
            last_ping: now,
            last_pong: now,
            subscribed_topics: HashSet::new(),
            message_count: 0,
            error_count: 0,
            eviction_requested: false,
            opened: now,
            outbound: handle.outbound,
            closer: handle.closer,
        };
        let info = connection.info();
        self.connections.insert(handle.id, connection);
        self.total_connections += 1;
        Ok(info)
    }

    pub fn get(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.connections.get(&id).map(Connection::info)
    }

    pub(crate) fn record(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub(crate) fn record_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn record_message(&mut self, id: ConnectionId) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.message_count += 1;
            self.total_messages += 1;
        }
    }

    /// Returns `true` when this error pushed the connection over the eviction threshold.
    pub fn record_error(&mut self, id: ConnectionId) -> bool {
        match self.connections.get_mut(&id) {
            Some(conn) => {
                conn.error_count += 1;
                self.total_errors += 1;
                conn.error_count == ERROR_EVICTION_THRESHOLD + 1
            }
            None => false,
        }
    }

    pub fn record_pong(&mut self, id: ConnectionId, at: Instant) -> bool {
        match self.connections.get_mut(&id) {
            Some(conn) => {
                conn.last_pong = at;
                true
            }
            None => false,
        }
    }

    /// Queues one frame and updates the counters for the outcome.
    pub(crate) fn deliver(&mut self, id: ConnectionId, frame: &Arc<str>) -> Delivery {
        let Some(conn) = self.connections.get(&id) else {
            return Delivery::Missing;
        };
        match conn.try_send(Arc::clone(frame)) {
            Ok(()) => {
                self.record_message(id);
                Delivery::Delivered
            }
            Err(failure) => {
                let flagged = self.record_error(id);
                Delivery::Failed { failure, flagged }
            }
        }
    }

    /// Removes the record. The caller owns router cleanup for the returned topics.
    pub fn unregister(&mut self, id: ConnectionId) -> Option<Connection> {
        self.connections.remove(&id)
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections.values_mut()
    }

    pub(crate) fn drain(&mut self) -> Vec<Connection> {
        self.connections.drain().map(|(_, conn)| conn).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active_connections: self.connections.len(),
            total_connections: self.total_connections,
            total_messages: self.total_messages,
            total_errors: self.total_errors,
            uptime_seconds: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn duplicate_handle_is_rejected() {
        let mut registry = ConnectionRegistry::new();
        let (handle, _rx) = ConnectionHandle::new(4);
        registry.register(handle.clone(), Some("dash-1".into())).unwrap();
        let err = registry.register(handle.clone(), None).unwrap_err();
        assert!(matches!(err, RelayError::DuplicateConnection(id) if id == handle.id()));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.stats().total_connections, 1);
    }

    #[test_timeout::timeout]
    fn counters_and_eviction_threshold() {
        let mut registry = ConnectionRegistry::new();
        let (handle, _rx) = ConnectionHandle::new(4);
        let id = handle.id();
        registry.register(handle, None).unwrap();

        registry.record_message(id);
        for _ in 0..ERROR_EVICTION_THRESHOLD {
            assert!(!registry.record_error(id));
        }
        assert!(registry.record_error(id), "sixth error crosses the threshold");

        let info = registry.get(id).unwrap();
        assert_eq!(info.message_count, 1);
        assert_eq!(info.error_count, ERROR_EVICTION_THRESHOLD + 1);
        let stats = registry.stats();
        assert_eq!(stats.total_messages, 1);
        assert_eq!(stats.total_errors, ERROR_EVICTION_THRESHOLD + 1);
    }

    #[test_timeout::timeout]
    fn deliver_counts_full_and_closed_queues_as_errors() {
        let mut registry = ConnectionRegistry::new();
        let (handle, mut rx) = ConnectionHandle::new(1);
        let id = handle.id();
        registry.register(handle, None).unwrap();
        let frame: Arc<str> = Arc::from("{}");

        assert!(matches!(registry.deliver(id, &frame), Delivery::Delivered));
        assert!(matches!(
            registry.deliver(id, &frame),
            Delivery::Failed { failure: SendFailure::Full, flagged: false }
        ));
        assert_eq!(rx.try_recv().unwrap().as_ref(), "{}");

        rx.close();
        assert!(matches!(
            registry.deliver(id, &frame),
            Delivery::Failed { failure: SendFailure::Closed, .. }
        ));
        assert!(matches!(
            registry.deliver(ConnectionId::new(), &frame),
            Delivery::Missing
        ));
    }

    #[test_timeout::timeout]
    fn liveness_state_machine() {
        let mut registry = ConnectionRegistry::new();
        let (handle, _rx) = ConnectionHandle::new(1);
        let id = handle.id();
        registry.register(handle, None).unwrap();
        let timeout = Duration::from_secs(60);
        let start = registry.record(id).unwrap().last_pong;

        assert_eq!(registry.record(id).unwrap().liveness(start, timeout), Liveness::Alive);

        registry.record_mut(id).unwrap().last_ping = start + Duration::from_secs(30);
        let conn = registry.record(id).unwrap();
        assert_eq!(
            conn.liveness(start + Duration::from_secs(31), timeout),
            Liveness::AwaitingPong
        );
        assert_eq!(
            conn.liveness(start + Duration::from_secs(61), timeout),
            Liveness::TimedOut
        );

        registry.record_pong(id, start + Duration::from_secs(35));
        assert_eq!(
            registry
                .record(id)
                .unwrap()
                .liveness(start + Duration::from_secs(61), timeout),
            Liveness::Alive
        );
    }

    #[test_timeout::timeout]
    fn stats_are_pure_reads() {
        let mut registry = ConnectionRegistry::new();
        let (handle, _rx) = ConnectionHandle::new(1);
        let id = handle.id();
        registry.register(handle, None).unwrap();
        let first = registry.stats();
        let second = registry.stats();
        assert_eq!(first.active_connections, second.active_connections);
        assert_eq!(first.total_connections, second.total_connections);
        assert!(registry.unregister(id).is_some());
        assert!(registry.is_empty());
        assert_eq!(registry.stats().total_connections, 1);
    }
}
