//! Single owner of the connection registry and the topic router.
//!
//! Both live behind one lock so a connection's registry record and its topic memberships
//! change together. Fan-out only queues frames (`try_send`), so the lock is never held
//! across an await point and a slow client cannot stall the others.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::error::RelayError;
use crate::log_throttle::{self, LogKind};
use crate::metrics;
use crate::protocol::ServerMessage;
use crate::registry::{
    Connection, ConnectionHandle, ConnectionId, ConnectionInfo, ConnectionRegistry, Delivery,
    Liveness, RegistryStats, SendFailure,
};
use crate::router::{Route, TopicRouter};

pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;

struct HubState {
    registry: ConnectionRegistry,
    router: TopicRouter,
}

pub struct Hub {
    state: RwLock<HubState>,
    max_message_bytes: usize,
}

#[derive(Debug, Default, Clone)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
    /// Connections that crossed the error threshold during this fan-out.
    pub flagged: Vec<ConnectionId>,
    pub oversized: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    HeartbeatTimeout,
    TooManyErrors,
    Shutdown,
}

impl EvictionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EvictionReason::HeartbeatTimeout => "heartbeat_timeout",
            EvictionReason::TooManyErrors => "too_many_errors",
            EvictionReason::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Default)]
pub struct SweepOutcome {
    pub pinged: usize,
    pub evicted: Vec<(ConnectionInfo, EvictionReason)>,
    pub ping_failures: Vec<(ConnectionId, SendFailure)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BroadcastStats {
    #[serde(flatten)]
    pub registry: RegistryStats,
    pub companies_monitored: usize,
    pub clients: Vec<ConnectionInfo>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_BYTES)
    }
}

impl Hub {
    pub fn new(max_message_bytes: usize) -> Self {
        Self {
            state: RwLock::new(HubState {
                registry: ConnectionRegistry::new(),
                router: TopicRouter::new(),
            }),
            max_message_bytes,
        }
    }

    pub fn register(
        &self,
        handle: ConnectionHandle,
        client_id: Option<String>,
    ) -> Result<ConnectionInfo, RelayError> {
        let (info, active) = {
            let mut state = self.state.write();
            let info = state.registry.register(handle, client_id)?;
            (info, state.registry.len())
        };
        metrics::CONNECTIONS_TOTAL.inc();
        metrics::ACTIVE_CONNECTIONS.set(active as i64);
        Ok(info)
    }

    /// Removes the record and every topic membership in one step, then closes the socket.
    pub fn unregister(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        let (removed, active) = {
            let mut state = self.state.write();
            let HubState { registry, router } = &mut *state;
            let removed = registry.unregister(id)?;
            router.remove_connection(&removed);
            (removed, registry.len())
        };
        metrics::ACTIVE_CONNECTIONS.set(active as i64);
        log_throttle::forget(&id.to_string());
        removed.close();
        Some(removed.info())
    }

    pub fn get(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.state.read().registry.get(id)
    }

    /// `None` when the connection is unknown, otherwise whether the subscription is new.
    pub fn subscribe(&self, id: ConnectionId, topic: &str) -> Option<bool> {
        let mut state = self.state.write();
        let HubState { registry, router } = &mut *state;
        let conn = registry.record_mut(id)?;
        conn.subscribed_topics.insert(topic.to_string());
        Some(router.subscribe(id, topic))
    }

    pub fn unsubscribe(&self, id: ConnectionId, topic: &str) -> Option<bool> {
        let mut state = self.state.write();
        let HubState { registry, router } = &mut *state;
        let conn = registry.record_mut(id)?;
        conn.subscribed_topics.remove(topic);
        Some(router.unsubscribe(id, topic))
    }

    pub fn subscribers(&self, topic: &str) -> Vec<ConnectionId> {
        self.state.read().router.subscribers(topic)
    }

    pub fn connection_count(&self) -> usize {
        self.state.read().registry.len()
    }

    pub fn record_pong(&self, id: ConnectionId) -> bool {
        self.state.write().registry.record_pong(id, Instant::now())
    }

    /// Queues `payload` for a topic's subscribers, or for everyone when `topic` is `None`.
    /// A failure on one connection is counted against it and never stops the fan-out.
    pub fn broadcast(&self, payload: &str, topic: Option<&str>) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        if payload.len() > self.max_message_bytes {
            warn!(
                bytes = payload.len(),
                limit = self.max_message_bytes,
                topic = topic.unwrap_or("*"),
                "dropping oversized broadcast"
            );
            report.oversized = true;
            return report;
        }

        let frame: Arc<str> = Arc::from(payload);
        let mut failures = Vec::new();
        {
            let mut state = self.state.write();
            let HubState { registry, router } = &mut *state;
            let targets: Vec<ConnectionId> = match router.route(topic) {
                Route::Topic(Some(members)) => members.iter().copied().collect(),
                Route::Topic(None) => Vec::new(),
                Route::Everyone => registry.ids(),
            };
            for id in targets {
                match registry.deliver(id, &frame) {
                    Delivery::Delivered => report.delivered += 1,
                    Delivery::Failed { failure, flagged } => {
                        report.failed += 1;
                        if flagged {
                            report.flagged.push(id);
                        }
                        failures.push((id, failure));
                    }
                    Delivery::Missing => {
                        error!(connection = %id, "router referenced an unregistered connection");
                    }
                }
            }
        }

        metrics::MESSAGES_DELIVERED.inc_by(report.delivered as u64);
        metrics::DELIVERY_ERRORS.inc_by(report.failed as u64);
        for (id, failure) in failures {
            if log_throttle::should_log(LogKind::DeliveryFailure, &id.to_string()) {
                warn!(connection = %id, %failure, "failed to deliver broadcast");
            }
        }
        debug!(
            topic = topic.unwrap_or("*"),
            delivered = report.delivered,
            failed = report.failed,
            "broadcast fanned out"
        );
        report
    }

    /// Sends one relay-originated envelope to a single connection.
    pub fn send_to(&self, id: ConnectionId, message: &ServerMessage) -> bool {
        let encoded = match serde_json::to_string(message) {
            Ok(encoded) => encoded,
            Err(err) => {
                error!(connection = %id, error = %err, "failed to encode envelope");
                return false;
            }
        };
        if encoded.len() > self.max_message_bytes {
            warn!(connection = %id, bytes = encoded.len(), "envelope too large");
            return false;
        }
        let frame: Arc<str> = Arc::from(encoded);
        let outcome = self.state.write().registry.deliver(id, &frame);
        match outcome {
            Delivery::Delivered => {
                metrics::MESSAGES_DELIVERED.inc();
                true
            }
            Delivery::Failed { failure, .. } => {
                metrics::DELIVERY_ERRORS.inc();
                if log_throttle::should_log(LogKind::DeliveryFailure, &id.to_string()) {
                    warn!(connection = %id, %failure, "failed to send envelope");
                }
                false
            }
            Delivery::Missing => false,
        }
    }

    /// One heartbeat pass: evicts flagged and timed-out connections, pings the rest.
    pub fn sweep(&self, now: Instant, timeout: Duration) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        let ping: Arc<str> = match serde_json::to_string(&ServerMessage::ping()) {
            Ok(encoded) => Arc::from(encoded),
            Err(err) => {
                error!(error = %err, "failed to encode ping");
                return outcome;
            }
        };

        let (evicted, active) = {
            let mut state = self.state.write();
            let HubState { registry, router } = &mut *state;
            let mut doomed = Vec::new();
            for conn in registry.iter_mut() {
                if conn.should_evict() {
                    doomed.push((conn.id, EvictionReason::TooManyErrors));
                    continue;
                }
                if conn.liveness(now, timeout) == Liveness::TimedOut {
                    doomed.push((conn.id, EvictionReason::HeartbeatTimeout));
                    continue;
                }
                match conn.try_send(Arc::clone(&ping)) {
                    Ok(()) => {
                        conn.last_ping = now;
                        outcome.pinged += 1;
                    }
                    Err(failure) => outcome.ping_failures.push((conn.id, failure)),
                }
            }
            for (id, _) in &outcome.ping_failures {
                registry.record_error(*id);
                if let Some(conn) = registry.record_mut(*id) {
                    conn.request_eviction();
                }
            }
            let mut evicted: Vec<(Connection, EvictionReason)> = Vec::with_capacity(doomed.len());
            for (id, reason) in doomed {
                if let Some(conn) = registry.unregister(id) {
                    router.remove_connection(&conn);
                    evicted.push((conn, reason));
                }
            }
            (evicted, registry.len())
        };

        metrics::ACTIVE_CONNECTIONS.set(active as i64);
        for (id, failure) in &outcome.ping_failures {
            metrics::DELIVERY_ERRORS.inc();
            if log_throttle::should_log(LogKind::PingFailure, &id.to_string()) {
                warn!(connection = %id, %failure, "ping failed; connection marked for eviction");
            }
        }
        for (conn, reason) in evicted {
            conn.close();
            metrics::EVICTIONS.with_label_values(&[reason.as_str()]).inc();
            log_throttle::forget(&conn.id.to_string());
            outcome.evicted.push((conn.info(), reason));
        }
        outcome
    }

    /// Removes and closes every connection.
    pub fn close_all(&self) -> Vec<ConnectionInfo> {
        let drained = {
            let mut state = self.state.write();
            state.router = TopicRouter::new();
            state.registry.drain()
        };
        metrics::ACTIVE_CONNECTIONS.set(0);
        drained
            .into_iter()
            .map(|conn| {
                conn.close();
                metrics::EVICTIONS
                    .with_label_values(&[EvictionReason::Shutdown.as_str()])
                    .inc();
                conn.info()
            })
            .collect()
    }

    pub fn stats(&self) -> BroadcastStats {
        let state = self.state.read();
        let mut clients: Vec<ConnectionInfo> = state.registry.iter().map(Connection::info).collect();
        clients.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        BroadcastStats {
            registry: state.registry.stats(),
            companies_monitored: state.router.topic_count(),
            clients,
        }
    }
}
