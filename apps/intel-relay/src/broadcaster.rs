//! Entry point used by the transport handlers: connection lifecycle, client messages,
//! broadcast, stats and the background tasks that keep the hub alive.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use transport_bus::Bus;

use crate::bridge::PubSubBridge;
use crate::error::RelayError;
use crate::hub::{BroadcastStats, DeliveryReport, Hub};
use crate::liveness::LivenessMonitor;
use crate::protocol::{topic_key, ClientMessage, ServerMessage, SubscriptionStatus};
use crate::registry::{ConnectionHandle, ConnectionId, ConnectionInfo};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct BroadcasterSettings {
    pub heartbeat_interval: Duration,
    pub client_timeout: Duration,
    pub reconnect_base_delay: Duration,
}

impl Default for BroadcasterSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            client_timeout: Duration::from_secs(60),
            reconnect_base_delay: Duration::from_secs(5),
        }
    }
}

pub struct Broadcaster {
    hub: Arc<Hub>,
    bus: Arc<dyn Bus>,
    settings: BroadcasterSettings,
    cancel: CancellationToken,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Broadcaster {
    pub fn new(hub: Arc<Hub>, bus: Arc<dyn Bus>, settings: BroadcasterSettings) -> Self {
        Self {
            hub,
            bus,
            settings,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Registers the connection and queues the welcome envelope.
    pub fn connect(
        &self,
        handle: ConnectionHandle,
        client_id: Option<String>,
    ) -> Result<ConnectionInfo, RelayError> {
        let info = self.hub.register(handle, client_id)?;
        self.hub
            .send_to(info.connection_id, &ServerMessage::welcome(info.connection_id));
        info!(
            connection = %info.connection_id,
            client_id = info.client_id.as_deref().unwrap_or("-"),
            active = self.hub.connection_count(),
            "client connected"
        );
        Ok(info)
    }

    pub fn disconnect(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        let info = self.hub.unregister(id)?;
        info!(
            connection = %id,
            messages = info.message_count,
            errors = info.error_count,
            duration_secs = info.connected_duration_seconds,
            "client disconnected"
        );
        Some(info)
    }

    /// Subscribes and acknowledges. `false` when the connection is unknown.
    pub fn subscribe(&self, id: ConnectionId, topic: &str) -> bool {
        if self.hub.subscribe(id, topic).is_none() {
            return false;
        }
        debug!(connection = %id, topic, "subscribed");
        self.hub.send_to(
            id,
            &ServerMessage::Subscription {
                company_id: topic.to_string(),
                status: SubscriptionStatus::Subscribed,
            },
        );
        true
    }

    /// Unsubscribes; only an actual removal is acknowledged.
    pub fn unsubscribe(&self, id: ConnectionId, topic: &str) -> bool {
        if self.hub.unsubscribe(id, topic) != Some(true) {
            return false;
        }
        debug!(connection = %id, topic, "unsubscribed");
        self.hub.send_to(
            id,
            &ServerMessage::Subscription {
                company_id: topic.to_string(),
                status: SubscriptionStatus::Unsubscribed,
            },
        );
        true
    }

    pub fn broadcast(&self, payload: &str, topic: Option<&str>) -> DeliveryReport {
        self.hub.broadcast(payload, topic)
    }

    pub fn handle_client_message(&self, id: ConnectionId, text: &str) {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(err) => {
                let err = RelayError::MalformedMessage(err.to_string());
                warn!(connection = %id, error = %err, "ignoring client message");
                return;
            }
        };
        match message {
            ClientMessage::Pong => {
                self.hub.record_pong(id);
            }
            ClientMessage::Ping => {
                self.hub
                    .send_to(id, &ServerMessage::Pong { timestamp: Utc::now() });
            }
            ClientMessage::Subscribe { company_id } => match topic_key(company_id.as_ref()) {
                Some(topic) => {
                    self.subscribe(id, &topic);
                }
                None => debug!(connection = %id, "subscribe without company_id"),
            },
            ClientMessage::Unsubscribe { company_id } => match topic_key(company_id.as_ref()) {
                Some(topic) => {
                    self.unsubscribe(id, &topic);
                }
                None => debug!(connection = %id, "unsubscribe without company_id"),
            },
            ClientMessage::Unknown => debug!(connection = %id, "ignoring unknown message type"),
        }
    }

    pub fn stats(&self) -> BroadcastStats {
        self.hub.stats()
    }

    /// Spawns the bus listener and the heartbeat monitor once.
    pub fn start_background_tasks(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        let bridge = PubSubBridge::new(
            Arc::clone(&self.bus),
            Arc::clone(&self.hub),
            self.settings.reconnect_base_delay,
        );
        let monitor = LivenessMonitor::new(
            Arc::clone(&self.hub),
            self.settings.heartbeat_interval,
            self.settings.client_timeout,
        );
        tasks.push((
            "bus listener",
            tokio::spawn(bridge.run(self.cancel.child_token())),
        ));
        tasks.push((
            "liveness monitor",
            tokio::spawn(monitor.run(self.cancel.child_token())),
        ));
        info!(
            heartbeat_secs = self.settings.heartbeat_interval.as_secs(),
            timeout_secs = self.settings.client_timeout.as_secs(),
            "background tasks started"
        );
    }

    /// Stops the background tasks, waits a bounded time for them, then closes every
    /// connection.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for (name, handle) in tasks {
            match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
                Ok(Ok(())) => debug!(task = name, "background task stopped"),
                Ok(Err(err)) => warn!(task = name, error = %err, "background task ended abnormally"),
                Err(_) => warn!(task = name, "background task did not stop in time"),
            }
        }
        let closed = self.hub.close_all();
        info!(closed = closed.len(), "broadcaster shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tokio::sync::mpsc;
    use transport_bus::LocalBus;

    fn broadcaster() -> (Broadcaster, LocalBus) {
        let bus = LocalBus::new();
        let settings = BroadcasterSettings {
            heartbeat_interval: Duration::from_secs(30),
            client_timeout: Duration::from_secs(60),
            reconnect_base_delay: Duration::from_millis(10),
        };
        (
            Broadcaster::new(Arc::new(Hub::default()), Arc::new(bus.clone()), settings),
            bus,
        )
    }

    fn frames(rx: &mut mpsc::Receiver<Arc<str>>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(serde_json::from_str(&frame).unwrap());
        }
        out
    }

    #[test_timeout::timeout]
    fn connect_sends_welcome_and_subscribe_acks() {
        let (broadcaster, _bus) = broadcaster();
        let (handle, mut rx) = ConnectionHandle::new(16);
        let id = handle.id();
        broadcaster.connect(handle, Some("dash".into())).unwrap();

        broadcaster.handle_client_message(id, r#"{"type":"subscribe","company_id":"co-42"}"#);
        broadcaster.handle_client_message(id, r#"{"type":"unsubscribe","company_id":"co-7"}"#);
        broadcaster.handle_client_message(id, r#"{"type":"unsubscribe","company_id":"co-42"}"#);
        broadcaster.handle_client_message(id, r#"{"type":"mystery"}"#);
        broadcaster.handle_client_message(id, "not json");

        let sent = frames(&mut rx);
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0]["type"], "connection");
        assert_eq!(sent[0]["connection_id"], id.to_string());
        assert_eq!(sent[1]["status"], "subscribed");
        assert_eq!(sent[2]["status"], "unsubscribed");
        assert_eq!(sent[2]["company_id"], "co-42");
    }

    #[test_timeout::timeout]
    fn ping_gets_pong_and_stats_list_clients() {
        let (broadcaster, _bus) = broadcaster();
        let (handle, mut rx) = ConnectionHandle::new(16);
        let id = handle.id();
        broadcaster.connect(handle, None).unwrap();
        broadcaster.handle_client_message(id, r#"{"type":"ping"}"#);
        broadcaster.handle_client_message(id, r#"{"type":"pong"}"#);
        broadcaster.handle_client_message(id, r#"{"type":"subscribe","company_id":7}"#);

        let sent = frames(&mut rx);
        assert_eq!(sent[1]["type"], "pong");

        let stats = serde_json::to_value(broadcaster.stats()).unwrap();
        assert_eq!(stats["active_connections"], 1);
        assert_eq!(stats["companies_monitored"], 1);
        assert_eq!(stats["clients"][0]["subscriptions"][0], "7");
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn shutdown_stops_tasks_and_closes_connections() {
        let (broadcaster, bus) = broadcaster();
        broadcaster.start_background_tasks();
        broadcaster.start_background_tasks();
        let (handle, _rx) = ConnectionHandle::new(4);
        let closer = handle.closer();
        broadcaster.connect(handle, None).unwrap();

        while bus.active_subscriptions() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        broadcaster.shutdown().await;
        assert!(closer.is_cancelled());
        assert_eq!(broadcaster.hub().connection_count(), 0);
        assert_eq!(bus.active_subscriptions(), 0, "subscription released on exit");
    }
}
