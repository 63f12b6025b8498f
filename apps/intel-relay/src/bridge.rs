//! Relays completion messages from the shared bus into the hub.

use std::sync::Arc;
use std::time::Duration;

use serde::de::IgnoredAny;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use transport_bus::{Bus, BusMessage, ChannelFilter, Subscription};

use crate::error::RelayError;
use crate::hub::{DeliveryReport, Hub};
use crate::log_throttle::{self, LogKind};
use crate::metrics;
use crate::protocol::{entity_channel_pattern, topic_from_channel, ServerMessage, RESPONSE_CHANNEL};

pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Linear reconnect backoff: `base * attempt`, capped.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            cap: MAX_RECONNECT_DELAY,
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.base.saturating_mul(self.attempt).min(self.cap)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[derive(Debug, PartialEq, Eq)]
enum PumpExit {
    Cancelled,
    Lost,
}

pub struct PubSubBridge {
    bus: Arc<dyn Bus>,
    hub: Arc<Hub>,
    filters: Vec<ChannelFilter>,
    backoff: ReconnectBackoff,
}

impl PubSubBridge {
    pub fn new(bus: Arc<dyn Bus>, hub: Arc<Hub>, base_delay: Duration) -> Self {
        Self {
            bus,
            hub,
            filters: vec![
                ChannelFilter::exact(RESPONSE_CHANNEL),
                ChannelFilter::pattern(entity_channel_pattern()),
            ],
            backoff: ReconnectBackoff::new(base_delay),
        }
    }

    /// Runs until `cancel` fires. Bus failures are retried with backoff, never returned.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let subscribed = tokio::select! {
                _ = cancel.cancelled() => break,
                res = self.bus.subscribe(&self.filters) => res,
            };
            match subscribed {
                Ok(mut subscription) => {
                    if self.backoff.attempt() > 0 {
                        info!(attempts = self.backoff.attempt(), "bus listener reconnected");
                    } else {
                        info!(
                            channels = ?self.filters.iter().map(ChannelFilter::as_str).collect::<Vec<_>>(),
                            "bus listener subscribed"
                        );
                    }
                    self.backoff.reset();
                    metrics::BUS_AVAILABLE.set(1);
                    let exit = self.pump(subscription.as_mut(), &cancel).await;
                    subscription.close().await;
                    metrics::BUS_AVAILABLE.set(0);
                    if exit == PumpExit::Cancelled {
                        break;
                    }
                    warn!("bus subscription lost");
                }
                Err(err) => {
                    let err = RelayError::from(err);
                    metrics::BUS_AVAILABLE.set(0);
                    warn!(attempt = self.backoff.attempt() + 1, error = %err, "bus subscribe failed");
                }
            }

            let delay = self.backoff.next_delay();
            metrics::BUS_RECONNECTS.inc();
            debug!(delay_ms = delay.as_millis() as u64, "waiting before bus reconnect");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!("bus listener stopped");
    }

    async fn pump(
        &self,
        subscription: &mut dyn Subscription,
        cancel: &CancellationToken,
    ) -> PumpExit {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return PumpExit::Cancelled,
                msg = subscription.next() => msg,
            };
            match next {
                Some(msg) => {
                    self.forward(&msg);
                }
                None => return PumpExit::Lost,
            }
        }
    }

    /// Forwards one bus message. Entity channels are scoped to their topic; anything
    /// else, including payloads that are not JSON, goes to every connection.
    pub fn forward(&self, msg: &BusMessage) -> DeliveryReport {
        let topic = topic_from_channel(&msg.channel);
        let text = std::str::from_utf8(&msg.payload)
            .ok()
            .filter(|text| serde_json::from_str::<IgnoredAny>(text).is_ok());

        if let Some(text) = text {
            let route = if topic.is_some() { "topic" } else { "global" };
            metrics::BUS_MESSAGES.with_label_values(&[route]).inc();
            return self.hub.broadcast(text, topic);
        }

        let raw = String::from_utf8_lossy(&msg.payload).into_owned();
        if log_throttle::should_log(LogKind::MalformedBusPayload, &msg.channel) {
            let err = RelayError::MalformedMessage(format!(
                "{} byte payload on {}",
                msg.payload.len(),
                msg.channel
            ));
            warn!(error = %err, "forwarding undecodable bus payload as raw");
        }
        metrics::BUS_MESSAGES.with_label_values(&["raw"]).inc();
        match serde_json::to_string(&ServerMessage::Raw { raw_message: raw }) {
            Ok(encoded) => self.hub.broadcast(&encoded, None),
            Err(err) => {
                error!(error = %err, "failed to encode raw envelope");
                DeliveryReport::default()
            }
        }
    }
}
