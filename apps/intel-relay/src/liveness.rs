use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::hub::Hub;

/// Periodic heartbeat: pings every connection and evicts the ones that stopped answering.
pub struct LivenessMonitor {
    hub: Arc<Hub>,
    interval: Duration,
    timeout: Duration,
}

impl LivenessMonitor {
    pub fn new(hub: Arc<Hub>, interval: Duration, timeout: Duration) -> Self {
        Self {
            hub,
            interval,
            timeout,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.sweep_once(),
            }
        }
        debug!("liveness monitor stopped");
    }

    pub fn sweep_once(&self) {
        let outcome = self.hub.sweep(Instant::now(), self.timeout);
        for (info, reason) in &outcome.evicted {
            info!(
                connection = %info.connection_id,
                client_id = info.client_id.as_deref().unwrap_or("-"),
                reason = reason.as_str(),
                errors = info.error_count,
                "evicted connection"
            );
        }
        debug!(
            pinged = outcome.pinged,
            evicted = outcome.evicted.len(),
            ping_failures = outcome.ping_failures.len(),
            "heartbeat sweep"
        );
    }
}
