use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// Channel selector for a subscription. Patterns use Redis glob syntax (`*`, `?`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelFilter {
    Exact(String),
    Pattern(String),
}

impl ChannelFilter {
    pub fn exact(name: impl Into<String>) -> Self {
        ChannelFilter::Exact(name.into())
    }

    pub fn pattern(glob: impl Into<String>) -> Self {
        ChannelFilter::Pattern(glob.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            ChannelFilter::Exact(name) | ChannelFilter::Pattern(name) => name,
        }
    }

    pub fn is_pattern(&self) -> bool {
        matches!(self, ChannelFilter::Pattern(_))
    }

    pub fn matches(&self, channel: &str) -> bool {
        match self {
            ChannelFilter::Exact(name) => name == channel,
            ChannelFilter::Pattern(glob) => glob_match(glob, channel),
        }
    }
}

fn glob_match(pattern: &str, text: &str) -> bool {
    let (p, t) = (pattern.as_bytes(), text.as_bytes());
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == b'?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == b'*' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if let Some((star, mark)) = backtrack {
            pi = star + 1;
            ti = mark + 1;
            backtrack = Some((star, mark + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}

/// A live subscription. `next` yields `None` once the underlying connection is gone;
/// dropping the subscription releases it.
#[async_trait]
pub trait Subscription: Send {
    async fn next(&mut self) -> Option<BusMessage>;

    async fn close(self: Box<Self>) {}
}

#[async_trait]
pub trait Bus: Send + Sync {
    async fn subscribe(&self, filters: &[ChannelFilter]) -> BusResult<Box<dyn Subscription>>;

    /// Returns the number of subscribers that received the payload.
    async fn publish(&self, channel: &str, payload: Bytes) -> BusResult<usize>;

    async fn subscriber_count(&self, channel: &str) -> BusResult<usize>;
}

struct LocalSubscriber {
    id: u64,
    filters: Vec<ChannelFilter>,
    tx: mpsc::UnboundedSender<BusMessage>,
}

#[derive(Default)]
struct LocalInner {
    subscribers: parking_lot::Mutex<Vec<LocalSubscriber>>,
    next_id: AtomicU64,
    unavailable: AtomicBool,
}

/// Simple in-memory bus for tests and single-process deployments.
#[derive(Clone, Default)]
pub struct LocalBus {
    inner: Arc<LocalInner>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// While unavailable, `subscribe` and `publish` fail with a transport error.
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Drops every live subscription, as a broker restart would.
    pub fn disconnect_all(&self) {
        self.inner.subscribers.lock().clear();
    }

    pub fn active_subscriptions(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    fn ensure_available(&self) -> BusResult<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            Err(BusError::Transport("local bus unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn subscribe(&self, filters: &[ChannelFilter]) -> BusResult<Box<dyn Subscription>> {
        self.ensure_available()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().push(LocalSubscriber {
            id,
            filters: filters.to_vec(),
            tx,
        });
        Ok(Box::new(LocalSubscription {
            id,
            rx,
            inner: Arc::clone(&self.inner),
        }))
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> BusResult<usize> {
        self.ensure_available()?;
        let mut subscribers = self.inner.subscribers.lock();
        let mut delivered = 0;
        subscribers.retain(|sub| {
            if !sub.filters.iter().any(|f| f.matches(channel)) {
                return !sub.tx.is_closed();
            }
            let sent = sub
                .tx
                .send(BusMessage {
                    channel: channel.to_string(),
                    payload: payload.clone(),
                })
                .is_ok();
            if sent {
                delivered += 1;
            }
            sent
        });
        Ok(delivered)
    }

    async fn subscriber_count(&self, channel: &str) -> BusResult<usize> {
        Ok(self
            .inner
            .subscribers
            .lock()
            .iter()
            .filter(|sub| sub.filters.iter().any(|f| f.matches(channel)))
            .count())
    }
}

pub struct LocalSubscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<BusMessage>,
    inner: Arc<LocalInner>,
}

#[async_trait]
impl Subscription for LocalSubscription {
    async fn next(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

impl Drop for LocalSubscription {
    fn drop(&mut self) {
        let id = self.id;
        self.inner.subscribers.lock().retain(|sub| sub.id != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn glob_patterns_follow_redis_rules() {
        let filter = ChannelFilter::pattern("ai-sync.response.company.*");
        assert!(filter.matches("ai-sync.response.company.co-42"));
        assert!(!filter.matches("ai-sync.response"));
        assert!(ChannelFilter::pattern("a?c*").matches("abcdef"));
        assert!(!ChannelFilter::pattern("a?c").matches("ac"));
        assert!(ChannelFilter::exact("alerts").matches("alerts"));
        assert!(!ChannelFilter::exact("alerts").matches("alerts.x"));
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn local_bus_round_trip() {
        let bus = LocalBus::new();
        let mut sub = bus
            .subscribe(&[ChannelFilter::pattern("controller/*")])
            .await
            .expect("subscribe ok");
        let delivered = bus
            .publish("controller/input", Bytes::from_static(b"ping"))
            .await
            .expect("publish ok");
        assert_eq!(delivered, 1);
        let msg = sub.next().await.expect("receive ok");
        assert_eq!(msg.channel, "controller/input");
        assert_eq!(msg.payload, Bytes::from_static(b"ping"));
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn dropping_subscription_releases_it() {
        let bus = LocalBus::new();
        let sub = bus
            .subscribe(&[ChannelFilter::exact("alerts")])
            .await
            .expect("subscribe ok");
        assert_eq!(bus.active_subscriptions(), 1);
        assert_eq!(bus.subscriber_count("alerts").await.unwrap(), 1);
        sub.close().await;
        assert_eq!(bus.active_subscriptions(), 0);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn disconnect_ends_subscription_stream() {
        let bus = LocalBus::new();
        let mut sub = bus
            .subscribe(&[ChannelFilter::exact("alerts")])
            .await
            .expect("subscribe ok");
        bus.disconnect_all();
        assert!(sub.next().await.is_none());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn unavailable_bus_rejects_subscribe() {
        let bus = LocalBus::new();
        bus.set_available(false);
        assert!(matches!(
            bus.subscribe(&[ChannelFilter::exact("alerts")]).await,
            Err(BusError::Transport(_))
        ));
        bus.set_available(true);
        assert!(bus.subscribe(&[ChannelFilter::exact("alerts")]).await.is_ok());
    }
}
