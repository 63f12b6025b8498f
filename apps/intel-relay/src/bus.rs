//! Redis pub/sub implementation of the message bus.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Msg, RedisError};
use tracing::debug;
use transport_bus::{Bus, BusError, BusMessage, BusResult, ChannelFilter, Subscription};

fn transport(err: RedisError) -> BusError {
    BusError::Transport(err.to_string())
}

/// Publishes through a shared [`ConnectionManager`]; every subscription opens its own
/// dedicated pub/sub connection.
#[derive(Clone)]
pub struct RedisBus {
    client: Client,
    publisher: ConnectionManager,
}

impl RedisBus {
    pub async fn connect(redis_url: &str) -> Result<Self, RedisError> {
        let client = Client::open(redis_url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, publisher })
    }

    pub fn manager(&self) -> ConnectionManager {
        self.publisher.clone()
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn subscribe(&self, filters: &[ChannelFilter]) -> BusResult<Box<dyn Subscription>> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(transport)?;
        for filter in filters {
            let subscribed = match filter {
                ChannelFilter::Exact(channel) => pubsub.subscribe(channel).await,
                ChannelFilter::Pattern(pattern) => pubsub.psubscribe(pattern).await,
            };
            subscribed.map_err(transport)?;
            debug!(filter = filter.as_str(), pattern = filter.is_pattern(), "bus subscribed");
        }
        Ok(Box::new(RedisSubscription {
            messages: pubsub.into_on_message().boxed(),
        }))
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> BusResult<usize> {
        let mut conn = self.publisher.clone();
        let receivers: usize = conn
            .publish(channel, payload.as_ref())
            .await
            .map_err(transport)?;
        Ok(receivers)
    }

    async fn subscriber_count(&self, channel: &str) -> BusResult<usize> {
        let mut conn = self.publisher.clone();
        let counts: Vec<(String, usize)> = redis::cmd("PUBSUB")
            .arg("NUMSUB")
            .arg(channel)
            .query_async(&mut conn)
            .await
            .map_err(transport)?;
        Ok(counts
            .into_iter()
            .find(|(name, _)| name == channel)
            .map(|(_, count)| count)
            .unwrap_or(0))
    }
}

struct RedisSubscription {
    messages: BoxStream<'static, Msg>,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next(&mut self) -> Option<BusMessage> {
        let msg = self.messages.next().await?;
        Some(BusMessage {
            channel: msg.get_channel_name().to_string(),
            payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
        })
    }
}
