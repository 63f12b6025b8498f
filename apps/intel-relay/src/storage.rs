use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script};
use tokio::time::Instant;

pub const TASK_STATUS_PREFIX: &str = "ai-task-status:";
pub const ANALYSIS_CACHE_PREFIX: &str = "ai-analysis-cache:";
pub const TASK_STATUS_TTL: Duration = Duration::from_secs(600);
pub const ANALYSIS_CACHE_TTL: Duration = Duration::from_secs(3600);

pub fn task_status_key(entity_key: &str) -> String {
    format!("{TASK_STATUS_PREFIX}{entity_key}")
}

pub fn analysis_cache_key(entity_key: &str) -> String {
    format!("{ANALYSIS_CACHE_PREFIX}{entity_key}")
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] RedisError),
    #[error("gave up updating contended key {0}")]
    Contended(String),
}

/// Shared key-value store with expiry, used for task records and the result cache.
#[async_trait]
pub trait KeyedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Writes `value` only if the current value equals `expected` (`None` = key absent).
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;
}

static CAS_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '0' then
  if current then return 0 end
elseif current ~= ARGV[2] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[3], 'EX', ARGV[4])
return 1
"#,
    )
});

#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
}

impl RedisStore {
    pub async fn new(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis })
    }

    pub fn from_manager(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl KeyedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_secs(ttl)).await?;
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let written: i32 = CAS_SCRIPT
            .key(key)
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or(""))
            .arg(value)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(written == 1)
    }
}

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Process-local store with the same expiry and CAS semantics as [`RedisStore`].
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        let value = self
            .entries
            .get(key)
            .filter(|entry| entry.live(now))
            .map(|entry| entry.value.clone());
        if value.is_none() {
            self.entries.remove_if(key, |_, entry| !entry.live(now));
        }
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        use dashmap::mapref::entry::Entry as Slot;

        let now = Instant::now();
        let fresh = Entry {
            value: value.to_string(),
            expires_at: now + ttl,
        };
        match self.entries.entry(key.to_string()) {
            Slot::Occupied(mut slot) => {
                let current = slot.get().live(now).then(|| slot.get().value.as_str());
                if current != expected {
                    return Ok(false);
                }
                slot.insert(fresh);
                Ok(true)
            }
            Slot::Vacant(slot) => {
                if expected.is_some() {
                    return Ok(false);
                }
                slot.insert(fresh);
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test]
    async fn cas_requires_matching_current_value() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);

        assert!(store.compare_and_set("k", None, "a", ttl).await.unwrap());
        assert!(!store.compare_and_set("k", None, "b", ttl).await.unwrap());
        assert!(!store.compare_and_set("k", Some("x"), "b", ttl).await.unwrap());
        assert!(store.compare_and_set("k", Some("a"), "b", ttl).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("b"));
        assert!(!store.compare_and_set("missing", Some("a"), "b", ttl).await.unwrap());
    }

    #[test_timeout::tokio_timeout_test]
    async fn expired_entries_read_as_absent() {
        let store = MemoryStore::new();
        store.set_ex("k", "v", Duration::ZERO).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store
            .compare_and_set("k", None, "w", Duration::from_secs(5))
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("w"));
    }

    #[test_timeout::timeout]
    fn key_layout() {
        assert_eq!(task_status_key("co-42"), "ai-task-status:co-42");
        assert_eq!(analysis_cache_key("co-42"), "ai-analysis-cache:co-42");
    }
}
