use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::ai::OpenAiConfig;
use crate::broadcaster::BroadcasterSettings;
use crate::hub::DEFAULT_MAX_MESSAGE_BYTES;
use crate::worker::DEFAULT_QUEUE_CAPACITY;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub redis_url: String,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    pub reconnect_base_delay_secs: u64,
    pub max_message_bytes: usize,
    pub client_queue_capacity: usize,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub openai_base_url: String,
    pub ai_timeout_secs: u64,
    pub ai_max_retries: u32,
    pub worker_concurrency: usize,
    pub analysis_queue_capacity: usize,
}

fn parsed<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|val| val.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: parsed("INTEL_RELAY_PORT", defaults.port),
            redis_url: env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            heartbeat_interval_secs: parsed(
                "HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval_secs,
            ),
            client_timeout_secs: parsed("CLIENT_TIMEOUT_SECS", defaults.client_timeout_secs),
            reconnect_base_delay_secs: parsed(
                "RECONNECT_BASE_DELAY_SECS",
                defaults.reconnect_base_delay_secs,
            ),
            max_message_bytes: parsed("MAX_MESSAGE_BYTES", defaults.max_message_bytes),
            client_queue_capacity: parsed("CLIENT_QUEUE_CAPACITY", defaults.client_queue_capacity),
            openai_api_key: env::var("OPENAI_API_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty()),
            openai_model: env::var("OPENAI_MODEL").unwrap_or(defaults.openai_model),
            openai_base_url: env::var("OPENAI_BASE_URL").unwrap_or(defaults.openai_base_url),
            ai_timeout_secs: parsed("AI_TIMEOUT_SECS", defaults.ai_timeout_secs),
            ai_max_retries: parsed("AI_MAX_RETRIES", defaults.ai_max_retries),
            worker_concurrency: parsed("ANALYSIS_WORKERS", defaults.worker_concurrency),
            analysis_queue_capacity: parsed(
                "ANALYSIS_QUEUE_CAPACITY",
                defaults.analysis_queue_capacity,
            ),
        }
    }

    pub fn broadcaster_settings(&self) -> BroadcasterSettings {
        BroadcasterSettings {
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            client_timeout: Duration::from_secs(self.client_timeout_secs.max(1)),
            reconnect_base_delay: Duration::from_secs(self.reconnect_base_delay_secs.max(1)),
        }
    }

    pub fn openai(&self) -> OpenAiConfig {
        OpenAiConfig {
            api_key: self.openai_api_key.clone(),
            model: self.openai_model.clone(),
            base_url: self.openai_base_url.clone(),
            timeout: Duration::from_secs(self.ai_timeout_secs.max(1)),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            redis_url: "redis://localhost:6379".to_string(),
            heartbeat_interval_secs: 30,
            client_timeout_secs: 60,
            reconnect_base_delay_secs: 5,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            client_queue_capacity: 256,
            openai_api_key: None,
            openai_model: "gpt-4o-mini".to_string(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            ai_timeout_secs: 30,
            ai_max_retries: 2,
            worker_concurrency: 4,
            analysis_queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        let settings = config.broadcaster_settings();
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(settings.client_timeout, Duration::from_secs(60));
        assert_eq!(settings.reconnect_base_delay, Duration::from_secs(5));
        assert_eq!(config.max_message_bytes, 64 * 1024);
        assert!(config.openai().api_key.is_none());
    }

    #[test_timeout::timeout]
    fn zero_durations_are_clamped_to_one_second() {
        let config = Config {
            heartbeat_interval_secs: 0,
            client_timeout_secs: 0,
            reconnect_base_delay_secs: 0,
            ..Config::default()
        };
        let settings = config.broadcaster_settings();
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(settings.client_timeout, Duration::from_secs(1));
        assert_eq!(settings.reconnect_base_delay, Duration::from_secs(1));
    }
}
