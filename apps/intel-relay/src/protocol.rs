//! Wire formats shared with dashboard clients and with the analysis producers on the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dedup::IntelItem;
use crate::registry::ConnectionId;

/// Global completion channel. The exact string is a cross-process contract.
pub const RESPONSE_CHANNEL: &str = "ai-sync.response";
/// Prefix of the entity-scoped completion channels.
pub const ENTITY_CHANNEL_PREFIX: &str = "ai-sync.response.company.";
pub const SERVER_VERSION: &str = "2.0";

pub fn entity_channel(entity_key: &str) -> String {
    format!("{ENTITY_CHANNEL_PREFIX}{entity_key}")
}

pub fn entity_channel_pattern() -> String {
    format!("{ENTITY_CHANNEL_PREFIX}*")
}

/// Topic key carried by an entity-scoped channel name, if any.
pub fn topic_from_channel(channel: &str) -> Option<&str> {
    channel
        .strip_prefix(ENTITY_CHANNEL_PREFIX)
        .filter(|topic| !topic.is_empty())
}

/// Messages sent from a dashboard client to the relay.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Pong,
    Ping,
    Subscribe {
        #[serde(default)]
        company_id: Option<Value>,
    },
    Unsubscribe {
        #[serde(default)]
        company_id: Option<Value>,
    },
    #[serde(other)]
    Unknown,
}

/// Company ids arrive as strings or bare numbers depending on the client.
pub fn topic_key(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Subscribed,
    Unsubscribed,
}

/// Envelopes the relay itself originates. Forwarded bus payloads are sent verbatim.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connection {
        status: String,
        connection_id: ConnectionId,
        timestamp: DateTime<Utc>,
        server_version: String,
    },
    Subscription {
        company_id: String,
        status: SubscriptionStatus,
    },
    Ping {
        timestamp: DateTime<Utc>,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
    Raw {
        raw_message: String,
    },
    Intel {
        items: Vec<IntelItem>,
    },
}

impl ServerMessage {
    pub fn welcome(connection_id: ConnectionId) -> Self {
        ServerMessage::Connection {
            status: "connected".to_string(),
            connection_id,
            timestamp: Utc::now(),
            server_version: SERVER_VERSION.to_string(),
        }
    }

    pub fn ping() -> Self {
        ServerMessage::Ping {
            timestamp: Utc::now(),
        }
    }
}

/// Completion payload published on [`RESPONSE_CHANNEL`] and the entity channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiResponse {
    pub entity_key: String,
    pub answer: String,
    pub timestamp: DateTime<Utc>,
    pub from_cache: bool,
    pub version: String,
}

impl AiResponse {
    pub fn new(entity_key: &str, answer: &str, from_cache: bool) -> Self {
        Self {
            entity_key: entity_key.to_string(),
            answer: answer.to_string(),
            timestamp: Utc::now(),
            from_cache,
            version: SERVER_VERSION.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn parses_known_client_messages() {
        let pong: ClientMessage = serde_json::from_str(r#"{"type":"pong"}"#).unwrap();
        assert_eq!(pong, ClientMessage::Pong);

        let sub: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","company_id":"co-42"}"#).unwrap();
        match sub {
            ClientMessage::Subscribe { company_id } => {
                assert_eq!(topic_key(company_id.as_ref()).as_deref(), Some("co-42"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn unknown_types_are_not_errors() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"resize","cols":80}"#).unwrap();
        assert_eq!(msg, ClientMessage::Unknown);
    }

    #[test_timeout::timeout]
    fn numeric_company_ids_become_topics() {
        assert_eq!(topic_key(Some(&json!(42))).as_deref(), Some("42"));
        assert_eq!(topic_key(Some(&json!("  "))), None);
        assert_eq!(topic_key(Some(&json!(null))), None);
        assert_eq!(topic_key(None), None);
    }

    #[test_timeout::timeout]
    fn channel_names_round_trip_topics() {
        assert_eq!(entity_channel("co-42"), "ai-sync.response.company.co-42");
        assert_eq!(topic_from_channel("ai-sync.response.company.co-42"), Some("co-42"));
        assert_eq!(topic_from_channel(RESPONSE_CHANNEL), None);
        assert_eq!(topic_from_channel("ai-sync.response.company."), None);
    }

    #[test_timeout::timeout]
    fn envelopes_carry_type_discriminator() {
        let id = ConnectionId::new();
        let value = serde_json::to_value(ServerMessage::welcome(id)).unwrap();
        assert_eq!(value["type"], "connection");
        assert_eq!(value["status"], "connected");
        assert_eq!(value["server_version"], SERVER_VERSION);

        let ack = serde_json::to_value(ServerMessage::Subscription {
            company_id: "co-1".into(),
            status: SubscriptionStatus::Unsubscribed,
        })
        .unwrap();
        assert_eq!(ack, json!({"type":"subscription","company_id":"co-1","status":"unsubscribed"}));
    }
}
