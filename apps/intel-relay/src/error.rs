use transport_bus::BusError;

use crate::registry::ConnectionId;
use crate::storage::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("connection {0} is already registered")]
    DuplicateConnection(ConnectionId),
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("message bus unavailable: {0}")]
    BusUnavailable(#[from] BusError),
    #[error("task submission failed: {0}")]
    TaskSubmissionFailed(String),
    #[error("task for {0} is stale")]
    StaleTask(String),
    #[error("cached result for {0} is stale")]
    StaleCache(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
