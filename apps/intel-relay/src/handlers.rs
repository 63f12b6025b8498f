use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::broadcaster::Broadcaster;
use crate::dedup::{IngestReport, IntelFeed, IntelItem};
use crate::hub::BroadcastStats;
use crate::metrics;
use crate::tasks::{TaskCoordinator, TaskRecord, TaskStatus};

#[derive(Clone)]
pub struct AppState {
    pub broadcaster: Arc<Broadcaster>,
    pub coordinator: Arc<TaskCoordinator>,
    pub intel: Arc<IntelFeed>,
    pub client_queue_capacity: usize,
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unavailable(String),
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::Unavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg)
            }
        };
        (
            status,
            Json(ApiErrorBody {
                error,
                message: Some(message),
            }),
        )
            .into_response()
    }
}

fn validate_entity_key(entity_key: &str) -> Result<&str, ApiError> {
    let trimmed = entity_key.trim();
    if trimmed.is_empty() {
        return Err(ApiError::BadRequest("entity key must not be empty".into()));
    }
    Ok(trimmed)
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
    active_connections: usize,
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        active_connections: state.broadcaster.hub().connection_count(),
    })
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    timestamp: DateTime<Utc>,
    websocket: BroadcastStats,
    bus_subscribers: usize,
}

pub async fn get_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        timestamp: Utc::now(),
        websocket: state.broadcaster.stats(),
        bus_subscribers: state.coordinator.subscriber_count().await,
    })
}

#[derive(Debug, Serialize)]
pub struct AnalyzeResponse {
    task_id: String,
    status: &'static str,
    entity_key: String,
    reused: bool,
    served_from_cache: bool,
    websocket_channel: &'static str,
}

pub async fn request_analysis(
    State(state): State<AppState>,
    Path(entity_key): Path<String>,
) -> Result<(StatusCode, Json<AnalyzeResponse>), ApiError> {
    let entity_key = validate_entity_key(&entity_key)?;
    let ticket = state.coordinator.request_analysis(entity_key).await;
    if ticket.task_id.starts_with("error-") {
        return Err(ApiError::Unavailable(
            "AI service temporarily unavailable. Please try again later.".into(),
        ));
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(AnalyzeResponse {
            status: if ticket.reused { "in_progress" } else { "accepted" },
            task_id: ticket.task_id,
            entity_key: entity_key.to_string(),
            reused: ticket.reused,
            served_from_cache: ticket.served_from_cache,
            websocket_channel: "/ws/ai",
        }),
    ))
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum StatusResponse {
    Found(TaskRecord),
    NotFound {
        entity_key: String,
        status: &'static str,
        message: &'static str,
    },
}

pub async fn get_analysis_status(
    State(state): State<AppState>,
    Path(entity_key): Path<String>,
) -> ApiResult<StatusResponse> {
    let entity_key = validate_entity_key(&entity_key)?;
    Ok(Json(match state.coordinator.get_status(entity_key).await {
        Some(record) => StatusResponse::Found(record),
        None => StatusResponse::NotFound {
            entity_key: entity_key.to_string(),
            status: "not_found",
            message: "No active or recent analysis found",
        },
    }))
}

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub answer: String,
    #[serde(default)]
    pub from_cache: bool,
}

#[derive(Debug, Serialize)]
pub struct PublishResponse {
    entity_key: String,
    receivers: usize,
    status: TaskStatus,
}

/// Producer-side entry point for analyses computed outside this process.
pub async fn publish_result(
    State(state): State<AppState>,
    Path(entity_key): Path<String>,
    Json(body): Json<PublishRequest>,
) -> ApiResult<PublishResponse> {
    let entity_key = validate_entity_key(&entity_key)?;
    if body.answer.trim().is_empty() {
        return Err(ApiError::BadRequest("answer must not be empty".into()));
    }
    let receivers = state
        .coordinator
        .publish_result(entity_key, &body.answer, body.from_cache)
        .await
        .map_err(|err| ApiError::Unavailable(err.to_string()))?;
    Ok(Json(PublishResponse {
        entity_key: entity_key.to_string(),
        receivers,
        status: TaskStatus::Completed,
    }))
}

#[derive(Debug, Deserialize)]
pub struct IntelBatch {
    pub items: Vec<IntelItem>,
}

pub async fn ingest_intel(
    State(state): State<AppState>,
    Json(batch): Json<IntelBatch>,
) -> Json<IngestReport> {
    Json(state.intel.ingest(batch.items))
}

pub async fn prometheus_metrics() -> String {
    metrics::export_prometheus()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn missing_status_serializes_as_not_found() {
        let body = serde_json::to_value(StatusResponse::NotFound {
            entity_key: "co-1".into(),
            status: "not_found",
            message: "No active or recent analysis found",
        })
        .unwrap();
        assert_eq!(body["status"], "not_found");
        assert_eq!(body["entity_key"], "co-1");
    }

    #[test_timeout::timeout]
    fn api_errors_map_to_status_codes() {
        assert_eq!(
            ApiError::Unavailable("down".into()).into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::BadRequest("bad".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert!(validate_entity_key("  ").is_err());
        let batch: IntelBatch =
            serde_json::from_value(json!({"items":[{"title":"t"}]})).unwrap();
        assert_eq!(batch.items[0].summary, "");
    }
}
