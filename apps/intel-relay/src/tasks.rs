//! Deduplicated background analysis: task records, the result cache and result publishing.
//!
//! Task records and cache entries live only in the shared [`KeyedStore`]. Concurrent
//! writers, including other relay processes, are serialised with the store's
//! compare-and-set rather than in-process locks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use transport_bus::Bus;
use uuid::Uuid;

use crate::error::RelayError;
use crate::metrics;
use crate::protocol::{entity_channel, AiResponse, RESPONSE_CHANNEL};
use crate::storage::{
    analysis_cache_key, task_status_key, KeyedStore, StoreError, ANALYSIS_CACHE_TTL,
    TASK_STATUS_TTL,
};

/// An active task older than this is abandoned and replaced.
pub const STALE_TASK_AGE: Duration = Duration::from_secs(300);
/// Cached answers younger than this are republished while fresh work runs.
pub const CACHE_REPUBLISH_AGE: Duration = Duration::from_secs(300);
const MAX_CAS_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Processing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub entity_key: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
}

impl TaskRecord {
    pub fn new(task_id: String, entity_key: &str, status: TaskStatus, now: DateTime<Utc>) -> Self {
        Self {
            task_id,
            entity_key: entity_key.to_string(),
            status,
            created_at: now,
            updated_at: now,
            error_message: None,
            retry_count: 0,
        }
    }

    /// `Ok(true)` when this record should be handed back instead of starting new work.
    fn reusable(&self, now: DateTime<Utc>) -> Result<bool, RelayError> {
        if !self.status.is_active() {
            return Ok(false);
        }
        if older_than(self.created_at, now, STALE_TASK_AGE) {
            return Err(RelayError::StaleTask(self.entity_key.clone()));
        }
        Ok(true)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub answer: String,
    pub timestamp: DateTime<Utc>,
    pub entity_key: String,
}

impl CacheEntry {
    fn fresh(self, now: DateTime<Utc>, max_age: Duration) -> Result<String, RelayError> {
        if older_than(self.timestamp, now, max_age) {
            Err(RelayError::StaleCache(self.entity_key))
        } else {
            Ok(self.answer)
        }
    }
}

fn older_than(then: DateTime<Utc>, now: DateTime<Utc>, max_age: Duration) -> bool {
    match chrono::Duration::from_std(max_age) {
        Ok(max_age) => now.signed_duration_since(then) > max_age,
        Err(_) => false,
    }
}

/// Scheduling hint carried with every job. Larger runs sooner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskPriority(pub u8);

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority(5)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisJob {
    pub task_id: String,
    pub entity_key: String,
    pub priority: TaskPriority,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("analysis queue is full")]
    QueueFull,
    #[error("analysis queue is closed")]
    Closed,
    #[error("submission rejected: {0}")]
    Rejected(String),
}

/// Hands a job to whatever executes analyses.
#[async_trait]
pub trait TaskSubmitter: Send + Sync {
    async fn submit(&self, job: AnalysisJob) -> Result<(), SubmitError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StartOutcome {
    Reused(String),
    Started(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisTicket {
    pub task_id: String,
    pub reused: bool,
    pub served_from_cache: bool,
}

pub struct TaskCoordinator {
    store: Arc<dyn KeyedStore>,
    bus: Arc<dyn Bus>,
    submitter: Arc<dyn TaskSubmitter>,
}

impl TaskCoordinator {
    pub fn new(
        store: Arc<dyn KeyedStore>,
        bus: Arc<dyn Bus>,
        submitter: Arc<dyn TaskSubmitter>,
    ) -> Self {
        Self {
            store,
            bus,
            submitter,
        }
    }

    /// Currently a pass-through; the hint exists so tiering can be added per entity.
    pub fn priority_for(&self, _entity_key: &str) -> TaskPriority {
        TaskPriority::default()
    }

    /// Returns the id of the active task for `entity_key`, starting one if needed.
    /// Never fails: a submission error yields a synthetic `error-` id with a failed record.
    pub async fn start_or_reuse(&self, entity_key: &str) -> String {
        match self.start(entity_key).await {
            Ok(StartOutcome::Reused(task_id)) => {
                metrics::TASK_REQUESTS.with_label_values(&["reused"]).inc();
                task_id
            }
            Ok(StartOutcome::Started(task_id)) => {
                metrics::TASK_REQUESTS.with_label_values(&["started"]).inc();
                task_id
            }
            Err(err) => self.record_submission_failure(entity_key, &err).await,
        }
    }

    /// Dashboard entry point: reuse an active task, otherwise start fresh work and
    /// republish a recent cached answer for an instant update. The republish never
    /// touches the task record.
    pub async fn request_analysis(&self, entity_key: &str) -> AnalysisTicket {
        let task_id = match self.start(entity_key).await {
            Ok(StartOutcome::Reused(task_id)) => {
                metrics::TASK_REQUESTS.with_label_values(&["reused"]).inc();
                info!(entity = entity_key, task_id = %task_id, "reusing active analysis");
                return AnalysisTicket {
                    task_id,
                    reused: true,
                    served_from_cache: false,
                };
            }
            Ok(StartOutcome::Started(task_id)) => {
                metrics::TASK_REQUESTS.with_label_values(&["started"]).inc();
                task_id
            }
            Err(err) => self.record_submission_failure(entity_key, &err).await,
        };

        let mut served_from_cache = false;
        if let Some(answer) = self.get_cached_result(entity_key, CACHE_REPUBLISH_AGE).await {
            match self.emit(entity_key, &answer, true).await {
                Ok(receivers) => {
                    served_from_cache = true;
                    info!(entity = entity_key, receivers, "served cached analysis");
                }
                Err(err) => warn!(entity = entity_key, error = %err, "failed to republish cached analysis"),
            }
        }
        AnalysisTicket {
            task_id,
            reused: false,
            served_from_cache,
        }
    }

    async fn start(&self, entity_key: &str) -> Result<StartOutcome, RelayError> {
        let key = task_status_key(entity_key);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.store.get(&key).await?;
            let now = Utc::now();
            if let Some(raw) = current.as_deref() {
                match serde_json::from_str::<TaskRecord>(raw) {
                    Ok(record) => match record.reusable(now) {
                        Ok(true) => return Ok(StartOutcome::Reused(record.task_id)),
                        Ok(false) => {}
                        Err(err) => debug!(error = %err, "replacing abandoned task"),
                    },
                    Err(err) => warn!(entity = entity_key, error = %err, "unreadable task record"),
                }
            }

            let record = TaskRecord::new(
                Uuid::new_v4().to_string(),
                entity_key,
                TaskStatus::Pending,
                now,
            );
            let encoded = serde_json::to_string(&record)?;
            if !self
                .store
                .compare_and_set(&key, current.as_deref(), &encoded, TASK_STATUS_TTL)
                .await?
            {
                debug!(entity = entity_key, "task record changed concurrently; re-reading");
                continue;
            }

            let job = AnalysisJob {
                task_id: record.task_id.clone(),
                entity_key: entity_key.to_string(),
                priority: self.priority_for(entity_key),
            };
            self.submitter
                .submit(job)
                .await
                .map_err(|err| RelayError::TaskSubmissionFailed(err.to_string()))?;
            info!(entity = entity_key, task_id = %record.task_id, "started analysis task");
            return Ok(StartOutcome::Started(record.task_id));
        }
        Err(RelayError::TaskSubmissionFailed(format!(
            "task record for {entity_key} kept changing"
        )))
    }

    async fn record_submission_failure(&self, entity_key: &str, err: &RelayError) -> String {
        let now = Utc::now();
        let task_id = format!("error-{entity_key}-{}", now.timestamp());
        error!(entity = entity_key, error = %err, "failed to start analysis");
        metrics::TASK_REQUESTS.with_label_values(&["failed"]).inc();

        let mut record = TaskRecord::new(task_id.clone(), entity_key, TaskStatus::Failed, now);
        record.error_message = Some(err.to_string());
        let written = match serde_json::to_string(&record) {
            Ok(encoded) => self
                .store
                .set_ex(&task_status_key(entity_key), &encoded, TASK_STATUS_TTL)
                .await
                .map_err(RelayError::from),
            Err(err) => Err(err.into()),
        };
        if let Err(err) = written {
            error!(entity = entity_key, error = %err, "failed to record failed task");
        }
        task_id
    }

    /// Read-modify-write on an existing record. `Ok(false)` when there is none.
    async fn modify<F>(&self, entity_key: &str, apply: F) -> Result<bool, RelayError>
    where
        F: Fn(&mut TaskRecord) + Send + Sync,
    {
        let key = task_status_key(entity_key);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(raw) = self.store.get(&key).await? else {
                return Ok(false);
            };
            let mut record: TaskRecord = serde_json::from_str(&raw)?;
            apply(&mut record);
            record.updated_at = Utc::now();
            let encoded = serde_json::to_string(&record)?;
            if self
                .store
                .compare_and_set(&key, Some(&raw), &encoded, TASK_STATUS_TTL)
                .await?
            {
                return Ok(true);
            }
        }
        Err(StoreError::Contended(key).into())
    }

    async fn transition(&self, entity_key: &str, status: TaskStatus, error: Option<&str>) -> bool {
        let outcome = self
            .modify(entity_key, |record| {
                record.status = status;
                if let Some(message) = error {
                    record.error_message = Some(message.to_string());
                }
            })
            .await;
        match outcome {
            Ok(true) => {
                debug!(entity = entity_key, status = status.as_str(), "task status updated");
                true
            }
            Ok(false) => {
                info!(
                    entity = entity_key,
                    status = status.as_str(),
                    "no task record; status update skipped"
                );
                false
            }
            Err(err) => {
                warn!(entity = entity_key, error = %err, "failed to update task status");
                false
            }
        }
    }

    pub async fn mark_processing(&self, entity_key: &str) -> bool {
        self.transition(entity_key, TaskStatus::Processing, None).await
    }

    pub async fn mark_completed(&self, entity_key: &str) -> bool {
        self.transition(entity_key, TaskStatus::Completed, None).await
    }

    pub async fn mark_failed(&self, entity_key: &str, error: &str) -> bool {
        self.transition(entity_key, TaskStatus::Failed, Some(error)).await
    }

    pub async fn record_retry(&self, entity_key: &str) -> bool {
        match self
            .modify(entity_key, |record| record.retry_count += 1)
            .await
        {
            Ok(updated) => updated,
            Err(err) => {
                warn!(entity = entity_key, error = %err, "failed to record retry");
                false
            }
        }
    }

    /// `None` when no record exists or it cannot be read.
    pub async fn get_status(&self, entity_key: &str) -> Option<TaskRecord> {
        let raw = match self.store.get(&task_status_key(entity_key)).await {
            Ok(raw) => raw?,
            Err(err) => {
                warn!(entity = entity_key, error = %err, "task status lookup failed");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(entity = entity_key, error = %err, "unreadable task record");
                None
            }
        }
    }

    /// Returns the cached answer only if it is at most `max_age` old.
    pub async fn get_cached_result(&self, entity_key: &str, max_age: Duration) -> Option<String> {
        let raw = match self.store.get(&analysis_cache_key(entity_key)).await {
            Ok(raw) => raw?,
            Err(err) => {
                warn!(entity = entity_key, error = %err, "cache lookup failed");
                return None;
            }
        };
        let entry: CacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(entity = entity_key, error = %err, "unreadable cache entry");
                return None;
            }
        };
        match entry.fresh(Utc::now(), max_age) {
            Ok(answer) => Some(answer),
            Err(err) => {
                debug!(error = %err, "cache entry too old");
                None
            }
        }
    }

    pub async fn cache_result(&self, entity_key: &str, answer: &str) -> Result<(), RelayError> {
        let entry = CacheEntry {
            answer: answer.to_string(),
            timestamp: Utc::now(),
            entity_key: entity_key.to_string(),
        };
        let encoded = serde_json::to_string(&entry)?;
        self.store
            .set_ex(&analysis_cache_key(entity_key), &encoded, ANALYSIS_CACHE_TTL)
            .await?;
        Ok(())
    }

    /// Emits `answer` on the global and the entity channel, caching it first unless it
    /// came from the cache. Returns the receivers reported for the global channel.
    pub async fn publish_result(
        &self,
        entity_key: &str,
        answer: &str,
        from_cache: bool,
    ) -> Result<usize, RelayError> {
        match self.emit(entity_key, answer, from_cache).await {
            Ok(receivers) => {
                self.mark_completed(entity_key).await;
                info!(
                    entity = entity_key,
                    receivers,
                    from_cache,
                    "published analysis"
                );
                Ok(receivers)
            }
            Err(err) => {
                error!(entity = entity_key, error = %err, "failed to publish analysis");
                self.mark_failed(entity_key, &err.to_string()).await;
                Err(err)
            }
        }
    }

    async fn emit(&self, entity_key: &str, answer: &str, from_cache: bool) -> Result<usize, RelayError> {
        if !from_cache {
            if let Err(err) = self.cache_result(entity_key, answer).await {
                warn!(entity = entity_key, error = %err, "failed to cache analysis");
            }
        }
        let payload = Bytes::from(serde_json::to_vec(&AiResponse::new(
            entity_key, answer, from_cache,
        ))?);
        let receivers = self.bus.publish(RESPONSE_CHANNEL, payload.clone()).await?;
        self.bus.publish(&entity_channel(entity_key), payload).await?;
        Ok(receivers)
    }

    /// Subscribers of the global completion channel across all relay instances.
    pub async fn subscriber_count(&self) -> usize {
        match self.bus.subscriber_count(RESPONSE_CHANNEL).await {
            Ok(count) => count,
            Err(err) => {
                warn!(error = %err, "subscriber count unavailable");
                0
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use parking_lot::Mutex;
    use transport_bus::{ChannelFilter, LocalBus};

    #[derive(Default)]
    pub(crate) struct RecordingSubmitter {
        pub jobs: Mutex<Vec<AnalysisJob>>,
        pub fail: bool,
    }

    #[async_trait]
    impl TaskSubmitter for RecordingSubmitter {
        async fn submit(&self, job: AnalysisJob) -> Result<(), SubmitError> {
            tokio::task::yield_now().await;
            if self.fail {
                return Err(SubmitError::QueueFull);
            }
            self.jobs.lock().push(job);
            Ok(())
        }
    }

    /// Yields before every operation so concurrent callers interleave.
    #[derive(Default)]
    struct YieldingStore(MemoryStore);

    #[async_trait]
    impl KeyedStore for YieldingStore {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            tokio::task::yield_now().await;
            self.0.get(key).await
        }

        async fn set_ex(
            &self,
            key: &str,
            value: &str,
            ttl: Duration,
        ) -> Result<(), StoreError> {
            tokio::task::yield_now().await;
            self.0.set_ex(key, value, ttl).await
        }

        async fn compare_and_set(
            &self,
            key: &str,
            expected: Option<&str>,
            value: &str,
            ttl: Duration,
        ) -> Result<bool, StoreError> {
            tokio::task::yield_now().await;
            self.0.compare_and_set(key, expected, value, ttl).await
        }
    }

    struct Fixture {
        coordinator: TaskCoordinator,
        store: Arc<dyn KeyedStore>,
        bus: LocalBus,
        submitter: Arc<RecordingSubmitter>,
    }

    fn fixture_with(store: Arc<dyn KeyedStore>, submitter: RecordingSubmitter) -> Fixture {
        let bus = LocalBus::new();
        let submitter = Arc::new(submitter);
        let coordinator = TaskCoordinator::new(
            Arc::clone(&store),
            Arc::new(bus.clone()),
            submitter.clone(),
        );
        Fixture {
            coordinator,
            store,
            bus,
            submitter,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(MemoryStore::new()), RecordingSubmitter::default())
    }

    async fn put_record(store: &Arc<dyn KeyedStore>, record: &TaskRecord) {
        store
            .set_ex(
                &task_status_key(&record.entity_key),
                &serde_json::to_string(record).unwrap(),
                TASK_STATUS_TTL,
            )
            .await
            .unwrap();
    }

    async fn put_cache(store: &Arc<dyn KeyedStore>, entity_key: &str, age_secs: i64) {
        let entry = CacheEntry {
            answer: format!("answer-{age_secs}"),
            timestamp: Utc::now() - chrono::Duration::seconds(age_secs),
            entity_key: entity_key.to_string(),
        };
        store
            .set_ex(
                &analysis_cache_key(entity_key),
                &serde_json::to_string(&entry).unwrap(),
                ANALYSIS_CACHE_TTL,
            )
            .await
            .unwrap();
    }

    #[test_timeout::tokio_timeout_test]
    async fn repeated_requests_reuse_the_active_task() {
        let fx = fixture();
        let first = fx.coordinator.start_or_reuse("co-1").await;
        let second = fx.coordinator.start_or_reuse("co-1").await;
        assert_eq!(first, second);
        assert_eq!(fx.submitter.jobs.lock().len(), 1);

        let record = fx.coordinator.get_status("co-1").await.unwrap();
        assert_eq!(record.task_id, first);
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(fx.submitter.jobs.lock()[0].priority, TaskPriority(5));
    }

    #[test_timeout::tokio_timeout_test]
    async fn completed_or_stale_tasks_are_replaced() {
        let fx = fixture();
        let first = fx.coordinator.start_or_reuse("co-1").await;
        assert!(fx.coordinator.mark_completed("co-1").await);
        let second = fx.coordinator.start_or_reuse("co-1").await;
        assert_ne!(first, second);

        let old = Utc::now() - chrono::Duration::seconds(360);
        put_record(
            &fx.store,
            &TaskRecord::new("old-task".into(), "co-2", TaskStatus::Processing, old),
        )
        .await;
        let fresh = fx.coordinator.start_or_reuse("co-2").await;
        assert_ne!(fresh, "old-task");
        assert_eq!(fx.submitter.jobs.lock().len(), 3);
    }

    #[test_timeout::tokio_timeout_test]
    async fn concurrent_starts_submit_once() {
        let fx = fixture_with(
            Arc::new(YieldingStore::default()),
            RecordingSubmitter::default(),
        );
        let (a, b) = tokio::join!(
            fx.coordinator.start_or_reuse("co-1"),
            fx.coordinator.start_or_reuse("co-1")
        );
        assert_eq!(a, b);
        assert_eq!(fx.submitter.jobs.lock().len(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn submission_failure_yields_failed_error_task() {
        let fx = fixture_with(
            Arc::new(MemoryStore::new()),
            RecordingSubmitter {
                fail: true,
                ..Default::default()
            },
        );
        let task_id = fx.coordinator.start_or_reuse("co-1").await;
        assert!(task_id.starts_with("error-co-1-"), "{task_id}");

        let record = fx.coordinator.get_status("co-1").await.unwrap();
        assert_eq!(record.task_id, task_id);
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.error_message.unwrap().contains("queue is full"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn status_updates_without_record_are_noops() {
        let fx = fixture();
        assert!(!fx.coordinator.mark_processing("co-9").await);
        assert!(!fx.coordinator.mark_failed("co-9", "boom").await);
        assert!(fx.coordinator.get_status("co-9").await.is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn lifecycle_updates_status_and_retries() {
        let fx = fixture();
        fx.coordinator.start_or_reuse("co-1").await;
        assert!(fx.coordinator.mark_processing("co-1").await);
        assert!(fx.coordinator.record_retry("co-1").await);
        assert!(fx.coordinator.mark_failed("co-1", "timeout").await);

        let record = fx.coordinator.get_status("co-1").await.unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.error_message.as_deref(), Some("timeout"));
        assert!(record.updated_at >= record.created_at);
    }

    #[test_timeout::tokio_timeout_test]
    async fn cached_results_respect_max_age() {
        let fx = fixture();
        put_cache(&fx.store, "old", 301).await;
        put_cache(&fx.store, "recent", 100).await;
        let max_age = Duration::from_secs(300);
        assert_eq!(fx.coordinator.get_cached_result("old", max_age).await, None);
        assert_eq!(
            fx.coordinator.get_cached_result("recent", max_age).await.as_deref(),
            Some("answer-100")
        );
        assert_eq!(fx.coordinator.get_cached_result("missing", max_age).await, None);
    }

    #[test_timeout::tokio_timeout_test]
    async fn publish_caches_completes_and_emits_on_both_channels() {
        let fx = fixture();
        let mut global = fx
            .bus
            .subscribe(&[ChannelFilter::exact(RESPONSE_CHANNEL)])
            .await
            .unwrap();
        let mut scoped = fx
            .bus
            .subscribe(&[ChannelFilter::exact(entity_channel("co-1"))])
            .await
            .unwrap();
        fx.coordinator.start_or_reuse("co-1").await;

        let receivers = fx.coordinator.publish_result("co-1", "up 5%", false).await.unwrap();
        assert_eq!(receivers, 1);
        for sub in [&mut global, &mut scoped] {
            let msg = sub.next().await.unwrap();
            let response: AiResponse = serde_json::from_slice(&msg.payload).unwrap();
            assert_eq!(response.entity_key, "co-1");
            assert_eq!(response.answer, "up 5%");
            assert!(!response.from_cache);
            assert_eq!(response.version, "2.0");
        }
        assert_eq!(
            fx.coordinator.get_status("co-1").await.unwrap().status,
            TaskStatus::Completed
        );
        assert_eq!(
            fx.coordinator
                .get_cached_result("co-1", Duration::from_secs(60))
                .await
                .as_deref(),
            Some("up 5%")
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn publish_failure_marks_task_failed() {
        let fx = fixture();
        fx.coordinator.start_or_reuse("co-1").await;
        fx.bus.set_available(false);
        assert!(fx.coordinator.publish_result("co-1", "x", false).await.is_err());
        let record = fx.coordinator.get_status("co-1").await.unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.error_message.is_some());
    }

    #[test_timeout::tokio_timeout_test]
    async fn request_analysis_republishes_recent_cache_and_starts_fresh_work() {
        let fx = fixture();
        let mut global = fx
            .bus
            .subscribe(&[ChannelFilter::exact(RESPONSE_CHANNEL)])
            .await
            .unwrap();
        put_cache(&fx.store, "co-1", 100).await;

        let ticket = fx.coordinator.request_analysis("co-1").await;
        assert!(ticket.served_from_cache);
        assert!(!ticket.reused);
        let msg = global.next().await.unwrap();
        let response: AiResponse = serde_json::from_slice(&msg.payload).unwrap();
        assert!(response.from_cache);
        assert_eq!(response.answer, "answer-100");
        assert_eq!(fx.submitter.jobs.lock().len(), 1);

        let again = fx.coordinator.request_analysis("co-1").await;
        assert!(again.reused);
        assert_eq!(again.task_id, ticket.task_id);
        assert_eq!(fx.submitter.jobs.lock().len(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn racing_request_with_fresh_cache_submits_once() {
        let fx = fixture_with(
            Arc::new(YieldingStore::default()),
            RecordingSubmitter::default(),
        );
        put_cache(&fx.store, "co-2", 60).await;

        let (started, ticket) = tokio::join!(
            fx.coordinator.start_or_reuse("co-2"),
            fx.coordinator.request_analysis("co-2")
        );
        assert_eq!(started, ticket.task_id);
        assert_eq!(fx.submitter.jobs.lock().len(), 1);

        let record = fx.coordinator.get_status("co-2").await.unwrap();
        assert_eq!(record.task_id, started);
        assert_eq!(record.status, TaskStatus::Pending);
    }
}
