//! In-process executor for analysis jobs.
//!
//! [`AnalysisQueue`] is the [`TaskSubmitter`] handed to the coordinator; [`AnalysisWorker`]
//! drains it highest priority first, asks the AI collaborator and publishes the answer.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ai::Completion;
use crate::tasks::{AnalysisJob, SubmitError, TaskCoordinator, TaskSubmitter};

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct AnalysisQueue {
    tx: mpsc::Sender<AnalysisJob>,
}

impl AnalysisQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AnalysisJob>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl TaskSubmitter for AnalysisQueue {
    async fn submit(&self, job: AnalysisJob) -> Result<(), SubmitError> {
        self.tx.try_send(job).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SubmitError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
        })
    }
}

struct Queued {
    job: AnalysisJob,
    seq: u64,
}

impl Queued {
    fn rank(&self) -> (crate::tasks::TaskPriority, Reverse<u64>) {
        (self.job.priority, Reverse(self.seq))
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.rank() == other.rank()
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

#[derive(Default)]
struct Backlog {
    heap: BinaryHeap<Queued>,
    seq: u64,
}

impl Backlog {
    fn push(&mut self, job: AnalysisJob) {
        self.seq += 1;
        self.heap.push(Queued { job, seq: self.seq });
    }

    fn pop(&mut self) -> Option<AnalysisJob> {
        self.heap.pop().map(|queued| queued.job)
    }
}

struct JobProcessor {
    coordinator: Arc<TaskCoordinator>,
    completion: Arc<dyn Completion>,
    max_retries: u32,
}

impl JobProcessor {
    async fn process(&self, job: AnalysisJob) {
        let entity = job.entity_key.as_str();
        self.coordinator.mark_processing(entity).await;

        let mut attempt = 0;
        let answer = loop {
            match self.completion.complete(entity).await {
                Ok(answer) => break Ok(answer),
                Err(err) if err.is_timeout() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(entity, task_id = %job.task_id, attempt, error = %err, "completion timed out; retrying");
                    self.coordinator.record_retry(entity).await;
                }
                Err(err) => break Err(err),
            }
        };

        match answer {
            Ok(answer) => {
                if self
                    .coordinator
                    .publish_result(entity, &answer, false)
                    .await
                    .is_err()
                {
                    debug!(entity, task_id = %job.task_id, "analysis produced but not delivered");
                }
            }
            Err(err) => {
                warn!(entity, task_id = %job.task_id, error = %err, "analysis failed");
                self.coordinator.mark_failed(entity, &err.to_string()).await;
            }
        }
    }
}

pub struct AnalysisWorker {
    rx: mpsc::Receiver<AnalysisJob>,
    processor: Arc<JobProcessor>,
    concurrency: usize,
}

impl AnalysisWorker {
    pub fn new(
        rx: mpsc::Receiver<AnalysisJob>,
        coordinator: Arc<TaskCoordinator>,
        completion: Arc<dyn Completion>,
        concurrency: usize,
        max_retries: u32,
    ) -> Self {
        Self {
            rx,
            processor: Arc::new(JobProcessor {
                coordinator,
                completion,
                max_retries,
            }),
            concurrency: concurrency.max(1),
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut backlog = Backlog::default();
        let mut running = JoinSet::new();

        loop {
            while running.try_join_next().is_some() {}
            while let Ok(job) = self.rx.try_recv() {
                backlog.push(job);
            }

            if backlog.heap.is_empty() {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    job = self.rx.recv() => job,
                };
                match next {
                    Some(job) => backlog.push(job),
                    None => break,
                }
                continue;
            }

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            while let Ok(job) = self.rx.try_recv() {
                backlog.push(job);
            }
            let Some(job) = backlog.pop() else {
                continue;
            };
            debug!(entity = %job.entity_key, task_id = %job.task_id, priority = job.priority.0, "running analysis");
            let processor = Arc::clone(&self.processor);
            running.spawn(async move {
                processor.process(job).await;
                drop(permit);
            });
        }

        running.shutdown().await;
        info!(abandoned = backlog.heap.len(), "analysis worker stopped");
    }
}
