//! Asynchronous jobs and at-most-once result delivery.
//!
//! A job is submitted to a named queue and picked up by a worker, possibly in
//! another process. The worker writes its outcome to a [`JobResultStore`];
//! the original caller polls [`JobResultStore::consume`] until the result is
//! terminal.
//!
//! Completion and delivery are tracked separately. `completed_at` is set when
//! the worker finishes, `delivered_at` the first time the caller reads the
//! terminal result. A caller that crashes and retries reads the same payload
//! again without re-marking delivery.

pub mod memory;
pub mod queue;
pub mod sqlite;
pub mod worker;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{CoreError, Result};

pub use memory::InMemoryJobResults;
pub use queue::{ChannelQueue, JobQueue, JobReceiver};
pub use sqlite::SqliteJobResults;
pub use worker::{JobExecutor, WorkerPool};

/// Queue that generation jobs are submitted to.
pub const GENERATION_QUEUE: &str = "llm-generation";

// ── Job ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub request_id: String,
    /// Target worker queue
    pub queue: String,
    /// Opaque to the core
    pub payload: serde_json::Value,
}

impl Job {
    pub fn new(request_id: impl Into<String>, queue: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            request_id: request_id.into(),
            queue: queue.into(),
            payload,
        }
    }
}

// ── Result rows ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Completed,
    Failed,
}

impl JobStatus {
    fn rank(self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Completed | JobStatus::Failed => 1,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() > 0
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(CoreError::Serialization(format!("unknown job status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub request_id: String,
    pub status: JobStatus,
    pub result: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl JobResult {
    /// Error text of a failed result. Workers write `{"error": "..."}`.
    pub fn error_message(&self) -> String {
        match &self.result {
            serde_json::Value::String(s) => s.clone(),
            v => v
                .get("error")
                .and_then(|e| e.as_str())
                .map(String::from)
                .unwrap_or_else(|| v.to_string()),
        }
    }
}

/// A worker-side write.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultWrite {
    pub job_id: String,
    pub request_id: String,
    pub status: JobStatus,
    pub result: serde_json::Value,
}

impl ResultWrite {
    pub fn pending(job: &Job) -> Self {
        Self {
            job_id: job.job_id.clone(),
            request_id: job.request_id.clone(),
            status: JobStatus::Pending,
            result: serde_json::Value::Null,
        }
    }

    pub fn completed(job: &Job, result: serde_json::Value) -> Self {
        Self {
            status: JobStatus::Completed,
            result,
            ..Self::pending(job)
        }
    }

    pub fn failed(job: &Job, message: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            result: serde_json::json!({ "error": message.into() }),
            ..Self::pending(job)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    /// Status moved forward.
    Advanced,
    /// Same status and payload as the stored row; nothing changed.
    Unchanged,
    /// The write would move a terminal row backward or rewrite it. Ignored.
    Stale,
}

/// What `consume` found.
#[derive(Debug, Clone, PartialEq)]
pub enum Consumed {
    Ready(JobResult),
    NotReady,
    NotFound,
}

/// Decide how a write applies to the stored row. Both backends share this so
/// the forward-only rule lives in one place.
pub(crate) fn apply_write(
    existing: Option<&JobResult>,
    write: &ResultWrite,
    now: DateTime<Utc>,
) -> (WriteOutcome, Option<JobResult>) {
    let Some(existing) = existing else {
        let row = JobResult {
            job_id: write.job_id.clone(),
            request_id: write.request_id.clone(),
            status: write.status,
            result: write.result.clone(),
            created_at: now,
            completed_at: write.status.is_terminal().then_some(now),
            delivered_at: None,
        };
        return (WriteOutcome::Inserted, Some(row));
    };

    if existing.status.is_terminal() {
        if existing.status == write.status && existing.result == write.result {
            return (WriteOutcome::Unchanged, None);
        }
        return (WriteOutcome::Stale, None);
    }

    if !write.status.is_terminal() {
        return (WriteOutcome::Unchanged, None);
    }

    let mut row = existing.clone();
    row.status = write.status;
    row.result = write.result.clone();
    row.completed_at = Some(now);
    (WriteOutcome::Advanced, Some(row))
}

#[async_trait]
pub trait JobResultStore: Send + Sync {
    /// Worker side. Idempotent upsert with forward-only status.
    async fn write_result(&self, write: ResultWrite) -> Result<WriteOutcome>;

    /// Caller side. Marks `delivered_at` the first time a terminal result is
    /// read; later calls return the same row unchanged.
    async fn consume(&self, job_id: &str) -> Result<Consumed>;

    /// Read without marking delivery.
    async fn peek(&self, job_id: &str) -> Result<Option<JobResult>>;

    /// Delete delivered rows whose delivery happened before `before`.
    /// Undelivered rows are never deleted.
    async fn cleanup(&self, before: DateTime<Utc>) -> Result<usize>;

    /// Terminal rows nobody has picked up since `before`, for alerting.
    async fn undelivered_before(&self, before: DateTime<Utc>) -> Result<Vec<JobResult>>;
}

/// Poll until the job settles or `timeout` elapses.
///
/// Dropping the returned future stops polling but leaves the job and its
/// result untouched, so a later call can still pick it up.
pub async fn await_result(
    store: &dyn JobResultStore,
    job_id: &str,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<JobResult> {
    let deadline = Instant::now() + timeout;
    loop {
        match store.consume(job_id).await? {
            Consumed::Ready(row) if row.status == JobStatus::Failed => {
                let message = row.error_message();
                warn!(job_id, %message, "job failed");
                return Err(CoreError::Failed {
                    job_id: job_id.to_string(),
                    message,
                });
            }
            Consumed::Ready(row) => return Ok(row),
            Consumed::NotReady | Consumed::NotFound => {}
        }

        let now = Instant::now();
        if now >= deadline {
            warn!(job_id, timeout_secs = timeout.as_secs(), "job timed out");
            return Err(CoreError::Timeout {
                job_id: job_id.to_string(),
            });
        }
        let max_jitter = (poll_interval.as_millis() as u64 / 4).max(1);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..max_jitter));
        let wait = (poll_interval + jitter).min(deadline - now);
        debug!(job_id, wait_ms = wait.as_millis() as u64, "result not ready");
        tokio::time::sleep(wait).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn job() -> Job {
        Job::new("req-1", GENERATION_QUEUE, json!({"content": "hello"}))
    }

    #[test]
    fn test_apply_write_forward_only() {
        let now = Utc::now();
        let job = job();

        let (outcome, row) = apply_write(None, &ResultWrite::pending(&job), now);
        assert_eq!(outcome, WriteOutcome::Inserted);
        let pending = row.unwrap();
        assert_eq!(pending.completed_at, None);

        let done = ResultWrite::completed(&job, json!({"text": "hi"}));
        let (outcome, row) = apply_write(Some(&pending), &done, now);
        assert_eq!(outcome, WriteOutcome::Advanced);
        let completed = row.unwrap();
        assert_eq!(completed.status, JobStatus::Completed);
        assert_eq!(completed.created_at, pending.created_at);

        // Same payload again is a no-op.
        assert_eq!(apply_write(Some(&completed), &done, now).0, WriteOutcome::Unchanged);
        // Backward or conflicting writes are ignored.
        assert_eq!(
            apply_write(Some(&completed), &ResultWrite::pending(&job), now).0,
            WriteOutcome::Stale
        );
        assert_eq!(
            apply_write(Some(&completed), &ResultWrite::failed(&job, "late"), now).0,
            WriteOutcome::Stale
        );
    }

    #[test]
    fn test_error_message_extraction() {
        let job = job();
        let (_, row) = apply_write(None, &ResultWrite::failed(&job, "model refused"), Utc::now());
        assert_eq!(row.unwrap().error_message(), "model refused");
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_result_returns_completed() {
        let store = Arc::new(InMemoryJobResults::new());
        let job = job();
        let writer = Arc::clone(&store);
        let job_for_writer = job.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            writer
                .write_result(ResultWrite::completed(&job_for_writer, json!({"text": "hi"})))
                .await
                .unwrap();
        });

        let row = await_result(
            store.as_ref(),
            &job.job_id,
            Duration::from_millis(250),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert_eq!(row.result, json!({"text": "hi"}));
        assert!(row.delivered_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_result_distinguishes_timeout_from_failure() {
        let store = InMemoryJobResults::new();
        let job = job();

        let err = await_result(&store, &job.job_id, Duration::from_millis(100), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Timeout { .. }));
        assert!(err.is_retryable());

        store
            .write_result(ResultWrite::failed(&job, "content policy"))
            .await
            .unwrap();
        let err = await_result(&store, &job.job_id, Duration::from_millis(100), Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            CoreError::Failed { message, .. } => assert_eq!(message, "content policy"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_wait_keeps_result_for_late_consumer() {
        let store = Arc::new(InMemoryJobResults::new());
        let job = job();

        let waiting = {
            let store = Arc::clone(&store);
            let job_id = job.job_id.clone();
            tokio::spawn(async move {
                await_result(store.as_ref(), &job_id, Duration::from_millis(100), Duration::from_secs(60)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        waiting.abort();

        store
            .write_result(ResultWrite::completed(&job, json!("late answer")))
            .await
            .unwrap();
        let row = await_result(store.as_ref(), &job.job_id, Duration::from_millis(100), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(row.result, json!("late answer"));
    }
}
