//! In-process job-result store. Suitable for tests and single-process nodes;
//! multi-process deployments use [`super::SqliteJobResults`].

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{apply_write, Consumed, JobResult, JobResultStore, ResultWrite, WriteOutcome};
use crate::error::Result;

#[derive(Default)]
pub struct InMemoryJobResults {
    rows: Mutex<HashMap<String, JobResult>>,
}

impl InMemoryJobResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

#[async_trait]
impl JobResultStore for InMemoryJobResults {
    async fn write_result(&self, write: ResultWrite) -> Result<WriteOutcome> {
        let mut rows = self.rows.lock();
        let (outcome, row) = apply_write(rows.get(&write.job_id), &write, Utc::now());
        if outcome == WriteOutcome::Stale {
            warn!(job_id = %write.job_id, status = write.status.as_str(), "ignoring stale result write");
        }
        if let Some(row) = row {
            rows.insert(write.job_id, row);
        }
        Ok(outcome)
    }

    async fn consume(&self, job_id: &str) -> Result<Consumed> {
        let mut rows = self.rows.lock();
        let Some(row) = rows.get_mut(job_id) else {
            return Ok(Consumed::NotFound);
        };
        if !row.status.is_terminal() {
            return Ok(Consumed::NotReady);
        }
        if row.delivered_at.is_none() {
            row.delivered_at = Some(Utc::now());
            debug!(job_id, "result delivered");
        }
        Ok(Consumed::Ready(row.clone()))
    }

    async fn peek(&self, job_id: &str) -> Result<Option<JobResult>> {
        Ok(self.rows.lock().get(job_id).cloned())
    }

    async fn cleanup(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut rows = self.rows.lock();
        let start = rows.len();
        rows.retain(|_, row| !matches!(row.delivered_at, Some(at) if at < before));
        let removed = start - rows.len();
        if removed > 0 {
            debug!(removed, "purged delivered job results");
        }
        Ok(removed)
    }

    async fn undelivered_before(&self, before: DateTime<Utc>) -> Result<Vec<JobResult>> {
        let rows = self.rows.lock();
        let mut stuck: Vec<JobResult> = rows
            .values()
            .filter(|r| {
                r.status.is_terminal()
                    && r.delivered_at.is_none()
                    && r.completed_at.is_some_and(|at| at < before)
            })
            .cloned()
            .collect();
        stuck.sort_by(|a, b| a.completed_at.cmp(&b.completed_at));
        Ok(stuck)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{Job, JobStatus, GENERATION_QUEUE};
    use chrono::Duration;
    use serde_json::json;

    fn job() -> Job {
        Job::new("req-1", GENERATION_QUEUE, json!({}))
    }

    #[tokio::test]
    async fn test_write_twice_same_payload_is_noop() {
        let store = InMemoryJobResults::new();
        let job = job();
        let write = ResultWrite::completed(&job, json!({"text": "hi"}));

        assert_eq!(store.write_result(write.clone()).await.unwrap(), WriteOutcome::Inserted);
        let first = store.peek(&job.job_id).await.unwrap().unwrap();
        assert_eq!(store.write_result(write).await.unwrap(), WriteOutcome::Unchanged);
        let second = store.peek(&job.job_id).await.unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_status_never_moves_backward() {
        let store = InMemoryJobResults::new();
        let job = job();
        store.write_result(ResultWrite::pending(&job)).await.unwrap();
        store
            .write_result(ResultWrite::completed(&job, json!("ok")))
            .await
            .unwrap();
        assert_eq!(
            store.write_result(ResultWrite::pending(&job)).await.unwrap(),
            WriteOutcome::Stale
        );
        let row = store.peek(&job.job_id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_consume_repeatable_and_marks_delivery_once() {
        let store = InMemoryJobResults::new();
        let job = job();
        assert_eq!(store.consume(&job.job_id).await.unwrap(), Consumed::NotFound);

        store.write_result(ResultWrite::pending(&job)).await.unwrap();
        assert_eq!(store.consume(&job.job_id).await.unwrap(), Consumed::NotReady);
        assert!(store.peek(&job.job_id).await.unwrap().unwrap().delivered_at.is_none());

        store
            .write_result(ResultWrite::completed(&job, json!("answer")))
            .await
            .unwrap();
        let Consumed::Ready(first) = store.consume(&job.job_id).await.unwrap() else {
            panic!("expected ready");
        };
        let Consumed::Ready(second) = store.consume(&job.job_id).await.unwrap() else {
            panic!("expected ready");
        };
        assert_eq!(first.result, second.result);
        assert!(first.delivered_at.is_some());
        assert_eq!(first.delivered_at, second.delivered_at);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_undelivered() {
        let store = InMemoryJobResults::new();
        let delivered = job();
        let undelivered = job();
        for j in [&delivered, &undelivered] {
            store
                .write_result(ResultWrite::completed(j, json!("x")))
                .await
                .unwrap();
        }
        store.consume(&delivered.job_id).await.unwrap();

        let future = Utc::now() + Duration::hours(1);
        assert_eq!(store.cleanup(future).await.unwrap(), 1);
        assert!(store.peek(&delivered.job_id).await.unwrap().is_none());
        assert!(store.peek(&undelivered.job_id).await.unwrap().is_some());

        let stuck = store.undelivered_before(future).await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].job_id, undelivered.job_id);
    }

    #[tokio::test]
    async fn test_cleanup_respects_cutoff() {
        let store = InMemoryJobResults::new();
        let job = job();
        store
            .write_result(ResultWrite::completed(&job, json!("x")))
            .await
            .unwrap();
        store.consume(&job.job_id).await.unwrap();
        let past = Utc::now() - Duration::hours(1);
        assert_eq!(store.cleanup(past).await.unwrap(), 0);
        assert_eq!(store.len(), 1);
    }
}
