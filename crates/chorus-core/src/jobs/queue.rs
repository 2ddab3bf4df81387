//! Job submission. `submit` never waits for a worker.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use super::Job;
use crate::error::{CoreError, Result};

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue `job` on `job.queue` and return its id.
    async fn submit(&self, job: Job) -> Result<String>;
}

/// Receiving end of one queue, shared by every worker of a pool.
pub type JobReceiver = Arc<Mutex<mpsc::UnboundedReceiver<Job>>>;

/// In-process queues keyed by name.
#[derive(Default)]
pub struct ChannelQueue {
    senders: RwLock<HashMap<String, mpsc::UnboundedSender<Job>>>,
}

impl ChannelQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) the queue `name` and hand back its receiver.
    pub fn open(&self, name: &str) -> JobReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.write().insert(name.to_string(), tx);
        Arc::new(Mutex::new(rx))
    }
}

#[async_trait]
impl JobQueue for ChannelQueue {
    async fn submit(&self, job: Job) -> Result<String> {
        let senders = self.senders.read();
        let tx = senders
            .get(&job.queue)
            .ok_or_else(|| CoreError::NotFound(format!("queue '{}'", job.queue)))?;
        let job_id = job.job_id.clone();
        let queue = job.queue.clone();
        tx.send(job)
            .map_err(|_| CoreError::Closed(format!("queue '{}' has no workers", queue)))?;
        debug!(%job_id, %queue, "job submitted");
        Ok(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_submit_routes_by_queue_name() {
        let queue = ChannelQueue::new();
        let rx = queue.open("llm-generation");
        let job = Job::new("req-1", "llm-generation", json!({"n": 1}));
        let id = queue.submit(job.clone()).await.unwrap();
        assert_eq!(id, job.job_id);
        assert_eq!(rx.lock().await.recv().await.unwrap(), job);
    }

    #[tokio::test]
    async fn test_submit_unknown_queue_fails() {
        let queue = ChannelQueue::new();
        let err = queue
            .submit(Job::new("req-1", "nowhere", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_submit_after_receiver_dropped_fails() {
        let queue = ChannelQueue::new();
        drop(queue.open("q"));
        let err = queue.submit(Job::new("r", "q", json!({}))).await.unwrap_err();
        assert!(matches!(err, CoreError::Closed(_)));
    }
}
