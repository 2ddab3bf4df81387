//! Worker pool: pull jobs, run them, record the outcome.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{Job, JobReceiver, JobResultStore, ResultWrite};

/// Runs one job. Errors become `failed` result rows.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &Job) -> anyhow::Result<serde_json::Value>;
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers sharing `receiver`. They stop when `shutdown`
    /// fires or the queue closes; a job already running is finished first.
    pub fn spawn(
        count: usize,
        receiver: JobReceiver,
        store: Arc<dyn JobResultStore>,
        executor: Arc<dyn JobExecutor>,
        shutdown: CancellationToken,
    ) -> Self {
        let handles = (0..count)
            .map(|worker| {
                let receiver = Arc::clone(&receiver);
                let store = Arc::clone(&store);
                let executor = Arc::clone(&executor);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    run_worker(worker, receiver, store, executor, shutdown).await;
                })
            })
            .collect();
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker to exit.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("worker task panicked: {}", e);
            }
        }
    }
}

async fn run_worker(
    worker: usize,
    receiver: JobReceiver,
    store: Arc<dyn JobResultStore>,
    executor: Arc<dyn JobExecutor>,
    shutdown: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            job = async { receiver.lock().await.recv().await } => match job {
                Some(job) => job,
                None => break,
            },
        };
        process_job(worker, store.as_ref(), executor.as_ref(), &job).await;
    }
    info!(worker, "worker stopped");
}

pub(crate) async fn process_job(
    worker: usize,
    store: &dyn JobResultStore,
    executor: &dyn JobExecutor,
    job: &Job,
) {
    // Claim first so pollers see NotReady instead of NotFound.
    if let Err(e) = store.write_result(ResultWrite::pending(job)).await {
        warn!(worker, job_id = %job.job_id, "failed to record claim: {}", e);
    }

    let write = match executor.execute(job).await {
        Ok(result) => {
            info!(worker, job_id = %job.job_id, "job completed");
            ResultWrite::completed(job, result)
        }
        Err(e) => {
            warn!(worker, job_id = %job.job_id, "job failed: {:#}", e);
            ResultWrite::failed(job, format!("{:#}", e))
        }
    };

    if let Err(e) = store.write_result(write).await {
        // The caller will time out and may resubmit.
        error!(worker, job_id = %job.job_id, "failed to record result: {}", e);
    }
}
