//! Queue-driven worker: claims reconstruction tasks and runs them outside
//! the HTTP process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info};

use crate::algorithms::AlgorithmRegistry;
use crate::queue::TaskQueue;
use crate::runner::run_reconstruction_task;
use crate::store::JobStore;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

#[derive(Clone)]
pub struct Worker {
    store: JobStore,
    queue: TaskQueue,
    algorithms: Arc<AlgorithmRegistry>,
}

impl Worker {
    pub fn new(store: JobStore, queue: TaskQueue, algorithms: Arc<AlgorithmRegistry>) -> Self {
        Self {
            store,
            queue,
            algorithms,
        }
    }

    /// Claim and execute at most one task. Returns whether a task was
    /// processed. A failing job is recorded in the queue's bookkeeping and
    /// does not bubble out of the worker.
    pub async fn process_next(&self) -> Result<bool> {
        let Some(claimed) = self.queue.claim_next()? else {
            return Ok(false);
        };

        info!(task_id = %claimed.task_id, job_id = %claimed.message.job_id, "Claimed task");

        let worker = self.clone();
        let (claimed, outcome) = tokio::task::spawn_blocking(move || {
            let outcome = run_reconstruction_task(
                &worker.store,
                &worker.algorithms,
                &claimed.task_id,
                &claimed.message,
            );
            (claimed, outcome)
        })
        .await
        .map_err(|err| anyhow::anyhow!("worker task panicked: {err}"))?;

        match outcome {
            Ok(()) => self.queue.mark_done(&claimed.task_id)?,
            Err(err) => {
                error!(
                    task_id = %claimed.task_id,
                    job_id = %claimed.message.job_id,
                    error = %format!("{err:#}"),
                    "Task failed"
                );
                self.queue.mark_failed(&claimed.task_id, &format!("{err:#}"))?;
            }
        }
        Ok(true)
    }

    /// Poll the queue until the process is terminated.
    pub async fn run(&self, poll_interval: Duration) -> Result<()> {
        info!(queue_db = %self.queue.db_path().display(), "Worker started");
        loop {
            match self.process_next().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(poll_interval).await,
                Err(err) => {
                    error!(error = %format!("{err:#}"), "Worker iteration failed");
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
    }
}
