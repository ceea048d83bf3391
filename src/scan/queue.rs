//! In-process work queue for scan jobs.
//!
//! The database status is the durable part: a scan in `queued` is owed a
//! worker, and `redispatch_queued` re-sends all of them after a restart.

use super::processor::{ProcessError, ScanProcessor};
use crate::config::QueueConfig;
use crate::store::{FileScan, ScanStatus, StoreError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Job {
    pub scan_id: i64,
    pub attempt: u32,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("scan {0} not found")]
    NotFound(i64),
    #[error("scan {id} is {status} and cannot be queued")]
    NotEligible { id: i64, status: ScanStatus },
    #[error("work queue is shut down")]
    Closed,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct ScanQueue {
    tx: mpsc::Sender<Job>,
    processor: Arc<ScanProcessor>,
    max_attempts: u32,
    backoff: Duration,
    cancel: CancellationToken,
}

impl ScanQueue {
    /// Spawn `config.workers` workers pulling from a shared channel.
    pub fn start(
        processor: Arc<ScanProcessor>,
        config: &QueueConfig,
        cancel: CancellationToken,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let queue = Self {
            tx,
            processor,
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_secs(config.backoff_secs),
            cancel,
        };
        let rx = Arc::new(Mutex::new(rx));
        let handles = (0..config.workers.max(1))
            .map(|worker| {
                let queue = queue.clone();
                let rx = rx.clone();
                tokio::spawn(async move { queue.worker_loop(worker, rx).await })
            })
            .collect();
        (queue, handles)
    }

    /// Move an eligible scan to `queued` and hand it to a worker.
    pub async fn enqueue(&self, scan_id: i64) -> Result<FileScan, QueueError> {
        let index = self.processor.recorder().index();
        let scan = index.get_scan(scan_id)?.ok_or(QueueError::NotFound(scan_id))?;
        if !scan.status.can_enqueue() {
            return Err(QueueError::NotEligible {
                id: scan_id,
                status: scan.status,
            });
        }
        let queued = index.transition_scan(scan_id, ScanStatus::Queued)?;
        self.dispatch(Job {
            scan_id,
            attempt: 1,
        })
        .await?;
        info!(scan_id, "Scan queued");
        Ok(queued)
    }

    /// Send a job for a scan already in `queued`.
    pub async fn dispatch(&self, job: Job) -> Result<(), QueueError> {
        self.tx.send(job).await.map_err(|_| QueueError::Closed)
    }

    /// Re-send every scan left in `queued`, e.g. after a restart.
    pub async fn redispatch_queued(&self) -> Result<usize, QueueError> {
        let queued = self
            .processor
            .recorder()
            .index()
            .scans_with_status(ScanStatus::Queued, usize::MAX >> 1)?;
        for scan in &queued {
            self.dispatch(Job {
                scan_id: scan.id,
                attempt: 1,
            })
            .await?;
        }
        if !queued.is_empty() {
            info!(count = queued.len(), "Re-dispatched queued scans");
        }
        Ok(queued.len())
    }

    /// Queue up to `limit` scans still in `pending`, oldest first. A scan
    /// that moved on in the meantime is skipped.
    pub async fn enqueue_pending(&self, limit: usize) -> Result<usize, QueueError> {
        let pending = self
            .processor
            .recorder()
            .index()
            .scans_with_status(ScanStatus::Pending, limit)?;
        let mut queued = 0;
        for scan in pending {
            match self.enqueue(scan.id).await {
                Ok(_) => queued += 1,
                Err(QueueError::NotEligible { id, status }) => {
                    warn!(scan_id = id, %status, "Pending scan changed before queueing");
                }
                Err(e) => return Err(e),
            }
        }
        if queued > 0 {
            info!(count = queued, "Pending scans queued");
        }
        Ok(queued)
    }

    async fn worker_loop(self, worker: usize, rx: Arc<Mutex<mpsc::Receiver<Job>>>) {
        info!(worker, "Scan worker started");
        loop {
            let job = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => None,
                    job = rx.recv() => job,
                }
            };
            let Some(job) = job else { break };
            self.run_job(job).await;
        }
        info!(worker, "Scan worker stopped");
    }

    async fn run_job(&self, job: Job) {
        info!(scan_id = job.scan_id, attempt = job.attempt, "Processing scan");
        let err = match self.processor.process(job.scan_id, &self.cancel).await {
            Ok(outcome) => {
                info!(scan_id = job.scan_id, ?outcome, "Scan job finished");
                return;
            }
            Err(e) => e,
        };
        if !err.is_retryable() {
            if matches!(err, ProcessError::Pipeline(_)) {
                // cancelled; the scan is back in `queued`
                return;
            }
            self.failed(job, &err);
            return;
        }
        if job.attempt >= self.max_attempts {
            self.failed(job, &err);
            return;
        }
        warn!(
            scan_id = job.scan_id,
            attempt = job.attempt,
            backoff_secs = self.backoff.as_secs(),
            "Scan job failed, will retry: {err}"
        );
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = queue.cancel.cancelled() => return,
                () = tokio::time::sleep(queue.backoff) => {}
            }
            let index = queue.processor.recorder().index();
            if let Err(e) = index.transition_scan(job.scan_id, ScanStatus::Queued) {
                warn!(scan_id = job.scan_id, "Retry skipped: {e}");
                return;
            }
            let next = Job {
                scan_id: job.scan_id,
                attempt: job.attempt + 1,
            };
            if let Err(e) = queue.dispatch(next).await {
                warn!(scan_id = job.scan_id, "Retry not dispatched: {e}");
            }
        });
    }

    /// Terminal failure handler. Never re-raises; marking twice is harmless.
    fn failed(&self, job: Job, err: &ProcessError) {
        error!(
            scan_id = job.scan_id,
            attempts = job.attempt,
            "Scan job failed permanently: {err}"
        );
        if let Err(e) = self
            .processor
            .recorder()
            .mark_failed(job.scan_id, &err.to_string())
        {
            warn!(scan_id = job.scan_id, "Failure handler could not update scan: {e}");
        }
    }
}
