//! Batch download orchestration.
//!
//! A batch runs every job on a bounded pool of tasks (a [`JoinSet`] gated by a
//! semaphore). Workers never touch shared progress state; they send typed
//! messages to a single coordinator task, which owns the [`ProgressState`],
//! computes the aggregate percentage and forwards [`BatchEvent`]s to the
//! caller.
//!
//! The aggregate percentage is `sum(downloaded) / sum(total)` over jobs whose
//! total size is known. It never decreases, and it is exactly 100 once every
//! job has reached a terminal result.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::downloader::{DownloadOutcome, DownloadWorker, ProgressSink, TransferProgress};
use crate::error::{Error, Result};
use crate::video::DownloadJob;

/// Default maximum number of concurrent downloads.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 4;

/// Minimum allowed concurrent downloads.
pub const MIN_CONCURRENT_DOWNLOADS: usize = 1;

/// Maximum allowed concurrent downloads.
pub const MAX_CONCURRENT_DOWNLOADS: usize = 8;

/// Configuration for the download pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum number of concurrent downloads.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_downloads: usize,
}

const fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT_DOWNLOADS
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
        }
    }
}

impl QueueConfig {
    /// Validate and clamp the `max_concurrent_downloads` value.
    pub fn validate(&mut self) {
        self.max_concurrent_downloads = self
            .max_concurrent_downloads
            .clamp(MIN_CONCURRENT_DOWNLOADS, MAX_CONCURRENT_DOWNLOADS);
    }

    /// Pool size after clamping.
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.max_concurrent_downloads
            .clamp(MIN_CONCURRENT_DOWNLOADS, MAX_CONCURRENT_DOWNLOADS)
    }
}

/// Events emitted while a batch runs.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    /// Byte progress of one job.
    JobProgress {
        /// Position of the job in the batch.
        index: usize,
        /// Video ID of the job.
        video_id: String,
        /// Bytes downloaded.
        downloaded: u64,
        /// Expected size, if known.
        total: Option<u64>,
    },
    /// Overall progress of the batch.
    Aggregate {
        /// Percentage in `0.0..=100.0`, never decreasing.
        percent: f64,
        /// Jobs with a terminal result.
        done: usize,
        /// Jobs in the batch.
        total: usize,
    },
    /// A job reached its terminal result.
    JobFinished {
        /// Position of the job in the batch.
        index: usize,
        /// The result.
        outcome: DownloadOutcome,
    },
    /// Every job has finished.
    BatchCompleted(BatchSummary),
}

/// Final report of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Jobs in the batch.
    pub total: usize,
    /// Jobs that ended with the file on disk.
    pub succeeded: usize,
    /// Jobs that failed.
    pub failed: usize,
    /// Per-job results in job order.
    pub outcomes: Vec<DownloadOutcome>,
}

impl BatchSummary {
    fn from_outcomes(outcomes: Vec<DownloadOutcome>) -> Self {
        let succeeded = outcomes.iter().filter(|o| o.success).count();
        Self {
            total: outcomes.len(),
            succeeded,
            failed: outcomes.len() - succeeded,
            outcomes,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct JobProgress {
    downloaded: u64,
    total: Option<u64>,
    settled: bool,
}

/// Progress bookkeeping for one batch.
#[derive(Debug, Clone)]
pub struct ProgressState {
    jobs: Vec<JobProgress>,
    done: usize,
    high_water: f64,
}

impl ProgressState {
    /// Fresh state for `job_count` jobs.
    #[must_use]
    pub fn new(job_count: usize) -> Self {
        Self {
            jobs: vec![JobProgress::default(); job_count],
            done: 0,
            high_water: 0.0,
        }
    }

    /// Record byte progress for a job.
    pub fn record_bytes(&mut self, index: usize, downloaded: u64, total: Option<u64>) {
        if let Some(job) = self.jobs.get_mut(index) {
            job.downloaded = downloaded;
            if total.is_some() {
                job.total = total;
            }
        }
    }

    /// Mark a job's transfer as complete; its downloaded bytes become its total.
    pub fn mark_transferred(&mut self, index: usize) {
        if let Some(job) = self.jobs.get_mut(index)
            && let Some(total) = job.total
        {
            job.downloaded = total;
        }
    }

    /// Record a job's terminal result. Returns `false` if it was already settled.
    pub fn settle(&mut self, index: usize, success: bool) -> bool {
        let Some(job) = self.jobs.get_mut(index) else {
            return false;
        };
        if job.settled {
            return false;
        }
        job.settled = true;
        if success && let Some(total) = job.total {
            job.downloaded = total;
        }
        self.done = self.jobs.iter().filter(|j| j.settled).count();
        true
    }

    /// Jobs with a terminal result.
    #[must_use]
    pub const fn done(&self) -> usize {
        self.done
    }

    /// Jobs in the batch.
    #[must_use]
    pub fn total(&self) -> usize {
        self.jobs.len()
    }

    /// Whether every job has a terminal result.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.done == self.jobs.len()
    }

    /// Aggregate percentage, never lower than any value returned before.
    pub fn percent(&mut self) -> f64 {
        if self.is_complete() {
            self.high_water = 100.0;
            return self.high_water;
        }

        let (downloaded, total) = self
            .jobs
            .iter()
            .filter_map(|job| job.total.map(|t| (job.downloaded.min(t), t)))
            .fold((0_u64, 0_u64), |(d, t), (jd, jt)| {
                (d.saturating_add(jd), t.saturating_add(jt))
            });

        if total > 0 {
            let raw = (downloaded as f64 / total as f64 * 100.0).min(100.0);
            self.high_water = self.high_water.max(raw);
        }
        self.high_water
    }
}

/// Messages from job tasks to the coordinator.
#[derive(Debug)]
enum WorkerMessage {
    Progress {
        index: usize,
        update: TransferProgress,
    },
    Finished {
        index: usize,
        outcome: DownloadOutcome,
    },
}

/// A running batch.
#[derive(Debug)]
pub struct BatchHandle {
    /// Event stream; ends after [`BatchEvent::BatchCompleted`].
    pub events: mpsc::UnboundedReceiver<BatchEvent>,
    task: JoinHandle<BatchSummary>,
}

impl BatchHandle {
    /// Wait for the batch to finish, discarding remaining events.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BatchAborted`] if the coordinator task died.
    pub async fn wait(self) -> Result<BatchSummary> {
        drop(self.events);
        self.task
            .await
            .map_err(|e| Error::BatchAborted(e.to_string()))
    }
}

/// Runs batches of download jobs on a bounded pool.
#[derive(Debug, Clone)]
pub struct DownloadOrchestrator {
    worker: DownloadWorker,
    pool_size: usize,
}

impl DownloadOrchestrator {
    /// Create an orchestrator.
    #[must_use]
    pub fn new(worker: DownloadWorker, config: &QueueConfig) -> Self {
        Self {
            worker,
            pool_size: config.pool_size(),
        }
    }

    /// Number of jobs allowed to run at once.
    #[must_use]
    pub const fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Start a batch in the background.
    #[must_use]
    pub fn start_batch(&self, jobs: Vec<DownloadJob>, dest: PathBuf) -> BatchHandle {
        let (events_tx, events) = mpsc::unbounded_channel();
        let worker = self.worker.clone();
        let pool_size = self.pool_size;

        info!(
            "Starting batch of {} job(s) into {} with {} worker(s)",
            jobs.len(),
            dest.display(),
            pool_size
        );

        let task = tokio::spawn(coordinate(worker, jobs, dest, pool_size, events_tx));
        BatchHandle { events, task }
    }

    /// Run a batch to completion, passing every event to `on_event`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BatchAborted`] if the coordinator task died.
    pub async fn run_batch<F>(
        &self,
        jobs: Vec<DownloadJob>,
        dest: PathBuf,
        mut on_event: F,
    ) -> Result<BatchSummary>
    where
        F: FnMut(&BatchEvent),
    {
        let mut handle = self.start_batch(jobs, dest);
        while let Some(event) = handle.events.recv().await {
            on_event(&event);
            if matches!(event, BatchEvent::BatchCompleted(_)) {
                break;
            }
        }
        handle.wait().await
    }
}

async fn coordinate(
    worker: DownloadWorker,
    jobs: Vec<DownloadJob>,
    dest: PathBuf,
    pool_size: usize,
    events: mpsc::UnboundedSender<BatchEvent>,
) -> BatchSummary {
    let job_count = jobs.len();
    let (tx, mut rx) = mpsc::unbounded_channel::<WorkerMessage>();
    let semaphore = Arc::new(Semaphore::new(pool_size));
    let mut tasks = JoinSet::new();

    for (index, job) in jobs.iter().cloned().enumerate() {
        let worker = worker.clone();
        let semaphore = Arc::clone(&semaphore);
        let dest = dest.clone();
        let tx = tx.clone();

        tasks.spawn(async move {
            let outcome = match semaphore.acquire_owned().await {
                Ok(_permit) => {
                    let progress_tx = tx.clone();
                    let sink = ProgressSink::new(move |update| {
                        let _ = progress_tx.send(WorkerMessage::Progress { index, update });
                    });
                    worker.download(&job, &dest, sink).await
                }
                Err(_) => DownloadOutcome::failed(&job, "download pool closed"),
            };
            let _ = tx.send(WorkerMessage::Finished { index, outcome });
        });
    }
    drop(tx);

    let emit = |event: BatchEvent| {
        let _ = events.send(event);
    };

    let mut state = ProgressState::new(job_count);
    let mut outcomes: Vec<Option<DownloadOutcome>> = vec![None; job_count];
    let mut last_reported: Option<(f64, usize)> = None;

    let mut report = |state: &mut ProgressState| {
        let current = (state.percent(), state.done());
        if last_reported != Some(current) {
            last_reported = Some(current);
            emit(BatchEvent::Aggregate {
                percent: current.0,
                done: current.1,
                total: job_count,
            });
        }
    };

    report(&mut state);

    while !state.is_complete() {
        let Some(message) = rx.recv().await else {
            break;
        };

        match message {
            WorkerMessage::Progress {
                index,
                update: TransferProgress::Bytes { downloaded, total },
            } => {
                state.record_bytes(index, downloaded, total);
                if let Some(job) = jobs.get(index) {
                    emit(BatchEvent::JobProgress {
                        index,
                        video_id: job.video_id.clone(),
                        downloaded,
                        total,
                    });
                }
            }
            WorkerMessage::Progress {
                index,
                update: TransferProgress::Finished,
            } => state.mark_transferred(index),
            WorkerMessage::Finished { index, outcome } => {
                if state.settle(index, outcome.success) {
                    debug!(
                        "Job {} finished ({}/{})",
                        outcome.url,
                        state.done(),
                        job_count
                    );
                    emit(BatchEvent::JobFinished {
                        index,
                        outcome: outcome.clone(),
                    });
                    outcomes[index] = Some(outcome);
                }
            }
        }

        report(&mut state);
    }

    // Jobs whose task died never reported; they count as failed.
    for (index, slot) in outcomes.iter_mut().enumerate() {
        if slot.is_none() {
            warn!("Job {} ended without a result", index);
            let outcome = DownloadOutcome::failed(&jobs[index], "download task ended unexpectedly");
            state.settle(index, false);
            emit(BatchEvent::JobFinished {
                index,
                outcome: outcome.clone(),
            });
            *slot = Some(outcome);
        }
    }
    report(&mut state);

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!("Download task failed: {}", e);
        }
    }

    let summary = BatchSummary::from_outcomes(outcomes.into_iter().flatten().collect());
    info!(
        "Batch completed: {} succeeded, {} failed",
        summary.succeeded, summary.failed
    );
    emit(BatchEvent::BatchCompleted(summary.clone()));
    summary
}
