//! Bounded-concurrency download scheduler.
//!
//! A fixed pool of worker threads drains a FIFO queue of [`DownloadTask`]s.
//! The queue (an unbounded crossbeam channel) is the only structure the
//! workers share with the submitter. Each worker, per task:
//!
//! 1. fetches the remote stream,
//! 2. streams it into a temporary file beside the final path,
//! 3. renames it into place and records it in the dedup index.
//!
//! Transient failures are retried with linear backoff; anything else fails
//! the task at once. Errors never leave the task: a failed task is returned
//! to the caller with its error attached.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::checksums::ChecksumAlgorithm;
use crate::config::SyncConfig;
use crate::dedup::DedupIndex;
use crate::error::DownloadError;
use crate::fs_ops::LocalStorage;
use crate::model::{DownloadTask, TaskState};
use crate::portal::PortalSession;
use crate::progress::ProgressReporter;

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub workers: usize,
    pub max_attempts: u32,
    /// Base of the linear backoff: retry k waits `base × (2k − 1)`
    pub retry_backoff: Duration,
    pub checksum: Option<ChecksumAlgorithm>,
}

impl SchedulerOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        SchedulerOptions {
            workers: config.concurrent_downloads.max(1),
            max_attempts: config.max_attempts.max(1),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            checksum: config.checksum,
        }
    }

    fn retry_delay(&self, retry: u32) -> Duration {
        self.retry_backoff * (retry.max(1) * 2 - 1)
    }
}

/// Counts attempts currently transferring bytes, and the highest count seen.
#[derive(Debug, Default)]
pub(crate) struct InFlightGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlightGauge {
    fn enter(&self) -> InFlightGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlightGuard { gauge: self }
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct InFlightGuard<'a> {
    gauge: &'a InFlightGauge,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.gauge.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Everything a worker needs, shared by all workers.
pub(crate) struct WorkerContext {
    pub(crate) portal: Arc<dyn PortalSession>,
    pub(crate) storage: Arc<LocalStorage>,
    pub(crate) dedup: Arc<DedupIndex>,
    pub(crate) progress: Arc<ProgressReporter>,
    pub(crate) cancel: CancellationToken,
    pub(crate) options: SchedulerOptions,
    gauge: InFlightGauge,
}

impl WorkerContext {
    pub(crate) fn new(
        portal: Arc<dyn PortalSession>,
        storage: Arc<LocalStorage>,
        dedup: Arc<DedupIndex>,
        progress: Arc<ProgressReporter>,
        cancel: CancellationToken,
        options: SchedulerOptions,
    ) -> Self {
        WorkerContext {
            portal,
            storage,
            dedup,
            progress,
            cancel,
            options,
            gauge: InFlightGauge::default(),
        }
    }
}

/// What the scheduler hands back once drained.
#[derive(Debug)]
pub struct SchedulerOutcome {
    /// Every submitted task. Tasks still `Pending` were never dispatched
    /// because the sync was cancelled.
    pub tasks: Vec<DownloadTask>,
    /// Highest number of simultaneously in-flight attempts
    pub peak_in_flight: usize,
}

pub(crate) struct DownloadScheduler {
    context: Arc<WorkerContext>,
    queue_tx: Option<Sender<DownloadTask>>,
    queue_rx: Receiver<DownloadTask>,
    done_tx: Sender<DownloadTask>,
    done_rx: Receiver<DownloadTask>,
    workers: Vec<JoinHandle<()>>,
    undispatched: Vec<DownloadTask>,
}

impl DownloadScheduler {
    /// Spawn the worker pool.
    pub(crate) fn start(context: WorkerContext) -> Self {
        let context = Arc::new(context);
        let (queue_tx, queue_rx) = unbounded::<DownloadTask>();
        let (done_tx, done_rx) = unbounded::<DownloadTask>();

        let mut workers = Vec::with_capacity(context.options.workers);
        for index in 0..context.options.workers {
            let ctx = Arc::clone(&context);
            let queue = queue_rx.clone();
            let done = done_tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("coursesync-worker-{}", index))
                .spawn(move || worker_loop(&ctx, &queue, &done));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => warn!(worker = index, error = %e, "failed to spawn download worker"),
            }
        }
        debug!(workers = workers.len(), "download workers started");

        DownloadScheduler {
            context,
            queue_tx: Some(queue_tx),
            queue_rx,
            done_tx,
            done_rx,
            workers,
            undispatched: Vec::new(),
        }
    }

    /// Enqueue tasks. Safe while workers are draining earlier batches.
    pub(crate) fn submit(&mut self, tasks: Vec<DownloadTask>) {
        for task in tasks {
            match &self.queue_tx {
                Some(tx) => {
                    if let Err(err) = tx.send(task) {
                        self.undispatched.push(err.into_inner());
                    }
                }
                None => self.undispatched.push(task),
            }
        }
    }

    /// Close the queue, wait for every task to reach a final state, and
    /// return them all.
    pub(crate) fn join(mut self) -> SchedulerOutcome {
        self.queue_tx = None;

        if self.workers.is_empty() {
            // Could not spawn anything; drain on the calling thread
            worker_loop(&self.context, &self.queue_rx, &self.done_tx);
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("download worker panicked");
            }
        }

        let mut tasks: Vec<DownloadTask> = self.done_rx.try_iter().collect();
        // Anything a panicked worker left in the queue
        tasks.extend(self.queue_rx.try_iter());
        tasks.append(&mut self.undispatched);

        SchedulerOutcome {
            tasks,
            peak_in_flight: self.context.gauge.peak(),
        }
    }
}

fn worker_loop(ctx: &WorkerContext, queue: &Receiver<DownloadTask>, done: &Sender<DownloadTask>) {
    for mut task in queue.iter() {
        if ctx.cancel.is_cancelled() {
            debug!(file = %task.file.name, "not dispatched: sync cancelled");
        } else {
            run_task(ctx, &mut task);
        }
        if done.send(task).is_err() {
            warn!("scheduler dropped before collecting a finished task");
        }
    }
}

/// Drive one task to a terminal state (or leave it `Pending` when cancelled
/// before its first attempt).
fn run_task(ctx: &WorkerContext, task: &mut DownloadTask) {
    loop {
        task.attempt += 1;
        task.state = TaskState::InFlight;
        task.error = None;

        let result = {
            let _in_flight = ctx.gauge.enter();
            ctx.progress.task(task);
            attempt_download(ctx, task)
        };

        let error = match result {
            Ok(()) => {
                task.state = TaskState::Succeeded;
                ctx.progress.add_downloaded();
                ctx.progress.task(task);
                info!(
                    course = %task.course_name,
                    file = %task.file.name,
                    bytes = task.bytes_written,
                    "downloaded"
                );
                return;
            }
            Err(error) => error,
        };

        if error.is_transient() && task.attempt < ctx.options.max_attempts {
            let delay = ctx.options.retry_delay(task.attempt);
            warn!(
                file = %task.file.name,
                attempt = task.attempt,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "download failed, retrying"
            );
            task.state = TaskState::Pending;
            task.error = Some(error);
            ctx.progress.task(task);
            if ctx.cancel.sleep(delay) {
                continue;
            }
            debug!(file = %task.file.name, "retry abandoned: sync cancelled");
        } else {
            task.error = Some(error);
        }

        task.state = TaskState::Failed;
        ctx.progress.add_failed();
        ctx.progress.task(task);
        if let Some(error) = &task.error {
            warn!(
                course = %task.course_name,
                file = %task.file.name,
                attempts = task.attempt,
                error = %error,
                "download failed"
            );
        }
        return;
    }
}

fn attempt_download(ctx: &WorkerContext, task: &mut DownloadTask) -> Result<(), DownloadError> {
    let mut stream = ctx.portal.fetch(&task.file.remote_ref)?;
    let expected = stream.content_length;
    let tag = task.id.simple().to_string();

    let temp = {
        let view: &DownloadTask = task;
        let progress = &ctx.progress;
        ctx.storage
            .write_temp(
                &view.local_path,
                &tag,
                &mut stream,
                ctx.options.checksum,
                &mut |written| progress.bytes(view, written),
            )
            .map_err(DownloadError::from)?
    };

    if let Some(expected) = expected {
        if temp.bytes != expected {
            ctx.storage.discard(&temp.path);
            return Err(DownloadError::NetworkFailure {
                message: format!("incomplete transfer: {} of {} bytes", temp.bytes, expected),
            });
        }
    }

    if let Err(e) = ctx
        .storage
        .commit(&temp.path, &task.local_path, task.file.last_modified)
    {
        ctx.storage.discard(&temp.path);
        return Err(DownloadError::from_local_io(&e));
    }

    task.bytes_written = temp.bytes;
    task.checksum = temp.checksum.map(|c| c.to_string_with_algo());
    ctx.dedup.record(
        &task.file.course_id,
        &task.file.fingerprint,
        task.local_path.clone(),
        task.checksum.clone(),
    );
    Ok(())
}
