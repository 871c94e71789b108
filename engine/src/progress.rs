//! Progress reporting.
//!
//! This module defines the ProgressSink trait, which decouples the sync
//! engine from any specific UI technology. The sink is injected into the
//! engine at construction; there is no process-wide event bus.
//!
//! Producers (the orchestrator and the download workers) only push events
//! onto a queue. A single dispatcher thread per sync drains it and calls the
//! sink, in production order, so a slow sink never holds up a download.
//! The queue is flushed before a sync returns.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Sender};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::model::DownloadTask;
use crate::report::SyncReport;

/// Minimum gap between two byte-progress events.
const STREAM_THROTTLE: Duration = Duration::from_millis(100);

/// Orchestrator phase, as reported in progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Authenticating,
    Enumerating,
    Diffing,
    Downloading,
    Reporting,
    /// Only used for the final event of a sync that produced a report
    Complete,
    Failed,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Authenticating => "authenticating",
            SyncPhase::Enumerating => "enumerating",
            SyncPhase::Diffing => "diffing",
            SyncPhase::Downloading => "downloading",
            SyncPhase::Reporting => "reporting",
            SyncPhase::Complete => "complete",
            SyncPhase::Failed => "failed",
        }
    }
}

/// Downloaded / skipped / failed counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl SyncCounts {
    pub fn total(&self) -> usize {
        self.downloaded + self.skipped + self.failed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub phase: SyncPhase,
    /// 1-based; 0 before the first course is reached
    pub current_course_index: usize,
    pub total_courses: usize,
    pub current_course_name: Option<String>,
    pub current_file_name: Option<String>,
    pub current_file_size: Option<u64>,
    pub current_file_downloaded: u64,
    pub stats: SyncCounts,
}

/// Receives progress events and the final report of every sync.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);

    /// Called once per sync with the report that was persisted.
    fn on_report(&self, _report: &SyncReport) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn on_progress(&self, _event: ProgressEvent) {}
}

/// Message forwarded by a [`ChannelSink`].
#[derive(Debug, Clone)]
pub enum SyncUpdate {
    Progress(ProgressEvent),
    Finished(SyncReport),
}

/// Forwards events into an unbounded channel. Sending never blocks; if the
/// receiver is gone, events are dropped.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<SyncUpdate>,
}

impl ChannelSink {
    pub fn new(tx: Sender<SyncUpdate>) -> Self {
        ChannelSink { tx }
    }
}

impl ProgressSink for ChannelSink {
    fn on_progress(&self, event: ProgressEvent) {
        let _ = self.tx.send(SyncUpdate::Progress(event));
    }

    fn on_report(&self, report: &SyncReport) {
        let _ = self.tx.send(SyncUpdate::Finished(report.clone()));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn deliver(sink: &dyn ProgressSink, update: SyncUpdate) {
    match update {
        SyncUpdate::Progress(event) => sink.on_progress(event),
        SyncUpdate::Finished(report) => sink.on_report(&report),
    }
}

/// Shared counters plus the event queue, used by the orchestrator and the
/// workers.
pub(crate) struct ProgressReporter {
    sink: Arc<dyn ProgressSink>,
    queue: Mutex<Option<Sender<SyncUpdate>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    total_courses: AtomicUsize,
    downloaded: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    last_stream_event: Mutex<Option<Instant>>,
}

impl ProgressReporter {
    /// Start the dispatcher thread for `sink`. If it cannot be spawned,
    /// events are delivered on the producing thread instead.
    pub(crate) fn new(sink: Arc<dyn ProgressSink>) -> Self {
        let (tx, rx) = unbounded::<SyncUpdate>();
        let target = Arc::clone(&sink);
        let spawned = thread::Builder::new()
            .name("coursesync-progress".to_string())
            .spawn(move || {
                for update in rx.iter() {
                    deliver(target.as_ref(), update);
                }
            });
        let (queue, dispatcher) = match spawned {
            Ok(handle) => (Some(tx), Some(handle)),
            Err(e) => {
                warn!(error = %e, "failed to spawn progress dispatcher, delivering inline");
                (None, None)
            }
        };

        ProgressReporter {
            sink,
            queue: Mutex::new(queue),
            dispatcher: Mutex::new(dispatcher),
            total_courses: AtomicUsize::new(0),
            downloaded: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            last_stream_event: Mutex::new(None),
        }
    }

    pub(crate) fn set_total_courses(&self, total: usize) {
        self.total_courses.store(total, Ordering::SeqCst);
    }

    pub(crate) fn add_downloaded(&self) {
        self.downloaded.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn add_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn add_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn stats(&self) -> SyncCounts {
        SyncCounts {
            downloaded: self.downloaded.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }

    /// Phase change without a current file.
    pub(crate) fn phase(&self, phase: SyncPhase, course_index: usize, course_name: Option<&str>) {
        self.emit(ProgressEvent {
            phase,
            current_course_index: course_index,
            total_courses: self.total_courses.load(Ordering::SeqCst),
            current_course_name: course_name.map(str::to_string),
            current_file_name: None,
            current_file_size: None,
            current_file_downloaded: 0,
            stats: self.stats(),
        });
    }

    /// A task changed state.
    pub(crate) fn task(&self, task: &DownloadTask) {
        self.emit(self.task_event(task, task.bytes_written));
    }

    /// Bytes arrived for an in-flight task. Throttled.
    pub(crate) fn bytes(&self, task: &DownloadTask, downloaded: u64) {
        {
            let mut last = lock(&self.last_stream_event);
            let now = Instant::now();
            if let Some(previous) = *last {
                if now.duration_since(previous) < STREAM_THROTTLE {
                    return;
                }
            }
            *last = Some(now);
        }
        self.emit(self.task_event(task, downloaded));
    }

    /// Hand the persisted report to the sink, after every earlier event.
    pub(crate) fn report(&self, report: &SyncReport) {
        self.send(SyncUpdate::Finished(report.clone()));
    }

    /// Deliver everything still queued and stop the dispatcher. Later
    /// events go straight to the sink.
    pub(crate) fn close(&self) {
        drop(lock(&self.queue).take());
        let handle = lock(&self.dispatcher).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("progress sink panicked");
            }
        }
    }

    fn task_event(&self, task: &DownloadTask, downloaded: u64) -> ProgressEvent {
        ProgressEvent {
            phase: SyncPhase::Downloading,
            current_course_index: task.course_index,
            total_courses: self.total_courses.load(Ordering::SeqCst),
            current_course_name: Some(task.course_name.clone()),
            current_file_name: Some(task.file.name.clone()),
            current_file_size: task.file.size,
            current_file_downloaded: downloaded,
            stats: self.stats(),
        }
    }

    fn emit(&self, event: ProgressEvent) {
        self.send(SyncUpdate::Progress(event));
    }

    fn send(&self, update: SyncUpdate) {
        let undelivered = match lock(&self.queue).as_ref() {
            Some(tx) => tx.send(update).err().map(|e| e.into_inner()),
            None => Some(update),
        };
        if let Some(update) = undelivered {
            deliver(self.sink.as_ref(), update);
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.close();
    }
}
