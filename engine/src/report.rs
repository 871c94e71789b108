//! Sync reports and their append-only history.
//!
//! Every sync, whatever its outcome, ends with exactly one [`SyncReport`]
//! appended to the [`ReportStore`]. Reports are immutable once written.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Local, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ErrorType, StorageError};
use crate::fs_ops::write_json;
use crate::model::{DownloadTask, RemoteFile};
use crate::progress::SyncCounts;

const SYNC_ID_FORMAT: &str = "%Y-%m-%d_%H%M%S";

/// Skip reasons written into reports.
pub const REASON_ALREADY_EXISTS: &str = "already exists";
pub const REASON_EXISTS_LOCALLY: &str = "exists locally";
pub const REASON_SAME_SIZE: &str = "same size";
pub const REASON_DUPLICATE: &str = "duplicate in listing";
pub const REASON_CANCELLED: &str = "cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Success,
    #[serde(alias = "partial_failure")]
    Partial,
    Failed,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Success => write!(f, "success"),
            SyncStatus::Partial => write!(f, "partial"),
            SyncStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One file in a report bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub name: String,
    pub course: String,
    pub course_id: String,
    pub tab: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Why a file was skipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl FileRecord {
    fn from_file(file: &RemoteFile, course: &str) -> Self {
        FileRecord {
            name: file.name.clone(),
            course: course.to_string(),
            course_id: file.course_id.clone(),
            tab: file.tab.clone(),
            size: file.size,
            local_path: None,
            checksum: None,
            reason: None,
            error_type: None,
            message: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportFiles {
    pub downloaded: Vec<FileRecord>,
    pub skipped: Vec<FileRecord>,
    pub failed: Vec<FileRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub sync_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default)]
    pub duration_seconds: f64,
    pub status: SyncStatus,
    pub summary: SyncCounts,
    #[serde(default)]
    pub files: ReportFiles,
    /// Terminal error of a failed sync
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncReport {
    pub fn to_summary(&self) -> ReportSummary {
        ReportSummary {
            sync_id: self.sync_id.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            duration_seconds: self.duration_seconds,
            status: self.status,
            summary: self.summary,
            error: self.error.clone(),
        }
    }
}

/// A report without its file lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub sync_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub status: SyncStatus,
    pub summary: SyncCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Collects outcomes during a sync and produces the final report.
#[derive(Debug)]
pub struct ReportBuilder {
    sync_id: String,
    started_at: DateTime<Utc>,
    files: ReportFiles,
    cancelled: bool,
}

impl ReportBuilder {
    pub fn new(sync_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        ReportBuilder {
            sync_id: sync_id.into(),
            started_at,
            files: ReportFiles::default(),
            cancelled: false,
        }
    }

    pub fn sync_id(&self) -> &str {
        &self.sync_id
    }

    pub fn downloaded(&mut self, task: &DownloadTask) {
        let mut record = FileRecord::from_file(&task.file, &task.course_name);
        record.size = Some(task.bytes_written);
        record.local_path = Some(task.local_path.clone());
        record.checksum = task.checksum.clone();
        self.files.downloaded.push(record);
    }

    pub fn skipped(&mut self, file: &RemoteFile, course: &str, local_path: Option<&Path>, reason: &str) {
        let mut record = FileRecord::from_file(file, course);
        record.local_path = local_path.map(Path::to_path_buf);
        record.reason = Some(reason.to_string());
        self.files.skipped.push(record);
    }

    /// A task that was never dispatched because the sync was cancelled.
    pub fn cancelled(&mut self, task: &DownloadTask) {
        self.cancelled = true;
        self.skipped(&task.file, &task.course_name, Some(&task.local_path), REASON_CANCELLED);
    }

    /// The sync stopped early; the report can be at best `partial`.
    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    pub fn failed(&mut self, task: &DownloadTask) {
        let mut record = FileRecord::from_file(&task.file, &task.course_name);
        if let Some(error) = &task.error {
            record.error_type = Some(error.error_type());
            record.message = Some(error.message().to_string());
        }
        self.files.failed.push(record);
    }

    pub fn counts(&self) -> SyncCounts {
        SyncCounts {
            downloaded: self.files.downloaded.len(),
            skipped: self.files.skipped.len(),
            failed: self.files.failed.len(),
        }
    }

    /// Finalize. A terminal `error` makes the sync `failed`; otherwise any
    /// failed or cancelled file makes it `partial`.
    pub fn finish(mut self, error: Option<String>) -> SyncReport {
        for bucket in [
            &mut self.files.downloaded,
            &mut self.files.skipped,
            &mut self.files.failed,
        ] {
            bucket.sort_by(|a, b| {
                a.name
                    .cmp(&b.name)
                    .then_with(|| a.course_id.cmp(&b.course_id))
                    .then_with(|| a.tab.cmp(&b.tab))
            });
        }

        let summary = self.counts();
        let status = if error.is_some() {
            SyncStatus::Failed
        } else if summary.failed > 0 || self.cancelled {
            SyncStatus::Partial
        } else {
            SyncStatus::Success
        };

        let finished_at = Utc::now();
        let duration_seconds =
            (finished_at - self.started_at).num_milliseconds().max(0) as f64 / 1000.0;

        SyncReport {
            sync_id: self.sync_id,
            started_at: self.started_at,
            finished_at,
            duration_seconds,
            status,
            summary,
            files: self.files,
            error,
        }
    }
}

/// Append-only report history, one JSON file per report.
#[derive(Debug)]
pub struct ReportStore {
    dir: PathBuf,
    last_id: Mutex<Option<NaiveDateTime>>,
}

impl ReportStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        let last_id = stored_ids(&dir)?
            .iter()
            .filter_map(|id| parse_sync_id(id))
            .max();
        Ok(ReportStore {
            dir,
            last_id: Mutex::new(last_id),
        })
    }

    /// Next sync id: local wall-clock time to the millisecond, bumped so it
    /// is always strictly greater than every id handed out before.
    pub fn next_sync_id(&self) -> String {
        let mut last = self.last_id.lock().unwrap_or_else(|e| e.into_inner());
        let mut candidate = Local::now().naive_local();
        if let Some(previous) = *last {
            if candidate <= previous {
                candidate = previous + chrono::Duration::milliseconds(1);
            }
        }
        *last = Some(candidate);
        format_sync_id(candidate)
    }

    /// Persist a finalized report. Existing reports are never replaced.
    pub fn append(&self, report: &SyncReport) -> Result<(), StorageError> {
        let path = self.report_path(&report.sync_id).ok_or_else(|| {
            StorageError::io(
                self.dir.join(&report.sync_id),
                io::Error::new(io::ErrorKind::InvalidInput, "invalid sync id"),
            )
        })?;
        if path.exists() {
            return Err(StorageError::io(
                path,
                io::Error::new(io::ErrorKind::AlreadyExists, "report already exists"),
            ));
        }
        write_json(&path, report)?;
        debug!(sync_id = %report.sync_id, status = %report.status, "report stored");
        Ok(())
    }

    /// Most recent first.
    pub fn list(&self, limit: usize) -> Result<Vec<ReportSummary>, StorageError> {
        let mut ids = stored_ids(&self.dir)?;
        ids.sort_unstable_by(|a, b| b.cmp(a));

        let mut summaries = Vec::new();
        for id in ids {
            if summaries.len() >= limit {
                break;
            }
            match self.get(&id) {
                Ok(Some(report)) => summaries.push(report.to_summary()),
                Ok(None) => {}
                Err(e) => warn!(sync_id = %id, error = %e, "skipping unreadable report"),
            }
        }
        Ok(summaries)
    }

    pub fn get(&self, sync_id: &str) -> Result<Option<SyncReport>, StorageError> {
        let path = match self.report_path(sync_id) {
            Some(path) => path,
            None => return Ok(None),
        };
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io(path, e)),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| StorageError::Serialization { path, source })
    }

    fn report_path(&self, sync_id: &str) -> Option<PathBuf> {
        let valid = !sync_id.is_empty()
            && sync_id
                .chars()
                .all(|c| c.is_ascii_digit() || c == '-' || c == '_');
        valid.then(|| self.dir.join(format!("{}.json", sync_id)))
    }
}

fn format_sync_id(at: NaiveDateTime) -> String {
    at.format("%Y-%m-%d_%H%M%S_%3f").to_string()
}

fn parse_sync_id(id: &str) -> Option<NaiveDateTime> {
    let (head, millis) = id.rsplit_once('_')?;
    let millis: i64 = millis.parse().ok()?;
    let base = NaiveDateTime::parse_from_str(head, SYNC_ID_FORMAT).ok()?;
    Some(base + chrono::Duration::milliseconds(millis))
}

/// Ids of every stored report; a missing directory means no reports.
fn stored_ids(dir: &Path) -> Result<Vec<String>, StorageError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StorageError::io(dir, e)),
    };

    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StorageError::io(dir, e))?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            if parse_sync_id(stem).is_some() {
                ids.push(stem.to_string());
            }
        }
    }
    Ok(ids)
}
