//! # CourseSync Engine - Course Material Sync Library
//!
//! A headless engine that mirrors the files of a university course portal
//! into a local folder tree. Designed as the foundation for multiple front
//! ends (CLI, desktop shell, automation).
//!
//! ## Overview
//!
//! One sync logs in, enumerates courses and their tabs, skips everything the
//! dedup index already knows, downloads the rest concurrently, and stores a
//! per-run report. It features:
//! - Session handling with transparent re-login on expiry
//! - A persisted, per-course dedup index keyed by remote fingerprint
//! - Bounded concurrent downloads with retry of transient failures
//! - Atomic file placement (temp file, then rename)
//! - Per-course aliases, tab selection, and enable/disable switches
//! - Progress reporting via a sink trait (decoupled from UI technology)
//!
//! ## Basic Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use coursesync::{Credential, FsPortal, NullSink, SyncConfig, SyncEngine};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SyncConfig::load_or_default(Some("coursesync.toml".as_ref()))?;
//! let portal = Arc::new(FsPortal::open("/srv/portal")?);
//!
//! let engine = SyncEngine::new(config, portal, Arc::new(NullSink))?
//!     .with_credential(Credential::new("student", "secret"));
//!
//! let report = engine.start_sync()?;
//! println!(
//!     "{}: {} downloaded, {} skipped, {} failed",
//!     report.status, report.summary.downloaded, report.summary.skipped, report.summary.failed
//! );
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Core data structures (CourseRef, RemoteFile, DownloadTask, enums)
//! - **error**: Error types and handling
//! - **config**: Configuration file loading and validation
//! - **portal**: The portal adapter trait; **fs_portal** is a directory-backed adapter
//! - **courses**: Course registry with user overrides
//! - **dedup**: Dedup index of files already placed locally
//! - **fs_ops**: Local folder layout, atomic writes, and persisted state
//! - **scheduler**: Concurrent download workers with retry
//! - **report**: Sync reports and their on-disk history
//! - **progress**: Progress events and sinks
//! - **sync**: The orchestrating `SyncEngine`
//! - **checksums**: Checksum computation

pub mod cancel;
pub mod checksums;
pub mod config;
pub mod courses;
pub mod dedup;
pub mod error;
pub mod fs_ops;
pub mod fs_portal;
pub mod model;
pub mod portal;
pub mod progress;
pub mod report;
pub mod scheduler;
pub mod sync;

#[cfg(test)]
mod testing;

// Re-export main types
pub use cancel::CancellationToken;
pub use checksums::{compute_file_checksum, ChecksumAlgorithm, ChecksumValue};
pub use config::SyncConfig;
pub use courses::CourseUpdate;
pub use error::{
    AuthError, ConfigError, DownloadError, ErrorType, PortalError, StorageError, StreamError, SyncError,
};
pub use fs_ops::SyncState;
pub use fs_portal::FsPortal;
pub use model::{
    CourseRef, Credential, DedupRecord, DownloadTask, Fingerprint, OverwritePolicy, RemoteFile,
    RemoteRef, Session, SessionState, TaskState,
};
pub use portal::{PortalSession, RemoteStream};
pub use progress::{ChannelSink, NullSink, ProgressEvent, ProgressSink, SyncCounts, SyncPhase, SyncUpdate};
pub use report::{FileRecord, ReportFiles, ReportSummary, SyncReport, SyncStatus};
pub use sync::{LocalStats, SyncEngine};
