//! Error types for the sync engine.
//!
//! Errors are split by the layer that produces them:
//! - `AuthError` and `PortalError` come from the portal adapter and abort the
//!   current sync unless the orchestrator recovers them locally
//!   (one transparent re-login on session expiry, one retry on network failure).
//! - `DownloadError` is task-level. It is recorded on the task and folded into
//!   the sync report, never returned as `Err` from a sync.
//! - `StorageError` and `ConfigError` cover local persistence and configuration.
//! - `SyncError` is what the engine's public operations return.

use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Login failures reported by a portal adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("network failure during login: {message}")]
    NetworkFailure { message: String },

    #[error("portal requires a captcha or multi-factor challenge")]
    CaptchaOrMfaRequired,

    #[error("unexpected portal response during login: {message}")]
    UnknownPortalError { message: String },
}

/// Enumeration failures reported by a portal adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortalError {
    /// The portal silently invalidated the session.
    #[error("portal session expired")]
    SessionExpired,

    #[error("network failure: {message}")]
    NetworkFailure { message: String },

    /// A page or record did not have the expected shape.
    #[error("malformed portal response: {message}")]
    MalformedResponse { message: String },
}

/// Serializable tag for a download failure, written into sync reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorType {
    NetworkFailure,
    Timeout,
    PermissionDenied,
    RemoteRefInvalid,
    DiskFull,
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorType::NetworkFailure => "NetworkFailure",
            ErrorType::Timeout => "Timeout",
            ErrorType::PermissionDenied => "PermissionDenied",
            ErrorType::RemoteRefInvalid => "RemoteRefInvalid",
            ErrorType::DiskFull => "DiskFull",
        };
        f.write_str(name)
    }
}

/// Failure of a single download attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DownloadError {
    #[error("network failure: {message}")]
    NetworkFailure { message: String },

    #[error("timed out: {message}")]
    Timeout { message: String },

    #[error("permission denied: {message}")]
    PermissionDenied { message: String },

    /// The remote locator no longer resolves to a file.
    #[error("remote reference invalid: {message}")]
    RemoteRefInvalid { message: String },

    #[error("disk full: {message}")]
    DiskFull { message: String },
}

impl DownloadError {
    /// Transient errors are retried; everything else fails the task immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DownloadError::NetworkFailure { .. } | DownloadError::Timeout { .. }
        )
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            DownloadError::NetworkFailure { .. } => ErrorType::NetworkFailure,
            DownloadError::Timeout { .. } => ErrorType::Timeout,
            DownloadError::PermissionDenied { .. } => ErrorType::PermissionDenied,
            DownloadError::RemoteRefInvalid { .. } => ErrorType::RemoteRefInvalid,
            DownloadError::DiskFull { .. } => ErrorType::DiskFull,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            DownloadError::NetworkFailure { message }
            | DownloadError::Timeout { message }
            | DownloadError::PermissionDenied { message }
            | DownloadError::RemoteRefInvalid { message }
            | DownloadError::DiskFull { message } => message,
        }
    }

    /// Classify an I/O error raised while fetching a file.
    pub fn from_io(err: &io::Error) -> Self {
        let message = err.to_string();
        if is_disk_full(err) {
            return DownloadError::DiskFull { message };
        }
        match err.kind() {
            io::ErrorKind::PermissionDenied => DownloadError::PermissionDenied { message },
            io::ErrorKind::TimedOut => DownloadError::Timeout { message },
            io::ErrorKind::NotFound => DownloadError::RemoteRefInvalid { message },
            _ => DownloadError::NetworkFailure { message },
        }
    }

    /// Classify an I/O error raised on the local side (creating folders,
    /// writing, renaming). Retrying would hit the same filesystem, so
    /// nothing here is transient.
    pub fn from_local_io(err: &io::Error) -> Self {
        let message = err.to_string();
        if is_disk_full(err) {
            DownloadError::DiskFull { message }
        } else {
            DownloadError::PermissionDenied { message }
        }
    }
}

/// Failure while streaming a download to disk, split by which side failed.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("reading remote stream: {0}")]
    Remote(#[source] io::Error),

    #[error("writing local file: {0}")]
    Local(#[source] io::Error),
}

impl From<StreamError> for DownloadError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Remote(e) => DownloadError::from_io(&e),
            StreamError::Local(e) => DownloadError::from_local_io(&e),
        }
    }
}

#[cfg(unix)]
fn is_disk_full(err: &io::Error) -> bool {
    // ENOSPC, EDQUOT
    matches!(err.raw_os_error(), Some(28) | Some(122))
}

#[cfg(windows)]
fn is_disk_full(err: &io::Error) -> bool {
    // ERROR_HANDLE_DISK_FULL, ERROR_DISK_FULL
    matches!(err.raw_os_error(), Some(39) | Some(112))
}

#[cfg(not(any(unix, windows)))]
fn is_disk_full(_err: &io::Error) -> bool {
    false
}

/// Local persistence failures (state files, reports, course folders).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to (de)serialize {}: {source}", path.display())]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Errors returned by the engine's public operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("portal error: {0}")]
    Portal(#[from] PortalError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("a sync is already running")]
    AlreadyRunning,

    #[error("no credential configured")]
    MissingCredential,

    #[error("unknown course: {id}")]
    UnknownCourse { id: String },
}
