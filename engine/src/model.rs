//! Core data model for course synchronization.
//!
//! This module defines the records the engine passes between its parts:
//! - Credential and Session: authentication state owned by the portal adapter
//! - CourseRef and RemoteFile: what enumeration yields
//! - Fingerprint and DedupRecord: identity of files already placed locally
//! - DownloadTask: one pending transfer and its outcome
//! - OverwritePolicy: what to do with untracked files already on disk

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DownloadError;

/// Login credential for the portal.
///
/// Held in memory only. The secret never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    username: String,
    secret: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Credential {
            username: username.into(),
            secret: secret.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Authentication state of a portal session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    LoggedOut,
    Authenticating,
    Authenticated,
    /// The portal invalidated the session; a new login is required.
    Expired,
}

/// A portal session as observed by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub state: SessionState,
    pub established_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn logged_out() -> Self {
        Session {
            state: SessionState::LoggedOut,
            established_at: None,
        }
    }

    pub fn authenticated(at: DateTime<Utc>) -> Self {
        Session {
            state: SessionState::Authenticated,
            established_at: Some(at),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == SessionState::Authenticated
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::logged_out()
    }
}

/// A course known to the engine.
///
/// `user_alias`, `enabled` and `selected_tabs` are user overrides. They are
/// keyed by `id` and survive every re-enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CourseRef {
    pub id: String,
    pub canonical_name: String,
    pub user_alias: Option<String>,
    pub enabled: bool,
    pub available_tabs: BTreeSet<String>,
    pub selected_tabs: BTreeSet<String>,
}

impl CourseRef {
    pub fn new(id: impl Into<String>, canonical_name: impl Into<String>) -> Self {
        CourseRef {
            id: id.into(),
            canonical_name: canonical_name.into(),
            user_alias: None,
            enabled: true,
            available_tabs: BTreeSet::new(),
            selected_tabs: BTreeSet::new(),
        }
    }

    pub fn with_tabs<I, S>(mut self, tabs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.available_tabs = tabs.into_iter().map(Into::into).collect();
        self
    }

    /// Name used for the local course folder and in reports.
    pub fn display_name(&self) -> &str {
        match self.user_alias.as_deref() {
            Some(alias) if !alias.trim().is_empty() => alias.trim(),
            _ => &self.canonical_name,
        }
    }
}

impl Default for CourseRef {
    fn default() -> Self {
        CourseRef::new(String::new(), String::new())
    }
}

/// Opaque locator for a remote file (URL, form token, path...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteRef(pub String);

impl RemoteRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Dedup identity of a remote file, derived from its metadata.
///
/// Not a content hash: computing one would require downloading the file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Derive the fingerprint from tab, name, and whatever of size and
    /// modification time the portal exposes. Unknown fields hash as absent,
    /// so a file keeps its identity as long as the portal keeps reporting
    /// the same metadata for it.
    pub fn derive(
        tab: &str,
        name: &str,
        size: Option<u64>,
        last_modified: Option<DateTime<Utc>>,
    ) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(tab.as_bytes());
        hasher.update(&[0]);
        hasher.update(name.as_bytes());
        hasher.update(&[0]);
        match size {
            Some(size) => hasher.update(size.to_string().as_bytes()),
            None => hasher.update(b"?"),
        };
        hasher.update(&[0]);
        match last_modified {
            Some(ts) => hasher.update(ts.timestamp().to_string().as_bytes()),
            None => hasher.update(b"?"),
        };
        Fingerprint(hasher.finalize().to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A file discovered on the portal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub course_id: String,
    pub tab: String,
    /// Display name; `/` separates sub-folders within the tab.
    pub name: String,
    pub remote_ref: RemoteRef,
    pub size: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
    pub fingerprint: Fingerprint,
}

impl RemoteFile {
    pub fn new(
        course_id: impl Into<String>,
        tab: impl Into<String>,
        name: impl Into<String>,
        remote_ref: RemoteRef,
        size: Option<u64>,
        last_modified: Option<DateTime<Utc>>,
    ) -> Self {
        let tab = tab.into();
        let name = name.into();
        let fingerprint = Fingerprint::derive(&tab, &name, size, last_modified);
        RemoteFile {
            course_id: course_id.into(),
            tab,
            name,
            remote_ref,
            size,
            last_modified,
            fingerprint,
        }
    }
}

/// A file the engine itself has placed in local storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupRecord {
    pub course_id: String,
    pub fingerprint: Fingerprint,
    pub local_path: PathBuf,
    pub completed_at: DateTime<Utc>,
    /// Content checksum of the local copy, `algo:hex`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// The state of a single download task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Queued, or waiting for a retry
    Pending,
    /// An attempt is transferring bytes
    InFlight,
    /// Written, committed, and recorded in the dedup index
    Succeeded,
    /// Gave up; see `DownloadTask::error`
    Failed,
}

impl TaskState {
    /// Returns true if this state is terminal (no further changes expected).
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }
}

/// One file to download, plus its bookkeeping.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub id: Uuid,
    pub file: RemoteFile,
    /// 1-based index of the course within the current sync
    pub course_index: usize,
    pub course_name: String,
    /// Where the committed file lands
    pub local_path: PathBuf,
    /// Attempts started so far
    pub attempt: u32,
    pub state: TaskState,
    pub error: Option<DownloadError>,
    pub bytes_written: u64,
    pub checksum: Option<String>,
}

impl DownloadTask {
    pub fn new(
        file: RemoteFile,
        course_index: usize,
        course_name: impl Into<String>,
        local_path: PathBuf,
    ) -> Self {
        DownloadTask {
            id: Uuid::new_v4(),
            file,
            course_index,
            course_name: course_name.into(),
            local_path,
            attempt: 0,
            state: TaskState::Pending,
            error: None,
            bytes_written: 0,
            checksum: None,
        }
    }
}

/// Policy for candidates that are new to the dedup index but whose target
/// path already exists locally. Except under `Skip`, a file the engine placed
/// itself is fetched again once its remote version changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverwritePolicy {
    /// Keep the local file and adopt it into the index
    #[serde(rename = "never", alias = "skip")]
    Skip,
    /// Keep the local file if its size matches the remote size; otherwise replace it
    #[serde(rename = "size", alias = "smart")]
    SmartUpdate,
    /// Always replace the local file
    #[serde(rename = "always", alias = "overwrite")]
    Overwrite,
}

impl Default for OverwritePolicy {
    fn default() -> Self {
        OverwritePolicy::SmartUpdate
    }
}

impl fmt::Display for OverwritePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverwritePolicy::Skip => write!(f, "never"),
            OverwritePolicy::SmartUpdate => write!(f, "size"),
            OverwritePolicy::Overwrite => write!(f, "always"),
        }
    }
}
