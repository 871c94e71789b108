//! Local storage operations.
//!
//! This module provides everything the engine writes to disk:
//! - Streaming a download into a temporary file beside its final path
//! - Atomically committing (renaming) a finished download into place
//! - Filesystem-safe naming for course, tab, and file folders
//! - JSON persistence for the dedup index, course overrides, and sync state

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::checksums::{create_hasher, ChecksumAlgorithm, ChecksumValue};
use crate::config::SyncConfig;
use crate::error::{StorageError, StreamError};
use crate::model::{CourseRef, DedupRecord, RemoteFile};
use crate::report::SyncStatus;

const DEDUP_FILE: &str = "dedup_index.json";
const COURSES_FILE: &str = "courses.json";
const STATE_FILE: &str = "state.json";
const REPORTS_DIR: &str = "reports";

/// Longest name, in bytes, kept for a single path segment.
const MAX_NAME_BYTES: usize = 200;

/// Longest file name most filesystems accept, in bytes.
const MAX_SEGMENT_BYTES: usize = 255;

/// Extensions up to this many bytes (dot included) survive truncation.
const MAX_EXTENSION_BYTES: usize = 16;

/// A finished temporary download, not yet committed.
#[derive(Debug)]
pub struct TempFile {
    pub path: PathBuf,
    pub bytes: u64,
    pub checksum: Option<ChecksumValue>,
}

/// On-disk form of the dedup index.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct DedupState {
    records: Vec<DedupRecord>,
}

/// On-disk form of the known courses and their user overrides.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct CourseState {
    courses: BTreeMap<String, CourseRef>,
}

/// Runtime state kept between syncs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncState {
    pub last_sync: Option<DateTime<Utc>>,
    pub last_sync_id: Option<String>,
    pub last_status: Option<SyncStatus>,
    /// Files downloaded by the last sync
    pub last_added: usize,
}

/// Local storage rooted at the download directory, with engine state kept
/// in a separate state directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    download_dir: PathBuf,
    state_dir: PathBuf,
}

impl LocalStorage {
    pub fn new(download_dir: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        LocalStorage {
            download_dir: download_dir.into(),
            state_dir: state_dir.into(),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.download_dir.clone(), config.state_dir())
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.state_dir.join(REPORTS_DIR)
    }

    /// Local folder for a course, named after its alias or canonical name.
    pub fn course_dir(&self, course: &CourseRef) -> PathBuf {
        self.download_dir.join(sanitize_name(course.display_name()))
    }

    /// Where a remote file lands once committed.
    pub fn final_path(&self, course: &CourseRef, file: &RemoteFile, flatten_tabs: bool) -> PathBuf {
        let mut path = self.course_dir(course);
        if !flatten_tabs {
            path.push(sanitize_name(&file.tab));
        }
        for segment in file.name.split('/').filter(|s| !s.trim().is_empty()) {
            path.push(sanitize_name(segment));
        }
        path
    }

    /// Stream `reader` into a temporary file beside `final_path`.
    ///
    /// `tag` keeps concurrent downloads of the same target apart.
    /// `on_chunk` is called with the running byte count after every write.
    /// On error the temporary file is removed.
    pub fn write_temp(
        &self,
        final_path: &Path,
        tag: &str,
        reader: &mut dyn Read,
        checksum: Option<ChecksumAlgorithm>,
        on_chunk: &mut dyn FnMut(u64),
    ) -> Result<TempFile, StreamError> {
        ensure_parent_dir_exists(final_path).map_err(StreamError::Local)?;
        let temp_path = temp_path_for(final_path, tag);

        match stream_to_file(&temp_path, reader, checksum, on_chunk) {
            Ok((bytes, checksum)) => Ok(TempFile {
                path: temp_path,
                bytes,
                checksum,
            }),
            Err(e) => {
                self.discard(&temp_path);
                Err(e)
            }
        }
    }

    /// Atomically move a finished temporary file to its final path,
    /// replacing whatever is there, and apply the remote modification time.
    pub fn commit(
        &self,
        temp_path: &Path,
        final_path: &Path,
        modified: Option<DateTime<Utc>>,
    ) -> io::Result<()> {
        fs::rename(temp_path, final_path)?;
        if let Some(modified) = modified {
            let mtime = filetime::FileTime::from_unix_time(modified.timestamp(), 0);
            if let Err(e) = filetime::set_file_mtime(final_path, mtime) {
                warn!(path = %final_path.display(), error = %e, "failed to preserve modification time");
            }
        }
        Ok(())
    }

    /// Remove a temporary file; missing files are fine.
    pub fn discard(&self, temp_path: &Path) {
        if let Err(e) = fs::remove_file(temp_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %temp_path.display(), error = %e, "failed to remove temporary file");
            }
        }
    }

    pub fn read_dedup_state(&self) -> Result<Vec<DedupRecord>, StorageError> {
        let state: DedupState = read_json(&self.state_dir.join(DEDUP_FILE))?;
        Ok(state.records)
    }

    pub fn write_dedup_state(&self, records: Vec<DedupRecord>) -> Result<(), StorageError> {
        write_json(&self.state_dir.join(DEDUP_FILE), &DedupState { records })
    }

    pub fn read_courses(&self) -> Result<BTreeMap<String, CourseRef>, StorageError> {
        let state: CourseState = read_json(&self.state_dir.join(COURSES_FILE))?;
        Ok(state.courses)
    }

    pub fn write_courses(&self, courses: BTreeMap<String, CourseRef>) -> Result<(), StorageError> {
        write_json(&self.state_dir.join(COURSES_FILE), &CourseState { courses })
    }

    pub fn read_sync_state(&self) -> Result<SyncState, StorageError> {
        read_json(&self.state_dir.join(STATE_FILE))
    }

    pub fn write_sync_state(&self, state: &SyncState) -> Result<(), StorageError> {
        write_json(&self.state_dir.join(STATE_FILE), state)
    }
}

/// Hidden sibling of `final_path`, kept within the per-segment byte limit.
fn temp_path_for(final_path: &Path, tag: &str) -> PathBuf {
    let name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    // "." + name + "." + tag + ".part"
    let room = MAX_SEGMENT_BYTES.saturating_sub(tag.len() + 7);
    final_path.with_file_name(format!(".{}.{}.part", truncate_bytes(&name, room), tag))
}

fn stream_to_file(
    temp_path: &Path,
    reader: &mut dyn Read,
    checksum: Option<ChecksumAlgorithm>,
    on_chunk: &mut dyn FnMut(u64),
) -> Result<(u64, Option<ChecksumValue>), StreamError> {
    let mut file = fs::File::create(temp_path).map_err(StreamError::Local)?;
    let mut hasher = checksum.map(create_hasher);
    let mut buffer = vec![0u8; 64 * 1024];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(StreamError::Remote(e)),
        };
        file.write_all(&buffer[..n]).map_err(StreamError::Local)?;
        if let Some(hasher) = hasher.as_mut() {
            hasher.update(&buffer[..n]);
        }
        total += n as u64;
        on_chunk(total);
    }

    file.sync_all().map_err(StreamError::Local)?;
    Ok((total, hasher.map(|h| h.finalize())))
}

/// Make a single path segment safe for the filesystem.
///
/// Drops characters that are invalid on common filesystems, trims dots and
/// spaces at both ends, and caps the length in bytes. A short extension
/// is kept when the stem has to be cut.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !matches!(c, '\\' | '/' | '*' | '?' | ':' | '"' | '<' | '>' | '|' | '\r' | '\n'))
        .collect();
    let trimmed = cleaned.trim_matches(is_edge_char);
    if trimmed.is_empty() {
        return "unnamed".to_string();
    }
    if trimmed.len() <= MAX_NAME_BYTES {
        return trimmed.to_string();
    }

    let (stem, extension) = match trimmed.rfind('.') {
        Some(dot) if dot > 0 && trimmed.len() - dot <= MAX_EXTENSION_BYTES => trimmed.split_at(dot),
        _ => (trimmed, ""),
    };
    let stem = truncate_bytes(stem, MAX_NAME_BYTES - extension.len()).trim_end_matches(is_edge_char);
    format!("{}{}", stem, extension)
}

fn is_edge_char(c: char) -> bool {
    c == '.' || c == ' '
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a char.
fn truncate_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Ensure the parent directory of a path exists, creating it if necessary.
pub fn ensure_parent_dir_exists(path: &Path) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => return Ok(()),
    };

    match fs::metadata(parent) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("parent path exists but is not a directory: {}", parent.display()),
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => fs::create_dir_all(parent),
        Err(e) => Err(e),
    }
}

/// Read a JSON state file; a missing file yields the default value.
fn read_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StorageError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => return Err(StorageError::io(path, e)),
    };
    serde_json::from_str(&text).map_err(|source| StorageError::Serialization {
        path: path.to_path_buf(),
        source,
    })
}

/// Write a JSON file through a temporary sibling and rename it into place.
pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    ensure_parent_dir_exists(path).map_err(|e| StorageError::io(path, e))?;
    let text = serde_json::to_string_pretty(value).map_err(|source| StorageError::Serialization {
        path: path.to_path_buf(),
        source,
    })?;
    let temp = temp_path_for(path, "tmp");
    fs::write(&temp, text).map_err(|e| StorageError::io(&temp, e))?;
    fs::rename(&temp, path).map_err(|e| StorageError::io(path, e))
}
