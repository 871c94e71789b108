//! Dedup index: which remote files the engine has already placed locally.
//!
//! Keyed by (course_id, fingerprint). Backed by a sharded concurrent map so
//! workers recording different files never contend on a single lock, while a
//! second `record` for the same key is a no-op. A course holds at most one
//! record per local path: recording a new version of a file retires the
//! record of the version it replaced.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::error::StorageError;
use crate::fs_ops::LocalStorage;
use crate::model::{DedupRecord, Fingerprint};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupKey {
    course_id: String,
    fingerprint: Fingerprint,
}

impl DedupKey {
    fn new(course_id: &str, fingerprint: &Fingerprint) -> Self {
        DedupKey {
            course_id: course_id.to_string(),
            fingerprint: fingerprint.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct DedupIndex {
    records: DashMap<DedupKey, DedupRecord>,
    /// course_id -> record count, rebuilt lazily after writes
    counts: RwLock<Option<BTreeMap<String, usize>>>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index from persisted records. Duplicate keys keep the first record.
    pub fn from_records(records: impl IntoIterator<Item = DedupRecord>) -> Self {
        let index = Self::new();
        for record in records {
            let key = DedupKey::new(&record.course_id, &record.fingerprint);
            index.records.entry(key).or_insert(record);
        }
        index
    }

    pub fn load(storage: &LocalStorage) -> Result<Self, StorageError> {
        let index = Self::from_records(storage.read_dedup_state()?);
        debug!(records = index.len(), "loaded dedup index");
        Ok(index)
    }

    pub fn save(&self, storage: &LocalStorage) -> Result<(), StorageError> {
        storage.write_dedup_state(self.records())
    }

    pub fn is_new(&self, course_id: &str, fingerprint: &Fingerprint) -> bool {
        !self.records.contains_key(&DedupKey::new(course_id, fingerprint))
    }

    /// Record a file that has been durably written, retiring any other
    /// record of the same course that points at the same path.
    ///
    /// Returns false if the key was already recorded; the existing record is kept.
    pub fn record(
        &self,
        course_id: &str,
        fingerprint: &Fingerprint,
        local_path: PathBuf,
        checksum: Option<String>,
    ) -> bool {
        let inserted = match self.records.entry(DedupKey::new(course_id, fingerprint)) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(DedupRecord {
                    course_id: course_id.to_string(),
                    fingerprint: fingerprint.clone(),
                    local_path: local_path.clone(),
                    completed_at: Utc::now(),
                    checksum,
                });
                true
            }
        };
        if inserted {
            let before = self.records.len();
            self.records.retain(|key, record| {
                key.course_id != course_id || key.fingerprint == *fingerprint || record.local_path != local_path
            });
            let retired = before.saturating_sub(self.records.len());
            if retired > 0 {
                debug!(course_id, path = %local_path.display(), retired, "retired superseded record");
            }
            self.invalidate_counts();
        }
        inserted
    }

    /// Fingerprint of the record that placed `local_path` for this course.
    pub fn find_by_path(&self, course_id: &str, local_path: &Path) -> Option<Fingerprint> {
        self.records
            .iter()
            .find(|entry| entry.key().course_id == course_id && entry.value().local_path == local_path)
            .map(|entry| entry.key().fingerprint.clone())
    }

    pub fn get(&self, course_id: &str, fingerprint: &Fingerprint) -> Option<DedupRecord> {
        self.records
            .get(&DedupKey::new(course_id, fingerprint))
            .map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records, ordered by course and fingerprint.
    pub fn records(&self) -> Vec<DedupRecord> {
        let mut records: Vec<DedupRecord> =
            self.records.iter().map(|entry| entry.value().clone()).collect();
        records.sort_by(|a, b| {
            a.course_id
                .cmp(&b.course_id)
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });
        records
    }

    /// Number of recorded files per course_id.
    pub fn course_counts(&self) -> BTreeMap<String, usize> {
        if let Some(counts) = self.counts.read().unwrap_or_else(|e| e.into_inner()).as_ref() {
            return counts.clone();
        }

        // Count under the write guard so a concurrent invalidation cannot
        // be overwritten by a stale result
        let mut cache = self.counts.write().unwrap_or_else(|e| e.into_inner());
        if let Some(counts) = cache.as_ref() {
            return counts.clone();
        }
        let mut counts = BTreeMap::new();
        for entry in self.records.iter() {
            *counts.entry(entry.key().course_id.clone()).or_insert(0) += 1;
        }
        *cache = Some(counts.clone());
        counts
    }

    /// Rewrite local paths of a course's records after its folder moved.
    ///
    /// Returns the number of records updated.
    pub fn relocate(&self, course_id: &str, old_root: &Path, new_root: &Path) -> usize {
        let mut moved = 0;
        for mut entry in self.records.iter_mut() {
            if entry.key().course_id != course_id {
                continue;
            }
            let record = entry.value_mut();
            if let Ok(rest) = record.local_path.strip_prefix(old_root) {
                record.local_path = new_root.join(rest);
                moved += 1;
            }
        }
        moved
    }

    fn invalidate_counts(&self) {
        let mut cache = self.counts.write().unwrap_or_else(|e| e.into_inner());
        *cache = None;
    }
}
