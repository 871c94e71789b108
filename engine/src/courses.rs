//! Known courses and the user overrides attached to them.
//!
//! Enumeration refreshes canonical names and available tabs; the user-set
//! fields (alias, enabled, selected tabs) are merged forward by course id.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use tracing::{debug, info};

use crate::error::{StorageError, SyncError};
use crate::fs_ops::LocalStorage;
use crate::model::CourseRef;

/// A partial update of a course's user overrides. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CourseUpdate {
    /// `Some(None)` clears the alias
    pub alias: Option<Option<String>>,
    pub enabled: Option<bool>,
    pub selected_tabs: Option<BTreeSet<String>>,
}

/// How newly discovered courses get their initial tab selection.
#[derive(Debug, Clone, Default)]
pub struct TabDefaults {
    pub default_tabs: Vec<String>,
    pub all_tabs: bool,
}

impl TabDefaults {
    fn initial_selection(&self, available: &BTreeSet<String>) -> BTreeSet<String> {
        if self.all_tabs {
            return available.clone();
        }
        self.default_tabs
            .iter()
            .filter(|tab| available.contains(*tab))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct CourseRegistry {
    courses: Mutex<BTreeMap<String, CourseRef>>,
}

impl CourseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(storage: &LocalStorage) -> Result<Self, StorageError> {
        let courses = storage.read_courses()?;
        debug!(courses = courses.len(), "loaded course overrides");
        Ok(CourseRegistry {
            courses: Mutex::new(courses),
        })
    }

    pub fn save(&self, storage: &LocalStorage) -> Result<(), StorageError> {
        let snapshot = self.lock().clone();
        storage.write_courses(snapshot)
    }

    /// Merge freshly enumerated courses into the registry.
    ///
    /// Returns the merged records in enumeration order. Courses missing from
    /// this enumeration stay in the registry so their overrides survive.
    pub fn merge_enumerated(&self, remote: Vec<CourseRef>, defaults: &TabDefaults) -> Vec<CourseRef> {
        let mut courses = self.lock();
        let mut merged = Vec::with_capacity(remote.len());

        for incoming in remote {
            let course = match courses.get(&incoming.id) {
                Some(existing) => CourseRef {
                    id: incoming.id.clone(),
                    canonical_name: incoming.canonical_name,
                    user_alias: existing.user_alias.clone(),
                    enabled: existing.enabled,
                    available_tabs: incoming.available_tabs,
                    selected_tabs: existing.selected_tabs.clone(),
                },
                None => {
                    info!(course_id = %incoming.id, name = %incoming.canonical_name, "discovered new course");
                    let selected_tabs = defaults.initial_selection(&incoming.available_tabs);
                    CourseRef {
                        id: incoming.id.clone(),
                        canonical_name: incoming.canonical_name,
                        user_alias: None,
                        enabled: true,
                        available_tabs: incoming.available_tabs,
                        selected_tabs,
                    }
                }
            };
            courses.insert(course.id.clone(), course.clone());
            merged.push(course);
        }

        merged
    }

    /// Apply a user update. Returns the record before and after.
    pub fn update(&self, id: &str, update: CourseUpdate) -> Result<(CourseRef, CourseRef), SyncError> {
        let mut courses = self.lock();
        let course = courses
            .get_mut(id)
            .ok_or_else(|| SyncError::UnknownCourse { id: id.to_string() })?;
        let before = course.clone();

        if let Some(alias) = update.alias {
            course.user_alias = alias
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty());
        }
        if let Some(enabled) = update.enabled {
            course.enabled = enabled;
        }
        if let Some(tabs) = update.selected_tabs {
            course.selected_tabs = tabs;
        }

        Ok((before, course.clone()))
    }

    pub fn get(&self, id: &str) -> Option<CourseRef> {
        self.lock().get(id).cloned()
    }

    /// Every known course, ordered by id.
    pub fn all(&self) -> Vec<CourseRef> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, CourseRef>> {
        self.courses.lock().unwrap_or_else(|e| e.into_inner())
    }
}
