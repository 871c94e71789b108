//! Test doubles: a scripted in-memory portal and a recording progress sink.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{AuthError, DownloadError, PortalError};
use crate::model::{CourseRef, Credential, RemoteFile, RemoteRef, Session, SessionState};
use crate::portal::{PortalSession, RemoteStream};
use crate::progress::{ProgressEvent, ProgressSink, SyncPhase};
use crate::report::SyncReport;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone)]
struct FetchFailure {
    error: DownloadError,
    remaining: usize,
}

/// A portal whose behaviour is scripted up front.
///
/// Files are addressed by name in the failure and counter helpers.
#[derive(Default)]
pub(crate) struct ScriptedPortal {
    courses: Mutex<Vec<CourseRef>>,
    files: Mutex<BTreeMap<(String, String), Vec<RemoteFile>>>,
    contents: Mutex<HashMap<RemoteRef, Vec<u8>>>,
    auth_error: Option<AuthError>,
    auth_network_failures: AtomicUsize,
    session: Mutex<Session>,
    expire_list_courses: AtomicUsize,
    expire_list_files: AtomicUsize,
    list_files_network_failures: AtomicUsize,
    list_files_fatal: Mutex<Option<(String, PortalError)>>,
    fetch_failures: Mutex<HashMap<String, FetchFailure>>,
    truncations: Mutex<HashMap<String, usize>>,
    fetch_delay: Option<Duration>,
    auth_calls: AtomicUsize,
    list_files_calls: AtomicUsize,
    fetch_calls: Mutex<HashMap<String, usize>>,
    concurrent_fetches: AtomicUsize,
    peak_fetches: AtomicUsize,
}

impl ScriptedPortal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn course(self, id: &str, name: &str, tabs: &[&str]) -> Self {
        lock(&self.courses).push(CourseRef::new(id, name).with_tabs(tabs.iter().copied()));
        self
    }

    pub(crate) fn file(self, course_id: &str, tab: &str, name: &str, content: &[u8]) -> Self {
        self.push_file(course_id, tab, name, content, Some(content.len() as u64));
        self
    }

    /// A file whose size the portal does not announce in listings.
    pub(crate) fn file_without_size(self, course_id: &str, tab: &str, name: &str, content: &[u8]) -> Self {
        self.push_file(course_id, tab, name, content, None);
        self
    }

    /// Add or replace a listed file after construction.
    pub(crate) fn push_file(
        &self,
        course_id: &str,
        tab: &str,
        name: &str,
        content: &[u8],
        size: Option<u64>,
    ) {
        self.put_file(course_id, tab, name, content, size, None);
    }

    /// Replace a listed file with new content and a new modification time.
    pub(crate) fn revise_file(
        &self,
        course_id: &str,
        tab: &str,
        name: &str,
        content: &[u8],
        modified: DateTime<Utc>,
    ) {
        self.put_file(course_id, tab, name, content, Some(content.len() as u64), Some(modified));
    }

    fn put_file(
        &self,
        course_id: &str,
        tab: &str,
        name: &str,
        content: &[u8],
        size: Option<u64>,
        modified: Option<DateTime<Utc>>,
    ) {
        let remote_ref = RemoteRef(format!("{}/{}/{}", course_id, tab, name));
        let file = RemoteFile::new(course_id, tab, name, remote_ref.clone(), size, modified);
        let mut files = lock(&self.files);
        let listing = files
            .entry((course_id.to_string(), tab.to_string()))
            .or_default();
        listing.retain(|f| f.name != name);
        listing.push(file);
        lock(&self.contents).insert(remote_ref, content.to_vec());
    }

    /// List the same file twice in one tab.
    pub(crate) fn duplicate_listing(self, course_id: &str, tab: &str, name: &str) -> Self {
        {
            let mut files = lock(&self.files);
            if let Some(listing) = files.get_mut(&(course_id.to_string(), tab.to_string())) {
                if let Some(file) = listing.iter().find(|f| f.name == name).cloned() {
                    listing.push(file);
                }
            }
        }
        self
    }

    pub(crate) fn fail_auth(mut self, error: AuthError) -> Self {
        self.auth_error = Some(error);
        self
    }

    pub(crate) fn auth_network_failures(self, times: usize) -> Self {
        self.auth_network_failures.store(times, Ordering::SeqCst);
        self
    }

    /// The next `times` calls to `list_courses` report an expired session.
    pub(crate) fn expire_list_courses(self, times: usize) -> Self {
        self.expire_list_courses.store(times, Ordering::SeqCst);
        self
    }

    /// The next `times` calls to `list_files` report an expired session.
    pub(crate) fn expire_list_files(self, times: usize) -> Self {
        self.expire_list_files.store(times, Ordering::SeqCst);
        self
    }

    pub(crate) fn list_files_network_failures(self, times: usize) -> Self {
        self.list_files_network_failures.store(times, Ordering::SeqCst);
        self
    }

    /// Every `list_files` call for `course_id` fails with `error`.
    pub(crate) fn fail_list_files(self, course_id: &str, error: PortalError) -> Self {
        *lock(&self.list_files_fatal) = Some((course_id.to_string(), error));
        self
    }

    /// Every fetch of `name` fails with `error`.
    pub(crate) fn fail_fetch(self, name: &str, error: DownloadError) -> Self {
        self.fail_fetch_times(name, error, usize::MAX)
    }

    /// The first `times` fetches of `name` fail with `error`.
    pub(crate) fn fail_fetch_times(self, name: &str, error: DownloadError, times: usize) -> Self {
        lock(&self.fetch_failures).insert(
            name.to_string(),
            FetchFailure {
                error,
                remaining: times,
            },
        );
        self
    }

    /// Streams of `name` end after `bytes` while still announcing the full size.
    pub(crate) fn truncate_fetch(self, name: &str, bytes: usize) -> Self {
        lock(&self.truncations).insert(name.to_string(), bytes);
        self
    }

    pub(crate) fn fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    pub(crate) fn files_of(&self, course_id: &str, tab: &str) -> Vec<RemoteFile> {
        lock(&self.files)
            .get(&(course_id.to_string(), tab.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn auth_calls(&self) -> usize {
        self.auth_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn list_files_calls(&self) -> usize {
        self.list_files_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn fetch_calls_for(&self, name: &str) -> usize {
        lock(&self.fetch_calls).get(name).copied().unwrap_or(0)
    }

    pub(crate) fn total_fetch_calls(&self) -> usize {
        lock(&self.fetch_calls).values().sum()
    }

    pub(crate) fn peak_concurrent_fetches(&self) -> usize {
        self.peak_fetches.load(Ordering::SeqCst)
    }

    fn require_session(&self) -> Result<(), PortalError> {
        if lock(&self.session).state == SessionState::Authenticated {
            Ok(())
        } else {
            Err(PortalError::SessionExpired)
        }
    }

    /// Consume one unit of a countdown; true while it was still positive.
    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn expire_now(&self) -> PortalError {
        lock(&self.session).state = SessionState::Expired;
        PortalError::SessionExpired
    }
}

impl PortalSession for ScriptedPortal {
    fn authenticate(&self, _credential: &Credential) -> Result<SessionState, AuthError> {
        self.auth_calls.fetch_add(1, Ordering::SeqCst);
        if lock(&self.session).state == SessionState::Authenticated {
            return Ok(SessionState::Authenticated);
        }
        if Self::take(&self.auth_network_failures) {
            return Err(AuthError::NetworkFailure {
                message: "connection refused".to_string(),
            });
        }
        if let Some(error) = &self.auth_error {
            return Err(error.clone());
        }
        *lock(&self.session) = Session::authenticated(Utc::now());
        Ok(SessionState::Authenticated)
    }

    fn session(&self) -> Session {
        lock(&self.session).clone()
    }

    fn list_courses(&self) -> Result<Vec<CourseRef>, PortalError> {
        self.require_session()?;
        if Self::take(&self.expire_list_courses) {
            return Err(self.expire_now());
        }
        Ok(lock(&self.courses).clone())
    }

    fn list_files(&self, course_id: &str, tab: &str) -> Result<Vec<RemoteFile>, PortalError> {
        self.list_files_calls.fetch_add(1, Ordering::SeqCst);
        self.require_session()?;
        if Self::take(&self.expire_list_files) {
            return Err(self.expire_now());
        }
        if Self::take(&self.list_files_network_failures) {
            return Err(PortalError::NetworkFailure {
                message: "timed out".to_string(),
            });
        }
        if let Some((failing, error)) = lock(&self.list_files_fatal).as_ref() {
            if failing == course_id {
                return Err(error.clone());
            }
        }
        Ok(self.files_of(course_id, tab))
    }

    fn fetch(&self, remote_ref: &RemoteRef) -> Result<RemoteStream, DownloadError> {
        let name = remote_ref
            .as_str()
            .splitn(3, '/')
            .nth(2)
            .unwrap_or(remote_ref.as_str())
            .to_string();
        *lock(&self.fetch_calls).entry(name.clone()).or_insert(0) += 1;

        let now = self.concurrent_fetches.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_fetches.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.fetch_delay {
            thread::sleep(delay);
        }
        self.concurrent_fetches.fetch_sub(1, Ordering::SeqCst);

        {
            let mut failures = lock(&self.fetch_failures);
            if let Some(failure) = failures.get_mut(&name) {
                if failure.remaining > 0 {
                    failure.remaining -= 1;
                    return Err(failure.error.clone());
                }
            }
        }

        let content = lock(&self.contents)
            .get(remote_ref)
            .cloned()
            .ok_or_else(|| DownloadError::RemoteRefInvalid {
                message: format!("no such file: {}", remote_ref),
            })?;
        let length = content.len() as u64;
        let served = match lock(&self.truncations).get(&name) {
            Some(&limit) => content[..limit.min(content.len())].to_vec(),
            None => content,
        };
        Ok(RemoteStream::new(Box::new(io::Cursor::new(served)), Some(length)))
    }

    fn logout(&self) {
        *lock(&self.session) = Session::logged_out();
    }
}

/// Collects every event and report it receives.
#[derive(Default)]
pub(crate) struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
    reports: Mutex<Vec<SyncReport>>,
}

impl RecordingSink {
    pub(crate) fn events(&self) -> Vec<ProgressEvent> {
        lock(&self.events).clone()
    }

    pub(crate) fn reports(&self) -> Vec<SyncReport> {
        lock(&self.reports).clone()
    }

    /// Reported phases in order, consecutive repeats collapsed.
    pub(crate) fn phases(&self) -> Vec<SyncPhase> {
        let mut phases: Vec<SyncPhase> = Vec::new();
        for event in lock(&self.events).iter() {
            if phases.last() != Some(&event.phase) {
                phases.push(event.phase);
            }
        }
        phases
    }
}

impl ProgressSink for RecordingSink {
    fn on_progress(&self, event: ProgressEvent) {
        lock(&self.events).push(event);
    }

    fn on_report(&self, report: &SyncReport) {
        lock(&self.reports).push(report.clone());
    }
}
