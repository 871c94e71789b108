//! Sync orchestration.
//!
//! One sync runs: log in (unless already logged in) → enumerate courses →
//! for each enabled course and selected tab, list files, diff them against
//! the dedup index, and hand new files to the download scheduler → wait for
//! every task → build, persist, and publish the report.
//!
//! Courses are enumerated one after another; downloads for a course start
//! as soon as its tabs are diffed, while later courses are still being
//! listed.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::cancel::CancellationToken;
use crate::checksums::compute_file_checksum;
use crate::config::SyncConfig;
use crate::courses::{CourseRegistry, CourseUpdate, TabDefaults};
use crate::dedup::DedupIndex;
use crate::error::{AuthError, PortalError, StorageError, SyncError};
use crate::fs_ops::{ensure_parent_dir_exists, LocalStorage, SyncState};
use crate::model::{
    CourseRef, Credential, DownloadTask, Fingerprint, OverwritePolicy, RemoteFile, TaskState,
};
use crate::portal::PortalSession;
use crate::progress::{ProgressReporter, ProgressSink, SyncPhase};
use crate::report::{
    ReportBuilder, ReportStore, ReportSummary, SyncReport, REASON_ALREADY_EXISTS, REASON_DUPLICATE,
    REASON_EXISTS_LOCALLY, REASON_SAME_SIZE,
};
use crate::scheduler::{DownloadScheduler, SchedulerOptions, WorkerContext};

/// Files the engine has placed locally, per course display name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LocalStats {
    pub total_files: usize,
    pub courses: BTreeMap<String, usize>,
}

/// Clears the running flag when a sync (or course refresh) ends.
struct RunGuard<'a> {
    running: &'a AtomicBool,
}

impl<'a> RunGuard<'a> {
    fn acquire(running: &'a AtomicBool) -> Result<Self, SyncError> {
        running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| SyncError::AlreadyRunning)?;
        Ok(RunGuard { running })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct SyncEngine {
    config: SyncConfig,
    portal: Arc<dyn PortalSession>,
    storage: Arc<LocalStorage>,
    dedup: Arc<DedupIndex>,
    courses: CourseRegistry,
    reports: ReportStore,
    sink: Arc<dyn ProgressSink>,
    credential: Mutex<Option<Credential>>,
    phase: Mutex<SyncPhase>,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

impl SyncEngine {
    /// Build an engine, loading persisted state from the config's state dir.
    pub fn new(
        config: SyncConfig,
        portal: Arc<dyn PortalSession>,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let storage = Arc::new(LocalStorage::from_config(&config));
        let dedup = Arc::new(DedupIndex::load(&storage)?);
        let courses = CourseRegistry::load(&storage)?;
        let reports = ReportStore::open(storage.reports_dir())?;
        let credential = config.credential();

        Ok(SyncEngine {
            config,
            portal,
            storage,
            dedup,
            courses,
            reports,
            sink,
            credential: Mutex::new(credential),
            phase: Mutex::new(SyncPhase::Idle),
            running: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
        })
    }

    pub fn with_credential(self, credential: Credential) -> Self {
        self.set_credential(credential);
        self
    }

    pub fn set_credential(&self, credential: Credential) {
        *lock(&self.credential) = Some(credential);
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn download_dir(&self) -> &Path {
        self.storage.download_dir()
    }

    pub fn phase(&self) -> SyncPhase {
        *lock(&self.phase)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one sync to completion.
    ///
    /// Download failures never make this return `Err`; they end up in the
    /// report's `failed` bucket. Login and enumeration failures do, after a
    /// `failed` report has been stored.
    pub fn start_sync(&self) -> Result<SyncReport, SyncError> {
        let _guard = RunGuard::acquire(&self.running)?;
        let cancel = CancellationToken::new();
        *lock(&self.cancel) = cancel.clone();

        let progress = Arc::new(ProgressReporter::new(Arc::clone(&self.sink)));
        let mut builder = ReportBuilder::new(self.reports.next_sync_id(), Utc::now());
        info!(sync_id = %builder.sync_id(), "sync started");

        if let Err(e) = self.ensure_authenticated(&progress, &cancel) {
            return Err(self.abort(builder, &progress, e));
        }

        self.set_phase(&progress, SyncPhase::Enumerating, 0, None);
        let remote = match self.with_session_retry(&cancel, || self.portal.list_courses()) {
            Ok(remote) => remote,
            Err(e) => return Err(self.abort(builder, &progress, e)),
        };
        let active: Vec<CourseRef> = self
            .courses
            .merge_enumerated(remote, &self.tab_defaults())
            .into_iter()
            .filter(|course| course.enabled)
            .collect();
        if let Err(e) = self.courses.save(&self.storage) {
            warn!(error = %e, "failed to save course list");
        }
        progress.set_total_courses(active.len());
        info!(courses = active.len(), "enumerated courses");

        let mut scheduler = DownloadScheduler::start(WorkerContext::new(
            Arc::clone(&self.portal),
            Arc::clone(&self.storage),
            Arc::clone(&self.dedup),
            Arc::clone(&progress),
            cancel.clone(),
            SchedulerOptions::from_config(&self.config),
        ));

        let mut claimed = Claimed::default();
        let mut fatal: Option<SyncError> = None;
        'courses: for (index, course) in active.iter().enumerate() {
            if cancel.is_cancelled() {
                info!("sync cancelled during enumeration");
                builder.mark_cancelled();
                break;
            }
            let course_index = index + 1;
            for tab in &course.selected_tabs {
                if !course.available_tabs.contains(tab) {
                    warn!(course = %course.display_name(), tab = %tab, "selected tab no longer offered by the portal");
                    continue;
                }
                self.set_phase(&progress, SyncPhase::Enumerating, course_index, Some(course.display_name()));
                let files = match self.with_session_retry(&cancel, || self.portal.list_files(&course.id, tab)) {
                    Ok(files) => files,
                    Err(e) => {
                        fatal = Some(e);
                        break 'courses;
                    }
                };
                debug!(course = %course.display_name(), tab = %tab, files = files.len(), "listed tab");

                self.set_phase(&progress, SyncPhase::Diffing, course_index, Some(course.display_name()));
                let tasks = self.diff(course, course_index, files, &mut claimed, &mut builder, &progress);
                scheduler.submit(tasks);
            }
        }

        if fatal.is_some() {
            // Stop dispatching; in-flight attempts finish
            cancel.cancel();
        }
        self.set_phase(&progress, SyncPhase::Downloading, 0, None);
        let outcome = scheduler.join();
        debug!(peak_in_flight = outcome.peak_in_flight, "downloads drained");

        for task in &outcome.tasks {
            match task.state {
                TaskState::Succeeded => builder.downloaded(task),
                TaskState::Failed => builder.failed(task),
                TaskState::Pending | TaskState::InFlight => {
                    progress.add_skipped();
                    builder.cancelled(task);
                }
            }
        }

        match fatal {
            Some(e) => Err(self.abort(builder, &progress, e)),
            None => self.finish(builder, &progress, None),
        }
    }

    /// Ask a running sync to stop. Queued downloads are not started and
    /// in-flight ones finish their current attempt.
    pub fn cancel_sync(&self) {
        if self.is_running() {
            info!("cancelling sync");
        }
        lock(&self.cancel).cancel();
    }

    /// Most recent first.
    pub fn get_sync_reports(&self, limit: usize) -> Result<Vec<ReportSummary>, SyncError> {
        Ok(self.reports.list(limit)?)
    }

    pub fn get_sync_report(&self, sync_id: &str) -> Result<Option<SyncReport>, SyncError> {
        Ok(self.reports.get(sync_id)?)
    }

    /// Change a course's user overrides. Changing the alias renames the
    /// course folder if the new one does not exist yet.
    pub fn update_course_config(&self, id: &str, update: CourseUpdate) -> Result<CourseRef, SyncError> {
        if update.alias.is_some() && self.is_running() {
            return Err(SyncError::AlreadyRunning);
        }

        let (before, after) = self.courses.update(id, update)?;
        if before.display_name() != after.display_name() {
            if let Err(e) = self.move_course_folder(&before, &after) {
                // Keep the alias consistent with the folder on disk
                let revert = CourseUpdate {
                    alias: Some(before.user_alias.clone()),
                    ..CourseUpdate::default()
                };
                self.courses.update(id, revert)?;
                return Err(e.into());
            }
        }
        self.courses.save(&self.storage)?;
        info!(course_id = %id, name = %after.display_name(), enabled = after.enabled, "course updated");
        Ok(after)
    }

    pub fn get_local_stats(&self) -> LocalStats {
        let names: BTreeMap<String, String> = self
            .courses
            .all()
            .into_iter()
            .map(|course| (course.id.clone(), course.display_name().to_string()))
            .collect();

        let mut stats = LocalStats::default();
        for (course_id, count) in self.dedup.course_counts() {
            let name = names.get(&course_id).cloned().unwrap_or(course_id);
            *stats.courses.entry(name).or_insert(0) += count;
            stats.total_files += count;
        }
        stats
    }

    /// Log in if needed, enumerate courses, merge overrides, and persist.
    pub fn refresh_courses(&self) -> Result<Vec<CourseRef>, SyncError> {
        let _guard = RunGuard::acquire(&self.running)?;
        let cancel = CancellationToken::new();
        let progress = ProgressReporter::new(Arc::clone(&self.sink));

        let result = self.ensure_authenticated(&progress, &cancel).and_then(|()| {
            self.set_phase(&progress, SyncPhase::Enumerating, 0, None);
            self.with_session_retry(&cancel, || self.portal.list_courses())
        });
        *lock(&self.phase) = SyncPhase::Idle;
        progress.close();

        let merged = self.courses.merge_enumerated(result?, &self.tab_defaults());
        self.courses.save(&self.storage)?;
        Ok(merged)
    }

    /// Every known course, ordered by id.
    pub fn courses(&self) -> Vec<CourseRef> {
        self.courses.all()
    }

    pub fn sync_state(&self) -> Result<SyncState, SyncError> {
        Ok(self.storage.read_sync_state()?)
    }

    /// Drop the portal session and forget the credential.
    pub fn logout(&self) {
        self.portal.logout();
        *lock(&self.credential) = None;
        info!("logged out");
    }

    fn tab_defaults(&self) -> TabDefaults {
        TabDefaults {
            default_tabs: self.config.default_tabs.clone(),
            all_tabs: self.config.download_all_tabs,
        }
    }

    fn set_phase(
        &self,
        progress: &ProgressReporter,
        phase: SyncPhase,
        course_index: usize,
        course_name: Option<&str>,
    ) {
        *lock(&self.phase) = phase;
        progress.phase(phase, course_index, course_name);
    }

    fn ensure_authenticated(
        &self,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        if self.portal.session().is_authenticated() {
            debug!("session still valid, skipping login");
            return Ok(());
        }
        self.set_phase(progress, SyncPhase::Authenticating, 0, None);
        self.authenticate(cancel)
    }

    /// Log in, retrying network failures within the configured budget.
    fn authenticate(&self, cancel: &CancellationToken) -> Result<(), SyncError> {
        let credential = lock(&self.credential)
            .clone()
            .ok_or(SyncError::MissingCredential)?;

        let mut retries = 0;
        loop {
            match self.portal.authenticate(&credential) {
                Ok(state) => {
                    info!(user = credential.username(), ?state, "logged in");
                    return Ok(());
                }
                Err(AuthError::NetworkFailure { message }) if retries < self.config.enumeration_retries => {
                    retries += 1;
                    warn!(error = %message, retry = retries, "login failed, retrying");
                    if !cancel.sleep(self.config.retry_delay(retries)) {
                        return Err(AuthError::NetworkFailure { message }.into());
                    }
                }
                Err(e) => {
                    error!(error = %e, "login failed");
                    return Err(e.into());
                }
            }
        }
    }

    /// Run one enumeration step. An expired session gets exactly one
    /// re-login and retry of this step; network failures get the configured
    /// retry budget.
    fn with_session_retry<T>(
        &self,
        cancel: &CancellationToken,
        step: impl Fn() -> Result<T, PortalError>,
    ) -> Result<T, SyncError> {
        let mut relogged = false;
        let mut retries = 0;
        loop {
            match step() {
                Ok(value) => return Ok(value),
                Err(PortalError::SessionExpired) if !relogged => {
                    relogged = true;
                    info!("portal session expired, logging in again");
                    self.authenticate(cancel)?;
                }
                Err(PortalError::NetworkFailure { message }) if retries < self.config.enumeration_retries => {
                    retries += 1;
                    warn!(error = %message, retry = retries, "enumeration failed, retrying");
                    if !cancel.sleep(self.config.retry_delay(retries)) {
                        return Err(PortalError::NetworkFailure { message }.into());
                    }
                }
                Err(e) => {
                    error!(error = %e, "enumeration failed");
                    return Err(e.into());
                }
            }
        }
    }

    /// Split a tab listing into skips (recorded in the report directly) and
    /// download tasks.
    fn diff(
        &self,
        course: &CourseRef,
        course_index: usize,
        files: Vec<RemoteFile>,
        claimed: &mut Claimed,
        builder: &mut ReportBuilder,
        progress: &ProgressReporter,
    ) -> Vec<DownloadTask> {
        let course_name = course.display_name();
        let mut tasks = Vec::new();

        for mut file in files {
            if file.course_id != course.id {
                debug!(expected = %course.id, got = %file.course_id, "adapter returned a foreign course id");
                file.course_id = course.id.clone();
            }
            let local_path = self.storage.final_path(course, &file, self.config.flatten_tabs);

            if !claimed.claim(&file, &local_path) {
                progress.add_skipped();
                builder.skipped(&file, course_name, Some(&local_path), REASON_DUPLICATE);
                continue;
            }

            if let Some(record) = self.dedup.get(&course.id, &file.fingerprint) {
                progress.add_skipped();
                builder.skipped(&file, course_name, Some(&record.local_path), REASON_ALREADY_EXISTS);
                continue;
            }

            if self.config.overwrite != OverwritePolicy::Skip {
                if let Some(previous) = self.dedup.find_by_path(&course.id, &local_path) {
                    // The engine placed this file from an older remote version
                    debug!(file = %file.name, previous = %previous, "remote file changed, fetching again");
                    tasks.push(DownloadTask::new(file, course_index, course_name, local_path));
                    continue;
                }
            }

            if let Some(reason) = self.adoption_reason(&file, &local_path) {
                let checksum = self.config.checksum.and_then(|algo| {
                    match compute_file_checksum(&local_path, algo) {
                        Ok(value) => Some(value.to_string_with_algo()),
                        Err(e) => {
                            warn!(path = %local_path.display(), error = %e, "failed to checksum local file");
                            None
                        }
                    }
                });
                self.dedup
                    .record(&course.id, &file.fingerprint, local_path.clone(), checksum);
                debug!(file = %file.name, reason, "adopted local file");
                progress.add_skipped();
                builder.skipped(&file, course_name, Some(&local_path), reason);
                continue;
            }

            tasks.push(DownloadTask::new(file, course_index, course_name, local_path));
        }
        tasks
    }

    /// Whether an untracked file already at `local_path` should be kept.
    fn adoption_reason(&self, file: &RemoteFile, local_path: &Path) -> Option<&'static str> {
        let metadata = fs::metadata(local_path).ok().filter(|m| m.is_file())?;
        match self.config.overwrite {
            OverwritePolicy::Skip => Some(REASON_EXISTS_LOCALLY),
            OverwritePolicy::SmartUpdate if file.size == Some(metadata.len()) => Some(REASON_SAME_SIZE),
            OverwritePolicy::SmartUpdate | OverwritePolicy::Overwrite => None,
        }
    }

    fn move_course_folder(&self, before: &CourseRef, after: &CourseRef) -> Result<(), StorageError> {
        let old_dir = self.storage.course_dir(before);
        let new_dir = self.storage.course_dir(after);
        if old_dir == new_dir || !old_dir.is_dir() {
            return Ok(());
        }
        if new_dir.exists() {
            warn!(
                from = %old_dir.display(),
                to = %new_dir.display(),
                "course folder target already exists, leaving files in place"
            );
            return Ok(());
        }

        ensure_parent_dir_exists(&new_dir).map_err(|e| StorageError::io(&new_dir, e))?;
        fs::rename(&old_dir, &new_dir).map_err(|e| StorageError::io(&old_dir, e))?;
        let moved = self.dedup.relocate(&after.id, &old_dir, &new_dir);
        self.dedup.save(&self.storage)?;
        info!(from = %old_dir.display(), to = %new_dir.display(), records = moved, "renamed course folder");
        Ok(())
    }

    /// Store a `failed` report for a sync that hit a terminal error.
    fn abort(&self, builder: ReportBuilder, progress: &ProgressReporter, error: SyncError) -> SyncError {
        let message = error.to_string();
        if let Err(storage_error) = self.finish(builder, progress, Some(message)) {
            error!(error = %storage_error, "failed to store report of failed sync");
        }
        error
    }

    fn finish(
        &self,
        builder: ReportBuilder,
        progress: &ProgressReporter,
        error: Option<String>,
    ) -> Result<SyncReport, SyncError> {
        let failed = error.is_some();
        if !failed {
            self.set_phase(progress, SyncPhase::Reporting, 0, None);
        }

        if let Err(e) = self.dedup.save(&self.storage) {
            warn!(error = %e, "failed to save dedup index");
        }

        let report = builder.finish(error);
        if let Err(e) = self.reports.append(&report) {
            self.set_phase(progress, SyncPhase::Failed, 0, None);
            progress.close();
            return Err(e.into());
        }

        let state = SyncState {
            last_sync: Some(report.finished_at),
            last_sync_id: Some(report.sync_id.clone()),
            last_status: Some(report.status),
            last_added: report.summary.downloaded,
        };
        if let Err(e) = self.storage.write_sync_state(&state) {
            warn!(error = %e, "failed to save sync state");
        }

        info!(
            sync_id = %report.sync_id,
            status = %report.status,
            downloaded = report.summary.downloaded,
            skipped = report.summary.skipped,
            failed = report.summary.failed,
            "sync finished"
        );
        progress.report(&report);

        if failed {
            self.set_phase(progress, SyncPhase::Failed, 0, None);
        } else {
            progress.phase(SyncPhase::Complete, 0, None);
            *lock(&self.phase) = SyncPhase::Idle;
        }
        // The caller sees every event before the report is returned
        progress.close();
        Ok(report)
    }
}

/// Keys and local paths already taken by a candidate in the current sync.
#[derive(Default)]
struct Claimed {
    keys: HashSet<(String, Fingerprint)>,
    paths: HashSet<PathBuf>,
}

impl Claimed {
    fn claim(&mut self, file: &RemoteFile, local_path: &Path) -> bool {
        let key = (file.course_id.clone(), file.fingerprint.clone());
        if self.keys.contains(&key) || self.paths.contains(local_path) {
            return false;
        }
        self.keys.insert(key);
        self.paths.insert(local_path.to_path_buf());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DownloadError, ErrorType};
    use crate::model::SessionState;
    use crate::report::{SyncStatus, REASON_CANCELLED};
    use crate::testing::{RecordingSink, ScriptedPortal};
    use chrono::DateTime;
    use std::thread;
    use std::time::Duration;

    struct Fixture {
        temp_dir: tempfile::TempDir,
        sink: Arc<RecordingSink>,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                temp_dir: tempfile::tempdir().expect("Failed to create temp dir"),
                sink: Arc::new(RecordingSink::default()),
            }
        }

        fn config(&self) -> SyncConfig {
            SyncConfig {
                download_dir: self.temp_dir.path().join("Courses"),
                concurrent_downloads: 2,
                retry_backoff_ms: 1,
                download_all_tabs: true,
                username: Some("student".to_string()),
                password: Some("pw".to_string()),
                ..SyncConfig::default()
            }
        }

        fn engine(&self, portal: &Arc<ScriptedPortal>) -> SyncEngine {
            self.engine_with(self.config(), portal)
        }

        fn engine_with(&self, config: SyncConfig, portal: &Arc<ScriptedPortal>) -> SyncEngine {
            let sink: Arc<dyn ProgressSink> = self.sink.clone();
            SyncEngine::new(config, Arc::clone(portal) as Arc<dyn PortalSession>, sink)
                .expect("engine should start")
        }

        fn course_file(&self, course: &str, tab: &str, name: &str) -> PathBuf {
            self.temp_dir.path().join("Courses").join(course).join(tab).join(name)
        }
    }

    fn assert_complete(report: &SyncReport, candidates: usize) {
        assert_eq!(report.summary.total(), candidates, "summary must cover every candidate");
        assert_eq!(report.files.downloaded.len(), report.summary.downloaded);
        assert_eq!(report.files.skipped.len(), report.summary.skipped);
        assert_eq!(report.files.failed.len(), report.summary.failed);
    }

    fn two_course_portal() -> ScriptedPortal {
        ScriptedPortal::new()
            .course("c1", "Physics", &["Files"])
            .course("c2", "Chemistry", &["Files"])
            .file("c1", "Files", "lecture1.pdf", b"first lecture")
            .file("c1", "Files", "lecture2.pdf", b"second lecture")
            .file("c2", "Files", "old.pdf", b"already here")
    }

    #[test]
    fn test_scenario_a_new_and_known_files() {
        let fixture = Fixture::new();
        let portal = Arc::new(two_course_portal());
        let engine = fixture.engine(&portal);

        let known = &portal.files_of("c2", "Files")[0];
        engine.dedup.record(
            "c2",
            &known.fingerprint,
            fixture.course_file("Chemistry", "Files", "old.pdf"),
            None,
        );

        let report = engine.start_sync().expect("sync should succeed");

        assert_eq!(report.status, SyncStatus::Success);
        assert_eq!(report.summary.downloaded, 2);
        assert_eq!(report.summary.skipped, 1);
        assert_eq!(report.summary.failed, 0);
        assert_complete(&report, 3);
        assert_eq!(report.files.skipped[0].reason.as_deref(), Some(REASON_ALREADY_EXISTS));
        assert_eq!(
            fs::read(fixture.course_file("Physics", "Files", "lecture1.pdf")).unwrap(),
            b"first lecture"
        );
        assert_eq!(portal.fetch_calls_for("old.pdf"), 0);
    }

    #[test]
    fn test_scenario_b_invalid_credentials() {
        let fixture = Fixture::new();
        let portal = Arc::new(two_course_portal().fail_auth(AuthError::InvalidCredentials));
        let engine = fixture.engine(&portal);

        let err = engine.start_sync().unwrap_err();
        assert!(matches!(err, SyncError::Auth(AuthError::InvalidCredentials)));
        assert_eq!(engine.phase(), SyncPhase::Failed);
        assert_eq!(
            fixture.sink.phases(),
            vec![SyncPhase::Authenticating, SyncPhase::Failed]
        );

        // Exactly one record of the attempt, with nothing downloaded
        let reports = engine.get_sync_reports(10).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, SyncStatus::Failed);
        assert_eq!(reports[0].summary.total(), 0);
        assert!(reports[0].error.as_deref().unwrap_or("").contains("invalid credentials"));
        assert_eq!(portal.total_fetch_calls(), 0);
    }

    #[test]
    fn test_scenario_c_one_file_keeps_failing() {
        let fixture = Fixture::new();
        let portal = Arc::new(
            two_course_portal()
                .fail_fetch("lecture2.pdf", DownloadError::NetworkFailure { message: "reset".into() }),
        );
        let engine = fixture.engine(&portal);

        let report = engine.start_sync().expect("task failures do not fail the sync");

        assert_eq!(report.status, SyncStatus::Partial);
        assert_complete(&report, 3);
        assert_eq!(report.summary.downloaded, 2);
        assert_eq!(report.files.failed.len(), 1);
        let failed = &report.files.failed[0];
        assert_eq!(failed.name, "lecture2.pdf");
        assert_eq!(failed.error_type, Some(ErrorType::NetworkFailure));
        assert_eq!(portal.fetch_calls_for("lecture2.pdf"), 3);
        assert_eq!(engine.phase(), SyncPhase::Idle);
    }

    #[test]
    fn test_scenario_d_session_expires_mid_enumeration() {
        let fixture = Fixture::new();
        let portal = Arc::new(two_course_portal().expire_list_files(1));
        let engine = fixture.engine(&portal);

        let report = engine.start_sync().expect("expiry is recovered transparently");

        assert_eq!(report.status, SyncStatus::Success);
        assert_complete(&report, 3);
        assert_eq!(report.summary.downloaded, 3);
        assert_eq!(portal.auth_calls(), 2);
        assert!(!fixture.sink.phases().contains(&SyncPhase::Failed));
    }

    #[test]
    fn test_second_expiry_in_same_step_is_fatal() {
        let fixture = Fixture::new();
        let portal = Arc::new(two_course_portal().expire_list_courses(2));
        let engine = fixture.engine(&portal);

        let err = engine.start_sync().unwrap_err();
        assert!(matches!(err, SyncError::Portal(PortalError::SessionExpired)));
        let reports = engine.get_sync_reports(10).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, SyncStatus::Failed);
    }

    #[test]
    fn test_idempotent_skip_and_stable_dedup() {
        let fixture = Fixture::new();
        let portal = Arc::new(two_course_portal());
        let engine = fixture.engine(&portal);

        let first = engine.start_sync().unwrap();
        assert_eq!(first.summary.downloaded, 3);
        let records_after_first = engine.dedup.len();

        for _ in 0..2 {
            let again = engine.start_sync().unwrap();
            assert_eq!(again.summary.downloaded, 0);
            assert_eq!(again.summary.skipped, 3);
            assert_complete(&again, 3);
            assert!(again
                .files
                .skipped
                .iter()
                .all(|f| f.reason.as_deref() == Some(REASON_ALREADY_EXISTS)));
        }
        assert_eq!(engine.dedup.len(), records_after_first);
        assert_eq!(portal.total_fetch_calls(), 3);
        // Still logged in: no second login
        assert_eq!(portal.auth_calls(), 1);
    }

    #[test]
    fn test_dedup_index_persists_across_engines() {
        let fixture = Fixture::new();
        let portal = Arc::new(two_course_portal());
        fixture.engine(&portal).start_sync().unwrap();

        let restarted = fixture.engine(&portal);
        let report = restarted.start_sync().unwrap();
        assert_eq!(report.summary.downloaded, 0);
        assert_eq!(report.summary.skipped, 3);
    }

    #[test]
    fn test_changed_remote_file_is_fetched_again() {
        let fixture = Fixture::new();
        let portal = Arc::new(two_course_portal());
        let engine = fixture.engine_with(
            SyncConfig {
                overwrite: OverwritePolicy::SmartUpdate,
                ..fixture.config()
            },
            &portal,
        );
        engine.start_sync().unwrap();

        portal.push_file("c1", "Files", "lecture1.pdf", b"first lecture, revised", Some(22));
        let report = engine.start_sync().unwrap();

        assert_eq!(report.summary.downloaded, 1);
        assert_eq!(report.files.downloaded[0].name, "lecture1.pdf");
        assert_eq!(
            fs::read(fixture.course_file("Physics", "Files", "lecture1.pdf")).unwrap(),
            b"first lecture, revised"
        );
    }

    #[test]
    fn test_revised_file_with_same_size_replaces_engine_copy() {
        let fixture = Fixture::new();
        let portal = Arc::new(two_course_portal());
        // Default overwrite policy
        let engine = fixture.engine(&portal);
        engine.start_sync().unwrap();
        let records_before = engine.dedup.len();
        let files_before = engine.get_local_stats().total_files;

        let modified = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        portal.revise_file("c1", "Files", "lecture1.pdf", b"first LECTURE", modified);
        let report = engine.start_sync().unwrap();

        assert_eq!(report.summary.downloaded, 1);
        assert_eq!(report.files.downloaded[0].name, "lecture1.pdf");
        let local = fixture.course_file("Physics", "Files", "lecture1.pdf");
        assert_eq!(fs::read(&local).unwrap(), b"first LECTURE");
        assert_eq!(portal.fetch_calls_for("lecture1.pdf"), 2);

        // One record per local path: the old version's record is retired
        assert_eq!(engine.dedup.len(), records_before);
        assert_eq!(engine.get_local_stats().total_files, files_before);
        let revised = portal
            .files_of("c1", "Files")
            .into_iter()
            .find(|f| f.name == "lecture1.pdf")
            .unwrap();
        assert_eq!(engine.dedup.find_by_path("c1", &local), Some(revised.fingerprint));

        // And the revised version is now known
        let again = engine.start_sync().unwrap();
        assert_eq!(again.summary.downloaded, 0);
    }

    #[test]
    fn test_multibyte_file_name_is_downloaded() {
        let fixture = Fixture::new();
        let name = format!("{}.pdf", "\u{8bfe}".repeat(75));
        let portal = Arc::new(
            ScriptedPortal::new()
                .course("c1", "Physics", &["Files"])
                .file("c1", "Files", &name, b"slides"),
        );
        let engine = fixture.engine(&portal);

        let report = engine.start_sync().unwrap();
        assert_eq!(report.summary.downloaded, 1, "failed: {:?}", report.files.failed);
        let local = report.files.downloaded[0].local_path.clone().expect("local path recorded");
        let file_name = local.file_name().unwrap().to_string_lossy().into_owned();
        assert!(file_name.len() <= 200);
        assert!(file_name.ends_with(".pdf"));
        assert_eq!(fs::read(&local).unwrap(), b"slides");
    }

    #[test]
    fn test_overwrite_never_adopts_local_files() {
        let fixture = Fixture::new();
        let portal = Arc::new(two_course_portal());
        let engine = fixture.engine_with(
            SyncConfig {
                overwrite: OverwritePolicy::Skip,
                ..fixture.config()
            },
            &portal,
        );

        let local = fixture.course_file("Physics", "Files", "lecture1.pdf");
        fs::create_dir_all(local.parent().unwrap()).unwrap();
        fs::write(&local, b"my annotated copy").unwrap();

        let report = engine.start_sync().unwrap();
        assert_eq!(report.summary.downloaded, 2);
        let adopted = report
            .files
            .skipped
            .iter()
            .find(|f| f.name == "lecture1.pdf")
            .expect("local file should be adopted");
        assert_eq!(adopted.reason.as_deref(), Some(REASON_EXISTS_LOCALLY));
        assert_eq!(fs::read(&local).unwrap(), b"my annotated copy");

        let fingerprint = &portal.files_of("c1", "Files")[0].fingerprint;
        let record = engine.dedup.get("c1", fingerprint).expect("adopted file is indexed");
        assert!(record.checksum.is_some());
    }

    #[test]
    fn test_overwrite_size_policy() {
        let fixture = Fixture::new();
        let portal = Arc::new(
            ScriptedPortal::new()
                .course("c1", "Physics", &["Files"])
                .file("c1", "Files", "same.txt", b"BBB")
                .file("c1", "Files", "changed.txt", b"new!"),
        );
        let engine = fixture.engine_with(
            SyncConfig {
                overwrite: OverwritePolicy::SmartUpdate,
                ..fixture.config()
            },
            &portal,
        );
        let dir = fixture.course_file("Physics", "Files", "");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("same.txt"), b"bbb").unwrap();
        fs::write(dir.join("changed.txt"), b"old").unwrap();

        let report = engine.start_sync().unwrap();

        assert_eq!(report.summary.downloaded, 1);
        assert_eq!(report.files.downloaded[0].name, "changed.txt");
        assert_eq!(report.files.skipped[0].reason.as_deref(), Some(REASON_SAME_SIZE));
        assert_eq!(fs::read(dir.join("changed.txt")).unwrap(), b"new!");
        assert_eq!(fs::read(dir.join("same.txt")).unwrap(), b"bbb");
    }

    #[test]
    fn test_overwrite_always_replaces() {
        let fixture = Fixture::new();
        let portal = Arc::new(two_course_portal());
        let engine = fixture.engine_with(
            SyncConfig {
                overwrite: OverwritePolicy::Overwrite,
                ..fixture.config()
            },
            &portal,
        );
        let local = fixture.course_file("Physics", "Files", "lecture1.pdf");
        fs::create_dir_all(local.parent().unwrap()).unwrap();
        fs::write(&local, b"stale").unwrap();

        let report = engine.start_sync().unwrap();
        assert_eq!(report.summary.downloaded, 3);
        assert_eq!(fs::read(&local).unwrap(), b"first lecture");
    }

    #[test]
    fn test_duplicate_listing_is_fetched_once() {
        let fixture = Fixture::new();
        let portal = Arc::new(two_course_portal().duplicate_listing("c1", "Files", "lecture1.pdf"));
        let engine = fixture.engine(&portal);

        let report = engine.start_sync().unwrap();
        assert_complete(&report, 4);
        assert_eq!(report.summary.downloaded, 3);
        assert_eq!(report.files.skipped[0].reason.as_deref(), Some(REASON_DUPLICATE));
        assert_eq!(portal.fetch_calls_for("lecture1.pdf"), 1);
    }

    #[test]
    fn test_unknown_size_files_sync_once() {
        let fixture = Fixture::new();
        let portal = Arc::new(
            ScriptedPortal::new()
                .course("c1", "Physics", &["Files"])
                .file_without_size("c1", "Files", "notes.txt", b"notes"),
        );
        let engine = fixture.engine(&portal);

        assert_eq!(engine.start_sync().unwrap().summary.downloaded, 1);
        assert_eq!(engine.start_sync().unwrap().summary.skipped, 1);
    }

    #[test]
    fn test_disabled_courses_and_tab_selection() {
        let fixture = Fixture::new();
        let portal = Arc::new(
            two_course_portal()
                .course("c3", "Biology", &["Files", "Extra"])
                .file("c3", "Files", "cell.pdf", b"cell")
                .file("c3", "Extra", "bonus.pdf", b"bonus"),
        );
        let engine = fixture.engine(&portal);
        engine.refresh_courses().unwrap();

        engine
            .update_course_config("c2", CourseUpdate { enabled: Some(false), ..CourseUpdate::default() })
            .unwrap();
        engine
            .update_course_config(
                "c3",
                CourseUpdate {
                    selected_tabs: Some(["Extra".to_string()].into_iter().collect()),
                    ..CourseUpdate::default()
                },
            )
            .unwrap();

        let report = engine.start_sync().unwrap();
        let mut names: Vec<_> = report.files.downloaded.iter().map(|f| f.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["bonus.pdf", "lecture1.pdf", "lecture2.pdf"]);
        assert_complete(&report, 3);
    }

    #[test]
    fn test_refresh_applies_default_tabs() {
        let fixture = Fixture::new();
        let portal = Arc::new(
            ScriptedPortal::new()
                .course("c1", "Physics", &["Course Content", "Announcements"])
                .file("c1", "Announcements", "news.txt", b"news")
                .file("c1", "Course Content", "slides.pdf", b"slides"),
        );
        let engine = fixture.engine_with(
            SyncConfig {
                download_all_tabs: false,
                default_tabs: vec!["Course Content".to_string()],
                ..fixture.config()
            },
            &portal,
        );

        let courses = engine.refresh_courses().unwrap();
        assert_eq!(courses.len(), 1);
        assert!(courses[0].selected_tabs.contains("Course Content"));
        assert!(!courses[0].selected_tabs.contains("Announcements"));
        assert_eq!(portal.list_files_calls(), 0);

        let report = engine.start_sync().unwrap();
        assert_eq!(report.summary.downloaded, 1);
        assert_eq!(report.files.downloaded[0].name, "slides.pdf");
    }

    #[test]
    fn test_alias_change_moves_folder() {
        let fixture = Fixture::new();
        let portal = Arc::new(two_course_portal());
        let engine = fixture.engine(&portal);
        engine.start_sync().unwrap();

        let updated = engine
            .update_course_config(
                "c1",
                CourseUpdate {
                    alias: Some(Some("Phys".to_string())),
                    ..CourseUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(updated.display_name(), "Phys");
        assert!(fixture.course_file("Phys", "Files", "lecture1.pdf").is_file());
        assert!(!fixture.temp_dir.path().join("Courses").join("Physics").exists());

        let report = engine.start_sync().unwrap();
        assert_eq!(report.summary.downloaded, 0);
        let moved = report
            .files
            .skipped
            .iter()
            .find(|f| f.name == "lecture1.pdf")
            .unwrap();
        assert_eq!(moved.course, "Phys");
        assert_eq!(
            moved.local_path.as_deref(),
            Some(fixture.course_file("Phys", "Files", "lecture1.pdf").as_path())
        );

        let stats = engine.get_local_stats();
        assert_eq!(stats.total_files, 3);
        assert_eq!(stats.courses.get("Phys"), Some(&2));
        assert_eq!(stats.courses.get("Chemistry"), Some(&1));
    }

    #[test]
    fn test_update_unknown_course() {
        let fixture = Fixture::new();
        let portal = Arc::new(two_course_portal());
        let engine = fixture.engine(&portal);
        assert!(matches!(
            engine.update_course_config("nope", CourseUpdate::default()),
            Err(SyncError::UnknownCourse { .. })
        ));
    }

    #[test]
    fn test_transient_enumeration_and_login_failures_are_retried() {
        let fixture = Fixture::new();
        let portal = Arc::new(
            two_course_portal()
                .auth_network_failures(1)
                .list_files_network_failures(1),
        );
        let engine = fixture.engine(&portal);

        let report = engine.start_sync().unwrap();
        assert_eq!(report.status, SyncStatus::Success);
        assert_eq!(portal.auth_calls(), 2);
    }

    #[test]
    fn test_enumeration_failure_keeps_partial_progress() {
        let fixture = Fixture::new();
        let portal = Arc::new(
            two_course_portal()
                .fail_list_files("c2", PortalError::MalformedResponse { message: "bad page".into() }),
        );
        let engine = fixture.engine(&portal);

        let err = engine.start_sync().unwrap_err();
        assert!(matches!(err, SyncError::Portal(PortalError::MalformedResponse { .. })));
        assert_eq!(engine.phase(), SyncPhase::Failed);

        let summary = &engine.get_sync_reports(1).unwrap()[0];
        let report = engine.get_sync_report(&summary.sync_id).unwrap().unwrap();
        assert_eq!(report.status, SyncStatus::Failed);
        // c1 was enumerated before the failure; its files are accounted for
        assert_complete(&report, 2);
    }

    #[test]
    fn test_missing_credential_and_logout() {
        let fixture = Fixture::new();
        let portal = Arc::new(two_course_portal());
        let engine = fixture.engine_with(
            SyncConfig {
                username: None,
                password: None,
                ..fixture.config()
            },
            &portal,
        );
        assert!(matches!(engine.start_sync(), Err(SyncError::MissingCredential)));

        let engine = engine.with_credential(Credential::new("student", "pw"));
        engine.start_sync().unwrap();

        engine.logout();
        assert_eq!(portal.session().state, SessionState::LoggedOut);
        assert!(matches!(engine.start_sync(), Err(SyncError::MissingCredential)));
    }

    #[test]
    fn test_cancel_stops_dispatching() {
        let fixture = Fixture::new();
        let mut portal = ScriptedPortal::new()
            .course("c1", "Physics", &["Files"])
            .fetch_delay(Duration::from_millis(100));
        for i in 0..6 {
            portal = portal.file("c1", "Files", &format!("f{}.bin", i), b"data");
        }
        let portal = Arc::new(portal);
        let engine = Arc::new(fixture.engine_with(
            SyncConfig {
                concurrent_downloads: 1,
                ..fixture.config()
            },
            &portal,
        ));

        let runner = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || engine.start_sync())
        };
        thread::sleep(Duration::from_millis(50));
        engine.cancel_sync();
        let report = runner.join().unwrap().expect("a cancelled sync still reports");

        assert_eq!(report.status, SyncStatus::Partial);
        assert!(report.summary.downloaded < 6);
        assert!(report
            .files
            .skipped
            .iter()
            .all(|f| f.reason.as_deref() == Some(REASON_CANCELLED)));
        // Nothing half-written under a final name
        for record in &report.files.skipped {
            if let Some(path) = &record.local_path {
                assert!(!path.exists());
            }
        }
    }

    #[test]
    fn test_progress_and_sync_state() {
        let fixture = Fixture::new();
        let portal = Arc::new(two_course_portal());
        let engine = fixture.engine(&portal);

        let report = engine.start_sync().unwrap();

        let events = fixture.sink.events();
        assert_eq!(events.first().map(|e| e.phase), Some(SyncPhase::Authenticating));
        let last = events.last().unwrap();
        assert_eq!(last.phase, SyncPhase::Complete);
        assert_eq!(last.stats, report.summary);
        assert!(events.iter().any(|e| e.total_courses == 2));
        assert_eq!(fixture.sink.reports(), vec![report.clone()]);

        let state = engine.sync_state().unwrap();
        assert_eq!(state.last_sync_id.as_deref(), Some(report.sync_id.as_str()));
        assert_eq!(state.last_status, Some(SyncStatus::Success));
        assert_eq!(state.last_added, 3);
    }

    #[test]
    fn test_reports_are_listed_newest_first() {
        let fixture = Fixture::new();
        let portal = Arc::new(two_course_portal());
        let engine = fixture.engine(&portal);

        let first = engine.start_sync().unwrap();
        let second = engine.start_sync().unwrap();

        let listed = engine.get_sync_reports(5).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].sync_id, second.sync_id);
        assert_eq!(listed[1].sync_id, first.sync_id);
        let stored = engine.get_sync_report(&first.sync_id).unwrap().unwrap();
        assert_eq!(stored.sync_id, first.sync_id);
        assert_eq!(stored.summary, first.summary);
        assert_eq!(stored.files, first.files);
        assert!(engine.get_sync_report("2000-01-01_000000_000").unwrap().is_none());
    }

    #[test]
    fn test_only_one_run_at_a_time() {
        let running = AtomicBool::new(false);
        let guard = RunGuard::acquire(&running).unwrap();
        assert!(matches!(RunGuard::acquire(&running), Err(SyncError::AlreadyRunning)));
        drop(guard);
        assert!(RunGuard::acquire(&running).is_ok());
    }
}
