//! A portal backed by a directory tree.
//!
//! Layout: `<root>/<course_id>/<tab>/<files...>`. A course folder may carry
//! a `course.toml` with `name = "..."`; otherwise the folder name is used.
//! An optional `<root>/portal.toml` sets the accepted credential and a
//! session lifetime:
//!
//! ```toml
//! username = "student"
//! password = "secret"
//! session_ttl_secs = 3600
//! ```
//!
//! Useful for syncing from a mounted share, and as a real adapter in tests.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{AuthError, ConfigError, DownloadError, PortalError};
use crate::model::{CourseRef, Credential, RemoteFile, RemoteRef, Session, SessionState};
use crate::portal::{PortalSession, RemoteStream};

const PORTAL_FILE: &str = "portal.toml";
const COURSE_FILE: &str = "course.toml";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PortalSettings {
    username: Option<String>,
    password: Option<String>,
    session_ttl_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CourseManifest {
    name: Option<String>,
}

#[derive(Debug)]
pub struct FsPortal {
    root: PathBuf,
    accepted: Option<Credential>,
    session_ttl: Option<Duration>,
    session: Mutex<Session>,
}

impl FsPortal {
    /// A portal that accepts any credential and never expires sessions.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsPortal {
            root: root.into(),
            accepted: None,
            session_ttl: None,
            session: Mutex::new(Session::logged_out()),
        }
    }

    /// Open a portal, applying `<root>/portal.toml` if present.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let mut portal = Self::new(root);
        let settings_path = portal.root.join(PORTAL_FILE);
        if settings_path.is_file() {
            let text = fs::read_to_string(&settings_path).map_err(|source| ConfigError::Read {
                path: settings_path.clone(),
                source,
            })?;
            let settings: PortalSettings =
                toml::from_str(&text).map_err(|source| ConfigError::Parse {
                    path: settings_path.clone(),
                    source,
                })?;
            if let Some(username) = settings.username {
                portal.accepted = Some(Credential::new(username, settings.password.unwrap_or_default()));
            }
            portal.session_ttl = settings.session_ttl_secs.map(Duration::from_secs);
        }
        Ok(portal)
    }

    pub fn with_credentials(mut self, credential: Credential) -> Self {
        self.accepted = Some(credential);
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = Some(ttl);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Marks the session expired once its lifetime has passed.
    fn check_session(&self) -> Result<(), PortalError> {
        let mut session = self.lock_session();
        if session.state != SessionState::Authenticated {
            return Err(PortalError::SessionExpired);
        }
        if let (Some(ttl), Some(established)) = (self.session_ttl, session.established_at) {
            let age = (Utc::now() - established).to_std().unwrap_or_default();
            if age >= ttl {
                debug!("file portal session expired");
                session.state = SessionState::Expired;
                return Err(PortalError::SessionExpired);
            }
        }
        Ok(())
    }

    fn course_name(&self, course_dir: &Path, id: &str) -> Result<String, PortalError> {
        let manifest_path = course_dir.join(COURSE_FILE);
        if !manifest_path.is_file() {
            return Ok(id.to_string());
        }
        let text = fs::read_to_string(&manifest_path).map_err(|e| PortalError::NetworkFailure {
            message: format!("{}: {}", manifest_path.display(), e),
        })?;
        let manifest: CourseManifest =
            toml::from_str(&text).map_err(|e| PortalError::MalformedResponse {
                message: format!("{}: {}", manifest_path.display(), e),
            })?;
        Ok(manifest
            .name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| id.to_string()))
    }
}

impl PortalSession for FsPortal {
    fn authenticate(&self, credential: &Credential) -> Result<SessionState, AuthError> {
        if self.check_session().is_ok() {
            return Ok(SessionState::Authenticated);
        }

        self.lock_session().state = SessionState::Authenticating;
        if !self.root.is_dir() {
            *self.lock_session() = Session::logged_out();
            return Err(AuthError::NetworkFailure {
                message: format!("portal root {} is not reachable", self.root.display()),
            });
        }
        if let Some(accepted) = &self.accepted {
            if accepted != credential {
                *self.lock_session() = Session::logged_out();
                return Err(AuthError::InvalidCredentials);
            }
        }

        *self.lock_session() = Session::authenticated(Utc::now());
        debug!(user = credential.username(), "file portal login");
        Ok(SessionState::Authenticated)
    }

    fn session(&self) -> Session {
        // Surface expiry to observers too
        let _ = self.check_session();
        self.lock_session().clone()
    }

    fn list_courses(&self) -> Result<Vec<CourseRef>, PortalError> {
        self.check_session()?;

        let mut courses = Vec::new();
        for (id, course_dir) in child_dirs(&self.root)? {
            let name = self.course_name(&course_dir, &id)?;
            let tabs: Vec<String> = child_dirs(&course_dir)?.into_iter().map(|(tab, _)| tab).collect();
            courses.push(CourseRef::new(id, name).with_tabs(tabs));
        }
        courses.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(courses)
    }

    fn list_files(&self, course_id: &str, tab: &str) -> Result<Vec<RemoteFile>, PortalError> {
        self.check_session()?;
        if !is_plain_segment(course_id) || !is_plain_segment(tab) {
            return Err(PortalError::MalformedResponse {
                message: format!("invalid course or tab name: {}/{}", course_id, tab),
            });
        }

        let tab_dir = self.root.join(course_id).join(tab);
        if !tab_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        collect_files(&tab_dir, "", &mut |relative, metadata| {
            let last_modified = metadata.modified().ok().map(DateTime::<Utc>::from);
            files.push(RemoteFile::new(
                course_id,
                tab,
                relative,
                RemoteRef(format!("{}/{}/{}", course_id, tab, relative)),
                Some(metadata.len()),
                last_modified,
            ));
        })?;
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    fn fetch(&self, remote_ref: &RemoteRef) -> Result<RemoteStream, DownloadError> {
        let segments: Vec<&str> = remote_ref.as_str().split('/').collect();
        if segments.len() < 3 || !segments.iter().all(|s| is_plain_segment(s)) {
            return Err(DownloadError::RemoteRefInvalid {
                message: format!("not a file reference: {}", remote_ref),
            });
        }

        let path = segments.iter().fold(self.root.clone(), |path, s| path.join(s));
        let file = fs::File::open(&path).map_err(|e| DownloadError::from_io(&e))?;
        let metadata = file.metadata().map_err(|e| DownloadError::from_io(&e))?;
        if !metadata.is_file() {
            return Err(DownloadError::RemoteRefInvalid {
                message: format!("not a file: {}", remote_ref),
            });
        }
        Ok(RemoteStream::new(Box::new(file), Some(metadata.len())))
    }

    fn logout(&self) {
        *self.lock_session() = Session::logged_out();
    }
}

fn is_plain_segment(segment: &str) -> bool {
    let mut components = Path::new(segment).components();
    matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none()
        && !segment.contains(|c: char| c == '/' || c == '\\')
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// Visible sub-directories of `dir` as (name, path), in name order.
fn child_dirs(dir: &Path) -> Result<Vec<(String, PathBuf)>, PortalError> {
    let entries = fs::read_dir(dir).map_err(|e| PortalError::NetworkFailure {
        message: format!("{}: {}", dir.display(), e),
    })?;

    let mut dirs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) if !is_hidden(&name) => dirs.push((name, path)),
            Ok(_) => {}
            Err(raw) => warn!(name = ?raw, "skipping folder with a non-UTF-8 name"),
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn collect_files(
    dir: &Path,
    prefix: &str,
    visit: &mut dyn FnMut(&str, &fs::Metadata),
) -> Result<(), PortalError> {
    let entries = fs::read_dir(dir).map_err(|e| PortalError::NetworkFailure {
        message: format!("{}: {}", dir.display(), e),
    })?;

    for entry in entries.flatten() {
        let name = match entry.file_name().into_string() {
            Ok(name) if !is_hidden(&name) => name,
            Ok(_) => continue,
            Err(raw) => {
                warn!(name = ?raw, "skipping file with a non-UTF-8 name");
                continue;
            }
        };
        let relative = if prefix.is_empty() {
            name
        } else {
            format!("{}/{}", prefix, name)
        };
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if metadata.is_dir() {
            collect_files(&entry.path(), &relative, visit)?;
        } else if metadata.is_file() {
            visit(&relative, &metadata);
        }
    }
    Ok(())
}
