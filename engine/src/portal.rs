//! The portal contract.
//!
//! A [`PortalSession`] owns the authenticated connection to the remote
//! site and exposes enumeration as typed records. How the records are
//! obtained (HTTP API, scraping, a mounted share) is the adapter's business.
//! Adapters validate what they receive before handing it to the engine.
//!
//! Every call may block on I/O and carries the adapter's own timeout;
//! exceeding it surfaces as a `NetworkFailure` (or `Timeout` for fetches).

use std::fmt;
use std::io::{self, Read};

use crate::error::{AuthError, DownloadError, PortalError};
use crate::model::{CourseRef, Credential, RemoteFile, RemoteRef, Session, SessionState};

pub trait PortalSession: Send + Sync {
    /// Log in. Calling while already authenticated is a no-op that returns
    /// the current state.
    fn authenticate(&self, credential: &Credential) -> Result<SessionState, AuthError>;

    /// Current session as seen by the adapter.
    fn session(&self) -> Session;

    /// Courses visible to the logged-in user, with their available tabs.
    /// User overrides on the returned records are ignored by the engine.
    fn list_courses(&self) -> Result<Vec<CourseRef>, PortalError>;

    /// Files under one tab of one course. An empty tab is not an error.
    fn list_files(&self, course_id: &str, tab: &str) -> Result<Vec<RemoteFile>, PortalError>;

    /// Open a finite byte stream for a remote file. The stream is consumed
    /// once; a retry calls `fetch` again.
    fn fetch(&self, remote_ref: &RemoteRef) -> Result<RemoteStream, DownloadError>;

    /// Drop the session. Safe to call when not logged in.
    fn logout(&self);
}

/// A lazily read remote file.
pub struct RemoteStream {
    /// Size announced by the remote side, if any
    pub content_length: Option<u64>,
    reader: Box<dyn Read + Send>,
}

impl RemoteStream {
    pub fn new(reader: Box<dyn Read + Send>, content_length: Option<u64>) -> Self {
        RemoteStream {
            content_length,
            reader,
        }
    }
}

impl Read for RemoteStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStream")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}
