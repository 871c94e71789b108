//! Engine configuration.
//!
//! Loaded from a TOML file. Every key is optional and unknown keys are
//! ignored, so older and newer config files keep loading.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::checksums::ChecksumAlgorithm;
use crate::error::ConfigError;
use crate::model::{Credential, OverwritePolicy};

/// Directory name for engine state under the download directory.
pub const STATE_DIR_NAME: &str = ".coursesync";

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Root folder; each course gets a sub-folder
    pub download_dir: PathBuf,

    /// Dedup index, course overrides, sync state, and reports.
    /// Defaults to `<download_dir>/.coursesync`.
    pub state_dir: Option<PathBuf>,

    /// Worker pool size
    pub concurrent_downloads: usize,

    /// Total attempts per download task
    pub max_attempts: u32,

    /// Linear backoff base between download retries
    pub retry_backoff_ms: u64,

    /// Retries for network failures during login and enumeration
    pub enumeration_retries: u32,

    pub overwrite: OverwritePolicy,

    /// Tabs selected by default for newly discovered courses
    pub default_tabs: Vec<String>,

    /// Select every tab of newly discovered courses
    pub download_all_tabs: bool,

    /// Put files directly in the course folder instead of one folder per tab
    pub flatten_tabs: bool,

    #[serde(deserialize_with = "deserialize_checksum")]
    pub checksum: Option<ChecksumAlgorithm>,

    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            download_dir: default_download_dir(),
            state_dir: None,
            concurrent_downloads: 3,
            max_attempts: 3,
            retry_backoff_ms: 1000,
            enumeration_retries: 1,
            overwrite: OverwritePolicy::default(),
            default_tabs: Vec::new(),
            download_all_tabs: false,
            flatten_tabs: false,
            checksum: Some(ChecksumAlgorithm::Sha256),
            username: None,
            password: None,
        }
    }
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("download_dir", &self.download_dir)
            .field("state_dir", &self.state_dir)
            .field("concurrent_downloads", &self.concurrent_downloads)
            .field("max_attempts", &self.max_attempts)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("enumeration_retries", &self.enumeration_retries)
            .field("overwrite", &self.overwrite)
            .field("default_tabs", &self.default_tabs)
            .field("download_all_tabs", &self.download_all_tabs)
            .field("flatten_tabs", &self.flatten_tabs)
            .field("checksum", &self.checksum)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn default_download_dir() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(|home| PathBuf::from(home).join("Downloads").join("Courses"))
        .unwrap_or_else(|| PathBuf::from("courses"))
}

fn deserialize_checksum<'de, D>(deserializer: D) -> Result<Option<ChecksumAlgorithm>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    match raw.trim().to_lowercase().as_str() {
        "" | "none" | "off" => Ok(None),
        other => other
            .parse::<ChecksumAlgorithm>()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

impl SyncConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: SyncConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) if path.exists() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrent_downloads == 0 {
            return Err(ConfigError::Invalid {
                field: "concurrent_downloads",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.download_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                field: "download_dir",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| self.download_dir.join(STATE_DIR_NAME))
    }

    /// Delay before retry number `retry` (1-based): base, 3×base, 5×base...
    pub fn retry_delay(&self, retry: u32) -> Duration {
        let factor = u64::from(retry.max(1)) * 2 - 1;
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }

    /// Credential from the config file, if a username is set.
    pub fn credential(&self) -> Option<Credential> {
        self.username
            .as_ref()
            .filter(|name| !name.trim().is_empty())
            .map(|name| Credential::new(name.trim(), self.password.clone().unwrap_or_default()))
    }
}
