//! # Core Configuration Module
//!
//! Configuration for the library sync engine.
//!
//! ## Overview
//!
//! A builder constructs a [`CoreConfig`] holding the host bridges and the
//! [`SyncSettings`] that tune the scheduler, controller and batch processor.
//! `build()` fails fast when a required bridge is missing or a setting is out
//! of range, so a misconfigured host never starts a sync pass.
//!
//! ## Required Dependencies
//!
//! - `FileSystemAccess` - staging cache I/O (desktop default: tokio fs, behind
//!   the `desktop-shims` feature)
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::{CoreConfig, SyncSettings};
//! use std::time::Duration;
//!
//! let config = CoreConfig::builder()
//!     .cache_dir("/tmp/refsync")
//!     .sync_settings(SyncSettings::default().with_debounce(Duration::from_secs(1)))
//!     .build()?;
//! ```

use crate::error::{Error, Result};
use crate::events::DEFAULT_EVENT_BUFFER_SIZE;
use bridge_traits::storage::FileSystemAccess;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Largest number of object keys the remote API accepts in one request.
pub const MAX_KEYS_PER_BATCH: usize = 50;

/// Tuning knobs for one sync engine instance.
///
/// Defaults match the behaviour users expect from the desktop and mobile
/// clients: a 3 second debounce for local edits, one full sync per hour at
/// most, and a 15 second backoff before retrying a failed pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Delay used to coalesce library-scoped requests.
    pub debounce: Duration,
    /// Minimum time between two full syncs.
    pub full_sync_cooldown: Duration,
    /// Delay before a resync is requested after a pass.
    pub resync_delay: Duration,
    /// Maximum number of object fetches in flight.
    pub max_concurrent_fetches: usize,
    /// Keys per `syncObject` action.
    pub batch_size: usize,
    /// Keys per remote request inside one `syncObject` action.
    pub keys_per_request: usize,
    /// How long a conflict prompt may stay unanswered. `None` waits forever.
    pub conflict_timeout: Option<Duration>,
    /// Ask the permission receiver before every write batch.
    pub confirm_writes: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(3),
            full_sync_cooldown: Duration::from_secs(60 * 60),
            resync_delay: Duration::from_secs(15),
            max_concurrent_fetches: 4,
            batch_size: MAX_KEYS_PER_BATCH,
            keys_per_request: MAX_KEYS_PER_BATCH,
            conflict_timeout: None,
            confirm_writes: false,
        }
    }
}

impl SyncSettings {
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_full_sync_cooldown(mut self, cooldown: Duration) -> Self {
        self.full_sync_cooldown = cooldown;
        self
    }

    pub fn with_resync_delay(mut self, delay: Duration) -> Self {
        self.resync_delay = delay;
        self
    }

    pub fn with_max_concurrent_fetches(mut self, max: usize) -> Self {
        self.max_concurrent_fetches = max;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_keys_per_request(mut self, keys: usize) -> Self {
        self.keys_per_request = keys;
        self
    }

    pub fn with_conflict_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.conflict_timeout = timeout;
        self
    }

    pub fn with_write_confirmation(mut self, confirm: bool) -> Self {
        self.confirm_writes = confirm;
        self
    }

    /// Validates the settings and returns an error describing the first problem.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_fetches == 0 {
            return Err(Error::Config(
                "max_concurrent_fetches must be at least 1".to_string(),
            ));
        }

        if self.batch_size == 0 || self.batch_size > MAX_KEYS_PER_BATCH {
            return Err(Error::Config(format!(
                "batch_size must be between 1 and {}, got {}",
                MAX_KEYS_PER_BATCH, self.batch_size
            )));
        }

        if self.keys_per_request == 0 || self.keys_per_request > self.batch_size {
            return Err(Error::Config(format!(
                "keys_per_request must be between 1 and batch_size ({}), got {}",
                self.batch_size, self.keys_per_request
            )));
        }

        if self.resync_delay.is_zero() {
            return Err(Error::Config(
                "resync_delay must be greater than zero to avoid retry loops".to_string(),
            ));
        }

        if matches!(self.conflict_timeout, Some(timeout) if timeout.is_zero()) {
            return Err(Error::Config(
                "conflict_timeout must be greater than zero; use None to wait indefinitely"
                    .to_string(),
            ));
        }

        Ok(())
    }
}

/// Core configuration for the sync engine.
///
/// Use [`CoreConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct CoreConfig {
    /// Root directory for staged object payloads
    pub cache_dir: PathBuf,

    /// File system access used by the staging cache
    pub file_system: Arc<dyn FileSystemAccess>,

    /// Events buffered per subscriber before it lags
    pub event_buffer_size: usize,

    pub sync: SyncSettings,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("cache_dir", &self.cache_dir)
            .field("file_system", &"FileSystemAccess { ... }")
            .field("event_buffer_size", &self.event_buffer_size)
            .field("sync", &self.sync)
            .finish()
    }
}

impl CoreConfig {
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.cache_dir.as_os_str().is_empty() {
            return Err(Error::Config("Cache directory cannot be empty".to_string()));
        }

        if self.event_buffer_size == 0 {
            return Err(Error::Config(
                "Event buffer size must be greater than 0".to_string(),
            ));
        }

        self.sync.validate()
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_file_system(cache_dir: &std::path::Path) -> Result<Arc<dyn FileSystemAccess>> {
    use bridge_desktop::TokioFileSystem;

    let fs: Arc<dyn FileSystemAccess> = Arc::new(TokioFileSystem::with_cache_directory(cache_dir));
    Ok(fs)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_file_system(_cache_dir: &std::path::Path) -> Result<Arc<dyn FileSystemAccess>> {
    Err(Error::CapabilityMissing {
        capability: "FileSystemAccess".to_string(),
        message: "FileSystemAccess implementation is required for the staging cache. \
                 Desktop: enable the 'desktop-shims' feature to use TokioFileSystem. \
                 Mobile: inject an adapter rooted in the app's cache container."
            .to_string(),
    })
}

/// Builder for [`CoreConfig`].
#[derive(Default)]
pub struct CoreConfigBuilder {
    cache_dir: Option<PathBuf>,
    file_system: Option<Arc<dyn FileSystemAccess>>,
    event_buffer_size: Option<usize>,
    sync: Option<SyncSettings>,
}

impl CoreConfigBuilder {
    /// Sets the staging cache directory (required).
    pub fn cache_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.cache_dir = Some(path.into());
        self
    }

    /// Injects a file system bridge. Desktop builds fall back to `TokioFileSystem`.
    pub fn file_system(mut self, fs: Arc<dyn FileSystemAccess>) -> Self {
        self.file_system = Some(fs);
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    pub fn sync_settings(mut self, settings: SyncSettings) -> Self {
        self.sync = Some(settings);
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> Result<CoreConfig> {
        let cache_dir = self.cache_dir.ok_or_else(|| {
            Error::Config("Cache directory is required. Use .cache_dir() to set it.".to_string())
        })?;

        let file_system = match self.file_system {
            Some(fs) => fs,
            None => provide_default_file_system(&cache_dir)?,
        };

        let config = CoreConfig {
            cache_dir,
            file_system,
            event_buffer_size: self.event_buffer_size.unwrap_or(DEFAULT_EVENT_BUFFER_SIZE),
            sync: self.sync.unwrap_or_default(),
        };

        config.validate()?;

        Ok(config)
    }
}
