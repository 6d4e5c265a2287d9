//! # Sync Engine
//!
//! Builds a running [`SyncScheduler`] from a [`CoreConfig`] and the host's
//! collaborators. The staging cache is rooted at `config.cache_dir` on
//! `config.file_system`, the event bus buffers `config.event_buffer_size`
//! events per subscriber, and every component is tuned from `config.sync`.
//!
//! ```rust,ignore
//! let config = CoreConfig::builder().cache_dir(cache_dir).build()?;
//! let (conflicts, prompts) = ChannelConflictReceiver::new(1);
//! let engine = SyncEngine::new(&config, SyncDependencies::new(remote, store, Arc::new(conflicts)))?;
//! engine.scheduler().request(SyncType::Normal, LibraryScope::All).await;
//! ```

use crate::backend::{LocalStore, RemoteApi};
use crate::conflict_resolver::{
    AllowAllPermissions, ConflictReceiver, ConflictResolver, PermissionReceiver,
};
use crate::controller::{ControllerConfig, SyncController};
use crate::error::Result;
use crate::library_handler::LibraryActionHandler;
use crate::progress::ProgressReporter;
use crate::scheduler::{SchedulerConfig, SyncScheduler};
use crate::staging::StagingCache;
use core_runtime::config::CoreConfig;
use core_runtime::events::{CoreEvent, EventBus};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// Host-provided collaborators of one engine.
pub struct SyncDependencies {
    pub remote: Arc<dyn RemoteApi>,
    pub store: Arc<dyn LocalStore>,
    pub conflicts: Arc<dyn ConflictReceiver>,
    pub permissions: Arc<dyn PermissionReceiver>,
}

impl SyncDependencies {
    /// Bundle with a permission receiver that allows every write.
    pub fn new(
        remote: Arc<dyn RemoteApi>,
        store: Arc<dyn LocalStore>,
        conflicts: Arc<dyn ConflictReceiver>,
    ) -> Self {
        Self {
            remote,
            store,
            conflicts,
            permissions: Arc::new(AllowAllPermissions),
        }
    }

    pub fn with_permissions(mut self, permissions: Arc<dyn PermissionReceiver>) -> Self {
        self.permissions = permissions;
        self
    }
}

/// A wired scheduler plus the observers hosts attach to. Cheap to clone.
#[derive(Clone)]
pub struct SyncEngine {
    scheduler: SyncScheduler,
    progress: ProgressReporter,
    event_bus: EventBus,
    staging: StagingCache,
}

impl SyncEngine {
    /// Validate `config` and wire every component.
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`](crate::SyncError::Config) if `config`
    /// fails validation.
    pub fn new(config: &CoreConfig, deps: SyncDependencies) -> Result<Self> {
        config.validate()?;

        let event_bus = EventBus::new(config.event_buffer_size);
        let staging = StagingCache::new(Arc::clone(&config.file_system), config.cache_dir.clone());
        let handler = Arc::new(LibraryActionHandler::new(
            deps.remote,
            deps.store,
            staging.clone(),
            &config.sync,
        ));
        let resolver = ConflictResolver::new(
            deps.conflicts,
            config.sync.conflict_timeout,
            event_bus.clone(),
        );
        let progress = ProgressReporter::new(event_bus.clone());

        let (controller, signals) = SyncController::new(
            handler,
            resolver,
            deps.permissions,
            progress.clone(),
            ControllerConfig::from(&config.sync),
        );
        let scheduler = SyncScheduler::new(controller, signals, SchedulerConfig::from(&config.sync));

        info!(cache_dir = %config.cache_dir.display(), "Sync engine ready");
        Ok(Self {
            scheduler,
            progress,
            event_bus,
            staging,
        })
    }

    pub fn scheduler(&self) -> &SyncScheduler {
        &self.scheduler
    }

    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }

    /// Sync and conflict events from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<CoreEvent> {
        self.event_bus.subscribe()
    }

    pub fn staging(&self) -> &StagingCache {
        &self.staging
    }
}
