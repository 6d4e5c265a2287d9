//! # Library Sync Engine
//!
//! Keeps a local replica of a reference library in step with a remote
//! versioned API.
//!
//! ## Components
//!
//! - **Scheduler** (`scheduler`): Debounces and merges sync requests, throttles full syncs
//! - **Controller** (`controller`): Drains the per-pass action queue and decides abort / skip / resync
//! - **Batch Processor** (`batch_processor`): Bounded-concurrency fetch, decode and staging of object batches
//! - **Conflict Resolver** (`conflict_resolver`): Suspends a pass until the user settles a group conflict
//! - **Progress Reporter** (`progress`): Publishes pass progress on the event bus and a watch channel
//! - **Action Handler** (`handler`, `library_handler`): The network and database surface the controller drives
//! - **Engine** (`engine`): Wires the components above from a `CoreConfig`
//!
//! ## Wiring
//!
//! [`SyncEngine`] builds the whole stack from a
//! [`CoreConfig`](core_runtime::config::CoreConfig):
//!
//! ```rust,ignore
//! let config = CoreConfig::builder().cache_dir(cache_dir).build()?;
//! let engine = SyncEngine::new(&config, SyncDependencies::new(remote, store, conflicts))?;
//! engine.scheduler().request(SyncType::Normal, LibraryScope::All).await;
//! ```

pub mod actions;
pub mod backend;
pub mod batch_processor;
pub mod conflict_resolver;
pub mod controller;
pub mod engine;
pub mod error;
pub mod handler;
pub mod library_handler;
pub mod progress;
pub mod scheduler;
pub mod staging;
pub mod types;

pub use actions::{DownloadBatch, QueueAction, WriteBatch};
pub use backend::{
    DirtyObject, LocalStore, ObjectsResponse, RemoteApi, RemoteDeletions, RemoteObject,
    RemoteVersions, WriteResult,
};
pub use batch_processor::{BatchProcessor, BatchProcessorConfig, BatchSummary, WriteConflict};
pub use conflict_resolver::{
    AllowAllPermissions, ChannelConflictReceiver, Conflict, ConflictPrompt, ConflictReceiver,
    ConflictResolution, ConflictResolver, PermissionReceiver, PermissionResponse,
};
pub use controller::{
    ControllerConfig, ControllerSignal, PassOutcome, PassReport, ResyncRequest, SyncController,
};
pub use engine::{SyncDependencies, SyncEngine};
pub use error::{ErrorClass, Result, SyncError};
pub use handler::{LibraryData, SyncActionHandler, VersionDiff};
pub use library_handler::LibraryActionHandler;
pub use progress::{ProgressReporter, SyncProgress};
pub use scheduler::{SchedulerConfig, SyncRequest, SyncScheduler};
pub use staging::{StagedObjects, StagingCache};
pub use types::{
    GroupId, LibraryId, LibraryScope, ObjectType, SyncPassId, SyncType, Version, Versions,
};
