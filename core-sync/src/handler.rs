//! # Sync Action Handler
//!
//! The complete network and database surface the controller depends on.
//! [`LibraryActionHandler`](crate::library_handler::LibraryActionHandler) is
//! the standard implementation; tests script their own.

use crate::actions::{DownloadBatch, WriteBatch};
use crate::batch_processor::BatchSummary;
use crate::error::Result;
use crate::types::{GroupId, LibraryId, ObjectType, SyncType, Version, Versions};
use async_trait::async_trait;

/// What the local database knows about one library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryData {
    pub library: LibraryId,
    pub name: String,
    pub versions: Versions,
    /// Whether local changes may be uploaded.
    pub can_write: bool,
    /// Groups the user kept after losing access; never synced again.
    pub local_only: bool,
}

impl LibraryData {
    pub fn new(library: LibraryId, name: impl Into<String>) -> Self {
        Self {
            library,
            name: name.into(),
            versions: Versions::default(),
            can_write: true,
            local_only: false,
        }
    }
}

/// Outcome of comparing remote and local versions for one object type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionDiff {
    /// Remote version the outdated keys were listed at.
    pub version: Version,
    pub outdated_keys: Vec<String>,
}

#[async_trait]
pub trait SyncActionHandler: Send + Sync {
    /// Ids of every group the user can currently access.
    async fn load_all_group_ids(&self) -> Result<Vec<GroupId>>;

    /// Every library known locally, including local-only groups.
    async fn load_library_data(&self) -> Result<Vec<LibraryData>>;

    async fn synchronize_versions(
        &self,
        library: LibraryId,
        object_type: ObjectType,
        sync_type: SyncType,
    ) -> Result<VersionDiff>;

    /// Fetch and stage one batch. Per-object failures are returned in the
    /// summary; an `Err` means the whole batch failed.
    async fn download_object_json(&self, batch: &DownloadBatch) -> Result<BatchSummary>;

    async fn mark_for_resync(
        &self,
        library: LibraryId,
        object_type: ObjectType,
        keys: &[String],
    ) -> Result<()>;

    /// Commit staged objects and store `version`.
    ///
    /// Fails with [`SyncError::ObjectsFailed`](crate::SyncError::ObjectsFailed)
    /// when only some objects could not be stored.
    async fn synchronize_db_with_fetched_files(
        &self,
        library: LibraryId,
        object_type: ObjectType,
        version: Version,
    ) -> Result<()>;

    async fn synchronize_deletions(&self, library: LibraryId) -> Result<()>;

    /// Local changes of `library`, in batches of at most 50 objects.
    async fn updates(&self, library: LibraryId, versions: &Versions) -> Result<Vec<WriteBatch>>;

    async fn submit_update(&self, batch: &WriteBatch) -> Result<()>;

    async fn delete_group(&self, group_id: GroupId) -> Result<()>;

    async fn mark_group_as_local_only(&self, group_id: GroupId) -> Result<()>;

    async fn revert_library_updates(&self, library: LibraryId) -> Result<()>;

    async fn mark_changes_as_resolved(&self, library: LibraryId) -> Result<()>;
}
