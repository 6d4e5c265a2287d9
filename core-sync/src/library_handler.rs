//! # Library Action Handler
//!
//! Standard [`SyncActionHandler`] built from a [`RemoteApi`], a [`LocalStore`]
//! and the staging cache. Downloads run through a [`BatchProcessor`]; the
//! db-store step commits what the processor staged.

use crate::actions::{chunk_keys, DownloadBatch, WriteBatch};
use crate::backend::{is_valid_key, LocalStore, RemoteApi};
use crate::batch_processor::{BatchProcessor, BatchProcessorConfig, BatchSummary};
use crate::error::{Result, SyncError};
use crate::handler::{LibraryData, SyncActionHandler, VersionDiff};
use crate::staging::StagingCache;
use crate::types::{GroupId, LibraryId, ObjectType, SyncType, Version, Versions};
use async_trait::async_trait;
use core_runtime::config::{SyncSettings, MAX_KEYS_PER_BATCH};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Object types uploaded by the push path, in dependency order.
const UPLOAD_ORDER: [ObjectType; 3] = [ObjectType::Collection, ObjectType::Search, ObjectType::Item];

pub struct LibraryActionHandler {
    remote: Arc<dyn RemoteApi>,
    store: Arc<dyn LocalStore>,
    staging: StagingCache,
    processor: BatchProcessor,
    keys_per_request: usize,
}

impl LibraryActionHandler {
    pub fn new(
        remote: Arc<dyn RemoteApi>,
        store: Arc<dyn LocalStore>,
        staging: StagingCache,
        settings: &SyncSettings,
    ) -> Self {
        let processor = BatchProcessor::new(
            Arc::clone(&remote),
            Arc::clone(&store),
            staging.clone(),
            BatchProcessorConfig::from(settings),
        );

        Self {
            remote,
            store,
            staging,
            processor,
            keys_per_request: settings.keys_per_request,
        }
    }

    /// Commit staged objects and drop their files.
    ///
    /// Returns the keys that could not be committed.
    async fn commit_staged(&self, library: LibraryId, object_type: ObjectType) -> Result<Vec<String>> {
        let staged = self.staging.load(library, object_type).await?;
        let consumed: Vec<String> = staged
            .objects
            .iter()
            .map(|o| o.key.clone())
            .chain(staged.unreadable.iter().cloned())
            .collect();

        let mut failed = if staged.objects.is_empty() {
            Vec::new()
        } else {
            self.store
                .commit_objects(library, object_type, staged.objects)
                .await?
        };
        failed.extend(staged.unreadable);

        self.staging.remove(library, object_type, &consumed).await?;

        debug!(
            %library,
            %object_type,
            committed = consumed.len() - failed.len(),
            failed = failed.len(),
            "Committed staged objects"
        );
        Ok(failed)
    }
}

#[async_trait]
impl SyncActionHandler for LibraryActionHandler {
    async fn load_all_group_ids(&self) -> Result<Vec<GroupId>> {
        let listing = self
            .remote
            .fetch_versions(LibraryId::User, ObjectType::Group, None)
            .await?;

        let mut ids = listing
            .versions
            .keys()
            .map(|key| {
                key.parse::<GroupId>()
                    .map_err(|_| SyncError::MalformedResponse(format!("invalid group id `{}`", key)))
            })
            .collect::<Result<Vec<_>>>()?;
        ids.sort_unstable();
        Ok(ids)
    }

    async fn load_library_data(&self) -> Result<Vec<LibraryData>> {
        self.store.libraries().await
    }

    #[instrument(skip(self), fields(%library, %object_type, %sync_type))]
    async fn synchronize_versions(
        &self,
        library: LibraryId,
        object_type: ObjectType,
        sync_type: SyncType,
    ) -> Result<VersionDiff> {
        let since = if sync_type == SyncType::Full || object_type == ObjectType::Group {
            None
        } else {
            Some(self.store.versions(library).await?.get(object_type))
        };

        let remote = self.remote.fetch_versions(library, object_type, since).await?;
        let local = self.store.object_versions(library, object_type).await?;

        let mut outdated: Vec<String> = Vec::new();
        for (key, version) in &remote.versions {
            if !is_valid_key(key) {
                warn!(%key, "Skipping invalid key in version listing");
                continue;
            }
            if local.get(key) != Some(version) {
                outdated.push(key.clone());
            }
        }
        outdated.sort();

        let known: HashSet<String> = outdated.iter().cloned().collect();
        let retry = self
            .store
            .keys_marked_for_resync(library, object_type, sync_type >= SyncType::IgnoreIndividualDelays)
            .await?;
        outdated.extend(retry.into_iter().filter(|key| !known.contains(key)));

        debug!(
            version = remote.last_modified_version,
            outdated = outdated.len(),
            "Version diff computed"
        );
        Ok(VersionDiff {
            version: remote.last_modified_version,
            outdated_keys: outdated,
        })
    }

    #[instrument(skip(self, batch), fields(library = %batch.library, object_type = %batch.object_type, keys = batch.keys.len()))]
    async fn download_object_json(&self, batch: &DownloadBatch) -> Result<BatchSummary> {
        let requests: Vec<DownloadBatch> = chunk_keys(batch.keys.clone(), self.keys_per_request)
            .into_iter()
            .map(|keys| DownloadBatch {
                library: batch.library,
                object_type: batch.object_type,
                keys,
                version: batch.version,
            })
            .collect();

        let mut summary = self.processor.process(requests).await?;

        // Group metadata is needed before libraries are enumerated, so it is
        // committed right away instead of through a trailing db-store action.
        if batch.object_type == ObjectType::Group {
            let failed = self.commit_staged(batch.library, ObjectType::Group).await?;
            summary.failed_keys.extend(failed);
        }

        Ok(summary)
    }

    async fn mark_for_resync(
        &self,
        library: LibraryId,
        object_type: ObjectType,
        keys: &[String],
    ) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        info!(%library, %object_type, keys = keys.len(), "Marking objects for resync");
        self.store.mark_for_resync(library, object_type, keys).await
    }

    #[instrument(skip(self))]
    async fn synchronize_db_with_fetched_files(
        &self,
        library: LibraryId,
        object_type: ObjectType,
        version: Version,
    ) -> Result<()> {
        let failed = self.commit_staged(library, object_type).await?;
        self.store.store_version(library, object_type, version).await?;

        if failed.is_empty() {
            Ok(())
        } else {
            Err(SyncError::ObjectsFailed {
                library,
                object_type,
                keys: failed,
            })
        }
    }

    #[instrument(skip(self))]
    async fn synchronize_deletions(&self, library: LibraryId) -> Result<()> {
        let since = self.store.versions(library).await?.deletions;
        let deletions = self.remote.fetch_deletions(library, since).await?;

        let total: usize = deletions.deleted.values().map(Vec::len).sum();
        if total > 0 {
            info!(deleted = total, "Applying remote deletions");
        }

        self.store
            .apply_deletions(library, &deletions.deleted, deletions.last_modified_version)
            .await
    }

    async fn updates(&self, library: LibraryId, versions: &Versions) -> Result<Vec<WriteBatch>> {
        let dirty = self.store.dirty_objects(library).await?;

        let mut by_type: BTreeMap<usize, (ObjectType, Vec<serde_json::Value>)> = BTreeMap::new();
        for object in dirty {
            let Some(rank) = UPLOAD_ORDER.iter().position(|t| *t == object.object_type) else {
                warn!(%library, object_type = %object.object_type, key = %object.key, "Skipping unsupported upload");
                continue;
            };
            by_type
                .entry(rank)
                .or_insert_with(|| (object.object_type, Vec::new()))
                .1
                .push(object.payload);
        }

        let version = versions.max();
        let mut batches = Vec::new();
        for (_, (object_type, payloads)) in by_type {
            for chunk in payloads.chunks(MAX_KEYS_PER_BATCH) {
                batches.push(WriteBatch {
                    library,
                    object_type,
                    version,
                    parameters: chunk.to_vec(),
                });
            }
        }

        Ok(batches)
    }

    #[instrument(skip(self, batch), fields(library = %batch.library, object_type = %batch.object_type, objects = batch.len()))]
    async fn submit_update(&self, batch: &WriteBatch) -> Result<()> {
        let result = self.remote.submit_objects(batch).await?;

        self.store
            .mark_objects_synced(
                batch.library,
                batch.object_type,
                &result.successful,
                result.last_modified_version,
            )
            .await?;

        if result.failed.is_empty() {
            Ok(())
        } else {
            Err(SyncError::ObjectsFailed {
                library: batch.library,
                object_type: batch.object_type,
                keys: result.failed,
            })
        }
    }

    async fn delete_group(&self, group_id: GroupId) -> Result<()> {
        let library = LibraryId::Group(group_id);
        self.staging.clear_library(library).await?;
        self.store.delete_group(library).await
    }

    async fn mark_group_as_local_only(&self, group_id: GroupId) -> Result<()> {
        let library = LibraryId::Group(group_id);
        self.staging.clear_library(library).await?;
        self.store.mark_group_as_local_only(library).await
    }

    async fn revert_library_updates(&self, library: LibraryId) -> Result<()> {
        self.store.revert_library(library).await
    }

    async fn mark_changes_as_resolved(&self, library: LibraryId) -> Result<()> {
        self.store.mark_changes_as_resolved(library).await
    }
}
