//! # Batch Processor
//!
//! Fetches a set of [`DownloadBatch`]es with bounded concurrency, decodes and
//! validates each response, stages the decoded objects and folds everything
//! into one [`BatchSummary`].
//!
//! ## Flow
//!
//! ```text
//! batches ──> [fetch worker] x max_concurrent ──mpsc──> aggregator (serial)
//!                                                         ├─ version guard
//!                                                         ├─ decode per record
//!                                                         ├─ conflict lookup (items, trash)
//!                                                         └─ stage to cache
//! ```
//!
//! The first failure aborts every outstanding fetch, deletes whatever this
//! run already staged and is returned as the single result. Dropping the run
//! does the same.

use crate::actions::DownloadBatch;
use crate::backend::{LocalStore, ObjectsResponse, RemoteApi, RemoteObject};
use crate::error::{Result, SyncError};
use crate::staging::StagingCache;
use crate::types::{LibraryId, ObjectType};
use core_runtime::config::SyncSettings;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, instrument, warn};

/// A remote object that also has unsynced local changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteConflict {
    pub library: LibraryId,
    pub object_type: ObjectType,
    pub key: String,
}

impl WriteConflict {
    pub fn into_error(self) -> SyncError {
        SyncError::ObjectConflict {
            library: self.library,
            object_type: self.object_type,
            key: self.key,
        }
    }
}

/// Aggregate result of one processor run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Requested keys that were not staged.
    pub failed_keys: Vec<String>,
    pub parsing_errors: Vec<SyncError>,
    pub conflicts: Vec<WriteConflict>,
    /// Number of objects written to the staging cache.
    pub staged: usize,
}

impl BatchSummary {
    pub fn is_clean(&self) -> bool {
        self.failed_keys.is_empty() && self.parsing_errors.is_empty() && self.conflicts.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchProcessorConfig {
    pub max_concurrent: usize,
}

impl Default for BatchProcessorConfig {
    fn default() -> Self {
        Self { max_concurrent: 4 }
    }
}

impl From<&SyncSettings> for BatchProcessorConfig {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            max_concurrent: settings.max_concurrent_fetches,
        }
    }
}

struct Decoded {
    objects: Vec<RemoteObject>,
    parsing_errors: Vec<SyncError>,
}

/// Decode a response body.
///
/// Only a body that is not a JSON array fails the batch. Records are decoded
/// one by one; a bad record becomes a parsing error and, since it is missing
/// from the decoded objects, a failed key of its batch.
fn decode_objects(object_type: ObjectType, body: &[u8]) -> Result<Decoded> {
    let records: Vec<Value> = serde_json::from_slice(body).map_err(|e| {
        SyncError::MalformedResponse(format!("{} response is not a JSON array: {}", object_type, e))
    })?;

    let mut decoded = Decoded {
        objects: Vec::with_capacity(records.len()),
        parsing_errors: Vec::new(),
    };

    for record in records {
        let key = record
            .get("key")
            .and_then(Value::as_str)
            .map(ToString::to_string);

        let parsed = serde_json::from_value::<RemoteObject>(record)
            .map_err(|e| e.to_string())
            .and_then(|object| object.validate(object_type).map(|_| object));

        match parsed {
            Ok(object) => decoded.objects.push(object),
            Err(message) => decoded.parsing_errors.push(SyncError::Parsing {
                object_type,
                key,
                message,
            }),
        }
    }

    Ok(decoded)
}

pub struct BatchProcessor {
    remote: Arc<dyn RemoteApi>,
    store: Arc<dyn LocalStore>,
    staging: StagingCache,
    config: BatchProcessorConfig,
}

impl BatchProcessor {
    pub fn new(
        remote: Arc<dyn RemoteApi>,
        store: Arc<dyn LocalStore>,
        staging: StagingCache,
        config: BatchProcessorConfig,
    ) -> Self {
        Self {
            remote,
            store,
            staging,
            config,
        }
    }

    /// Fetch, decode and stage all `batches`.
    ///
    /// Dropping the returned future aborts every outstanding fetch and
    /// deletes what this run staged.
    #[instrument(skip(self, batches), fields(batches = batches.len()))]
    pub async fn process(&self, batches: Vec<DownloadBatch>) -> Result<BatchSummary> {
        if batches.is_empty() {
            return Ok(BatchSummary::default());
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let (tx, mut rx) = mpsc::channel::<(usize, Result<ObjectsResponse>)>(batches.len());
        let mut fetches = JoinSet::new();

        for (index, batch) in batches.iter().enumerate() {
            let remote = Arc::clone(&self.remote);
            let semaphore = Arc::clone(&semaphore);
            let tx = tx.clone();
            let library = batch.library;
            let object_type = batch.object_type;
            let keys = batch.keys.clone();

            fetches.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let result = remote.fetch_objects(library, object_type, &keys).await;
                tx.send((index, result)).await.ok();
            });
        }
        drop(tx);

        let mut summary = BatchSummary::default();
        let mut staged = StagedRun::new(self.staging.clone());
        let mut processed = 0usize;

        while let Some((index, result)) = rx.recv().await {
            let batch = &batches[index];
            let outcome = match result {
                Ok(response) => self.aggregate(batch, response, &mut summary, &mut staged).await,
                Err(err) => Err(err),
            };

            if let Err(err) = outcome {
                error!(
                    library = %batch.library,
                    object_type = %batch.object_type,
                    error = %err,
                    "Batch failed, cancelling remaining fetches"
                );
                fetches.abort_all();
                staged.discard().await;
                return Err(err);
            }

            processed += 1;
        }

        if processed != batches.len() {
            // A worker ended without reporting; treat it like a failed fetch
            staged.discard().await;
            return Err(SyncError::Unexpected(format!(
                "{} of {} batch fetches did not complete",
                batches.len() - processed,
                batches.len()
            )));
        }

        staged.keep();
        debug!(
            staged = summary.staged,
            failed = summary.failed_keys.len(),
            conflicts = summary.conflicts.len(),
            "Batches processed"
        );
        Ok(summary)
    }

    async fn aggregate(
        &self,
        batch: &DownloadBatch,
        response: ObjectsResponse,
        summary: &mut BatchSummary,
        staged: &mut StagedRun,
    ) -> Result<()> {
        // Group responses carry per-group versions, not a library version
        if batch.object_type != ObjectType::Group && response.last_modified_version != batch.version {
            return Err(SyncError::VersionMismatch {
                library: batch.library,
                expected: batch.version,
                actual: response.last_modified_version,
            });
        }

        let decoded = decode_objects(batch.object_type, &response.body)?;

        let requested: HashSet<&str> = batch.keys.iter().map(String::as_str).collect();
        let objects: Vec<RemoteObject> = decoded
            .objects
            .into_iter()
            .filter(|object| requested.contains(object.key.as_str()))
            .collect();
        let decoded_keys: HashSet<&str> = objects.iter().map(|o| o.key.as_str()).collect();

        let missing: Vec<String> = batch
            .keys
            .iter()
            .filter(|key| !decoded_keys.contains(key.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            warn!(
                library = %batch.library,
                object_type = %batch.object_type,
                missing = missing.len(),
                "Objects missing from batch response"
            );
        }

        let conflicted = if batch.object_type.reports_write_conflicts() {
            let keys: Vec<String> = objects.iter().map(|o| o.key.clone()).collect();
            self.store
                .keys_with_local_changes(batch.library, batch.object_type, &keys)
                .await?
        } else {
            Vec::new()
        };

        for object in &objects {
            self.staging
                .stage(batch.library, batch.object_type, object)
                .await?;
            staged.push(batch.library, batch.object_type, object.key.clone());
        }

        summary.staged += objects.len();
        summary.failed_keys.extend(missing);
        summary.parsing_errors.extend(decoded.parsing_errors);
        summary
            .conflicts
            .extend(conflicted.into_iter().map(|key| WriteConflict {
                library: batch.library,
                object_type: batch.object_type,
                key,
            }));

        Ok(())
    }
}

/// Objects staged by one run. Unless kept, they are deleted again, also when
/// the run is dropped half way.
struct StagedRun {
    staging: StagingCache,
    objects: Vec<(LibraryId, ObjectType, String)>,
}

impl StagedRun {
    fn new(staging: StagingCache) -> Self {
        Self {
            staging,
            objects: Vec::new(),
        }
    }

    fn push(&mut self, library: LibraryId, object_type: ObjectType, key: String) {
        self.objects.push((library, object_type, key));
    }

    fn keep(&mut self) {
        self.objects.clear();
    }

    async fn discard(&mut self) {
        remove_staged(&self.staging, std::mem::take(&mut self.objects)).await;
    }
}

impl Drop for StagedRun {
    fn drop(&mut self) {
        if self.objects.is_empty() {
            return;
        }
        let objects = std::mem::take(&mut self.objects);
        let staging = self.staging.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(objects = objects.len(), "Run dropped, discarding staged objects");
                handle.spawn(async move { remove_staged(&staging, objects).await });
            }
            Err(_) => warn!(
                objects = objects.len(),
                "No runtime to discard staged objects of a dropped run"
            ),
        }
    }
}

async fn remove_staged(staging: &StagingCache, objects: Vec<(LibraryId, ObjectType, String)>) {
    for (library, object_type, key) in objects {
        if let Err(err) = staging
            .remove(library, object_type, std::slice::from_ref(&key))
            .await
        {
            warn!(%library, %object_type, %key, error = %err, "Failed to discard staged object");
        }
    }
}
