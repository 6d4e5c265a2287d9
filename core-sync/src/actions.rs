//! # Queue Actions
//!
//! The units of work drained by the [`SyncController`](crate::controller::SyncController).
//!
//! ## Ordering
//!
//! A `SyncVersions` action expands into its `SyncObject` batches followed by
//! one trailing `SyncFilesToDb`. The whole expansion is inserted at the front
//! of the queue, so it finishes before the next object type of the same
//! library starts:
//!
//! ```text
//! [V(user,collection), V(user,search), ...]
//!   └─> [O(user,collection,k1..k50), O(..k51..k70), F(user,collection), V(user,search), ...]
//! ```

use crate::conflict_resolver::{Conflict, ConflictResolution};
use crate::types::{LibraryId, ObjectType, Version};
use serde_json::Value;
use std::collections::HashSet;

/// Keys fetched together for one (library, object type, version).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadBatch {
    pub library: LibraryId,
    pub object_type: ObjectType,
    pub keys: Vec<String>,
    pub version: Version,
}

/// Local changes submitted together for one library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBatch {
    pub library: LibraryId,
    pub object_type: ObjectType,
    /// Library version the changes are based on.
    pub version: Version,
    /// One update payload per dirty object.
    pub parameters: Vec<Value>,
}

impl WriteBatch {
    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueAction {
    /// Re-derive group membership and enqueue per-library work.
    SyncAllGroups,
    SyncVersions {
        library: LibraryId,
        object_type: ObjectType,
    },
    SyncObject(DownloadBatch),
    /// Commit everything staged for (library, object type) and store `version`.
    SyncFilesToDb {
        library: LibraryId,
        object_type: ObjectType,
        version: Version,
    },
    SyncDeletions {
        library: LibraryId,
    },
    /// Collect local changes of a library and queue their write batches.
    PushChanges {
        library: LibraryId,
    },
    SubmitWriteBatch(WriteBatch),
    ResolveConflict(Conflict),
    ApplyResolution(ConflictResolution),
}

impl QueueAction {
    /// The library this action belongs to. `SyncAllGroups` spans all of them.
    pub fn library(&self) -> Option<LibraryId> {
        match self {
            QueueAction::SyncAllGroups => None,
            QueueAction::SyncVersions { library, .. }
            | QueueAction::SyncFilesToDb { library, .. }
            | QueueAction::SyncDeletions { library }
            | QueueAction::PushChanges { library } => Some(*library),
            QueueAction::SyncObject(batch) => Some(batch.library),
            QueueAction::SubmitWriteBatch(batch) => Some(batch.library),
            QueueAction::ResolveConflict(conflict) => Some(conflict.library()),
            QueueAction::ApplyResolution(resolution) => Some(resolution.library()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            QueueAction::SyncAllGroups => "sync_all_groups",
            QueueAction::SyncVersions { .. } => "sync_versions",
            QueueAction::SyncObject(_) => "sync_object",
            QueueAction::SyncFilesToDb { .. } => "sync_files_to_db",
            QueueAction::SyncDeletions { .. } => "sync_deletions",
            QueueAction::PushChanges { .. } => "push_changes",
            QueueAction::SubmitWriteBatch(_) => "submit_write_batch",
            QueueAction::ResolveConflict(_) => "resolve_conflict",
            QueueAction::ApplyResolution(_) => "apply_resolution",
        }
    }
}

/// Split `keys` into chunks of at most `size`, dropping repeated keys.
///
/// Key order is preserved and every distinct key appears in exactly one chunk.
pub fn chunk_keys(keys: Vec<String>, size: usize) -> Vec<Vec<String>> {
    let size = size.max(1);
    let mut seen = HashSet::with_capacity(keys.len());
    let unique: Vec<String> = keys
        .into_iter()
        .filter(|key| seen.insert(key.clone()))
        .collect();

    unique.chunks(size).map(|chunk| chunk.to_vec()).collect()
}

/// Actions that follow a successful version diff.
///
/// Groups are fetched one per request and followed by `SyncAllGroups`, since
/// group metadata decides which libraries exist. Every other object type is
/// chunked into `batch_size` batches and closed by `SyncFilesToDb`.
pub fn download_actions(
    library: LibraryId,
    object_type: ObjectType,
    version: Version,
    keys: Vec<String>,
    batch_size: usize,
) -> Vec<QueueAction> {
    let chunk_size = if object_type == ObjectType::Group {
        1
    } else {
        batch_size
    };

    let mut actions: Vec<QueueAction> = chunk_keys(keys, chunk_size)
        .into_iter()
        .map(|keys| {
            QueueAction::SyncObject(DownloadBatch {
                library,
                object_type,
                keys,
                version,
            })
        })
        .collect();

    if object_type == ObjectType::Group {
        actions.push(QueueAction::SyncAllGroups);
    } else {
        actions.push(QueueAction::SyncFilesToDb {
            library,
            object_type,
            version,
        });
    }

    actions
}
