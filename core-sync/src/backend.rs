//! # Remote and Local Backends
//!
//! Narrow collaborator traits behind
//! [`LibraryActionHandler`](crate::library_handler::LibraryActionHandler):
//! [`RemoteApi`] is the versioned web API, [`LocalStore`] the local database.
//! Request formats and the relational schema stay on the other side of these
//! traits.

use crate::actions::WriteBatch;
use crate::error::Result;
use crate::handler::LibraryData;
use crate::types::{LibraryId, ObjectType, Version, Versions};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Object keys are ASCII alphanumeric; group keys are numeric ids.
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty() && key.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// One object as delivered by the remote API and as staged on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteObject {
    pub key: String,
    pub version: Version,
    pub data: Map<String, Value>,
}

impl RemoteObject {
    /// Checks the fields each object type cannot be stored without.
    pub fn validate(&self, object_type: ObjectType) -> std::result::Result<(), String> {
        if !is_valid_key(&self.key) {
            return Err(format!("invalid key `{}`", self.key));
        }

        let require_str = |field: &str| match self.data.get(field) {
            Some(Value::String(_)) => Ok(()),
            _ => Err(format!("missing string field `{}`", field)),
        };

        match object_type {
            ObjectType::Collection | ObjectType::Group => require_str("name"),
            ObjectType::Search => {
                require_str("name")?;
                match self.data.get("conditions") {
                    Some(Value::Array(_)) => Ok(()),
                    _ => Err("missing array field `conditions`".to_string()),
                }
            }
            ObjectType::Item | ObjectType::Trash => require_str("itemType"),
            ObjectType::Tag => require_str("tag"),
        }
    }
}

/// Raw body of an object fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectsResponse {
    pub last_modified_version: Version,
    /// JSON array of objects.
    pub body: Bytes,
}

/// Remote key to version listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteVersions {
    pub last_modified_version: Version,
    pub versions: HashMap<String, Version>,
}

/// Keys deleted remotely since a version, per object type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteDeletions {
    pub last_modified_version: Version,
    pub deleted: HashMap<ObjectType, Vec<String>>,
}

/// Per-key outcome of a write request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteResult {
    pub last_modified_version: Version,
    pub successful: Vec<String>,
    pub failed: Vec<String>,
}

/// An object with unsynced local changes.
#[derive(Debug, Clone, PartialEq)]
pub struct DirtyObject {
    pub object_type: ObjectType,
    pub key: String,
    /// Update payload sent to the remote API.
    pub payload: Value,
}

#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// List object versions, optionally only those changed after `since`.
    ///
    /// Group versions are listed under [`LibraryId::User`].
    async fn fetch_versions(
        &self,
        library: LibraryId,
        object_type: ObjectType,
        since: Option<Version>,
    ) -> Result<RemoteVersions>;

    async fn fetch_objects(
        &self,
        library: LibraryId,
        object_type: ObjectType,
        keys: &[String],
    ) -> Result<ObjectsResponse>;

    async fn fetch_deletions(&self, library: LibraryId, since: Version) -> Result<RemoteDeletions>;

    async fn submit_objects(&self, batch: &WriteBatch) -> Result<WriteResult>;
}

#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn libraries(&self) -> Result<Vec<LibraryData>>;

    async fn versions(&self, library: LibraryId) -> Result<Versions>;

    async fn store_version(
        &self,
        library: LibraryId,
        object_type: ObjectType,
        version: Version,
    ) -> Result<()>;

    /// Locally stored key to version map.
    async fn object_versions(
        &self,
        library: LibraryId,
        object_type: ObjectType,
    ) -> Result<HashMap<String, Version>>;

    /// Keys previously marked for resync. With `include_delayed` the
    /// per-object backoff is ignored.
    async fn keys_marked_for_resync(
        &self,
        library: LibraryId,
        object_type: ObjectType,
        include_delayed: bool,
    ) -> Result<Vec<String>>;

    async fn mark_for_resync(
        &self,
        library: LibraryId,
        object_type: ObjectType,
        keys: &[String],
    ) -> Result<()>;

    /// Of `keys`, those that also have unsynced local changes.
    async fn keys_with_local_changes(
        &self,
        library: LibraryId,
        object_type: ObjectType,
        keys: &[String],
    ) -> Result<Vec<String>>;

    /// Store objects; returns the keys that could not be stored.
    async fn commit_objects(
        &self,
        library: LibraryId,
        object_type: ObjectType,
        objects: Vec<RemoteObject>,
    ) -> Result<Vec<String>>;

    async fn apply_deletions(
        &self,
        library: LibraryId,
        deleted: &HashMap<ObjectType, Vec<String>>,
        version: Version,
    ) -> Result<()>;

    async fn dirty_objects(&self, library: LibraryId) -> Result<Vec<DirtyObject>>;

    async fn mark_objects_synced(
        &self,
        library: LibraryId,
        object_type: ObjectType,
        keys: &[String],
        version: Version,
    ) -> Result<()>;

    async fn delete_group(&self, library: LibraryId) -> Result<()>;

    async fn mark_group_as_local_only(&self, library: LibraryId) -> Result<()>;

    async fn revert_library(&self, library: LibraryId) -> Result<()>;

    async fn mark_changes_as_resolved(&self, library: LibraryId) -> Result<()>;
}
