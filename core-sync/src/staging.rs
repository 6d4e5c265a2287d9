//! # Staging Cache
//!
//! Fetched objects are written here, one JSON file per object, before they
//! are committed to the local database:
//!
//! ```text
//! <cache>/sync/<object_type>/<library>/<key>.json
//! e.g. <cache>/sync/item/group_42/ABCD2345.json
//! ```
//!
//! Files are written by the batch processor and consumed (read, then deleted)
//! by the db-store step. Nothing else touches them.

use crate::backend::{is_valid_key, RemoteObject};
use crate::error::{Result, SyncError};
use crate::types::{LibraryId, ObjectType};
use bridge_traits::storage::FileSystemAccess;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const STAGING_DIR: &str = "sync";
const EXTENSION: &str = "json";

/// Objects read back from the cache.
#[derive(Debug, Default)]
pub struct StagedObjects {
    pub objects: Vec<RemoteObject>,
    /// Keys whose files exist but could not be decoded.
    pub unreadable: Vec<String>,
}

/// Per-object JSON cache on top of [`FileSystemAccess`].
#[derive(Clone)]
pub struct StagingCache {
    fs: Arc<dyn FileSystemAccess>,
    root: PathBuf,
}

impl StagingCache {
    pub fn new(fs: Arc<dyn FileSystemAccess>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            root: cache_dir.into().join(STAGING_DIR),
        }
    }

    fn library_dir_name(library: LibraryId) -> String {
        match library {
            LibraryId::User => "user".to_string(),
            LibraryId::Group(id) => format!("group_{}", id),
        }
    }

    fn directory(&self, library: LibraryId, object_type: ObjectType) -> PathBuf {
        self.root
            .join(object_type.as_str())
            .join(Self::library_dir_name(library))
    }

    pub fn path(&self, library: LibraryId, object_type: ObjectType, key: &str) -> PathBuf {
        self.directory(library, object_type)
            .join(format!("{}.{}", key, EXTENSION))
    }

    fn key_of(path: &Path) -> Option<String> {
        if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        // Temporary files from in-flight atomic writes start with a dot
        if stem.starts_with('.') {
            return None;
        }
        Some(stem.to_string())
    }

    pub async fn stage(
        &self,
        library: LibraryId,
        object_type: ObjectType,
        object: &RemoteObject,
    ) -> Result<()> {
        if !is_valid_key(&object.key) {
            return Err(SyncError::Storage(format!("refusing to stage key `{}`", object.key)));
        }
        let json = serde_json::to_vec(object)
            .map_err(|e| SyncError::Storage(format!("encode {}: {}", object.key, e)))?;
        let path = self.path(library, object_type, &object.key);
        self.fs.write_file(&path, Bytes::from(json)).await?;
        Ok(())
    }

    /// Keys currently staged for (library, object type), sorted.
    pub async fn keys(&self, library: LibraryId, object_type: ObjectType) -> Result<Vec<String>> {
        let entries = self
            .fs
            .list_directory(&self.directory(library, object_type))
            .await?;
        Ok(entries.iter().filter_map(|p| Self::key_of(p)).collect())
    }

    pub async fn load(&self, library: LibraryId, object_type: ObjectType) -> Result<StagedObjects> {
        let mut staged = StagedObjects::default();

        for key in self.keys(library, object_type).await? {
            let data = self.fs.read_file(&self.path(library, object_type, &key)).await?;
            match serde_json::from_slice::<RemoteObject>(&data) {
                Ok(object) => staged.objects.push(object),
                Err(e) => {
                    warn!(%library, %object_type, %key, error = %e, "Unreadable staged object");
                    staged.unreadable.push(key);
                }
            }
        }

        debug!(
            %library,
            %object_type,
            count = staged.objects.len(),
            "Loaded staged objects"
        );
        Ok(staged)
    }

    pub async fn remove(
        &self,
        library: LibraryId,
        object_type: ObjectType,
        keys: &[String],
    ) -> Result<()> {
        for key in keys.iter().filter(|key| is_valid_key(key)) {
            self.fs.delete_file(&self.path(library, object_type, key)).await?;
        }
        Ok(())
    }

    /// Remove every staged object of a library.
    pub async fn clear_library(&self, library: LibraryId) -> Result<()> {
        for object_type in [
            ObjectType::Group,
            ObjectType::Collection,
            ObjectType::Item,
            ObjectType::Trash,
            ObjectType::Search,
            ObjectType::Tag,
        ] {
            self.fs
                .delete_dir_all(&self.directory(library, object_type))
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_desktop::TokioFileSystem;
    use serde_json::json;
    use tempfile::TempDir;

    fn cache(temp: &TempDir) -> StagingCache {
        let fs = Arc::new(TokioFileSystem::with_cache_directory(temp.path()));
        StagingCache::new(fs, temp.path())
    }

    fn item(key: &str) -> RemoteObject {
        RemoteObject {
            key: key.to_string(),
            version: 3,
            data: json!({"itemType": "book"}).as_object().cloned().unwrap(),
        }
    }

    #[test]
    fn test_layout() {
        let temp = TempDir::new().unwrap();
        let path = cache(&temp).path(LibraryId::Group(42), ObjectType::Item, "ABCD2345");
        assert_eq!(
            path,
            temp.path().join("sync/item/group_42/ABCD2345.json")
        );
    }

    #[tokio::test]
    async fn test_stage_load_remove() {
        let temp = TempDir::new().unwrap();
        let cache = cache(&temp);

        cache.stage(LibraryId::User, ObjectType::Item, &item("BBBB")).await.unwrap();
        cache.stage(LibraryId::User, ObjectType::Item, &item("AAAA")).await.unwrap();
        cache.stage(LibraryId::Group(1), ObjectType::Item, &item("CCCC")).await.unwrap();

        assert_eq!(
            cache.keys(LibraryId::User, ObjectType::Item).await.unwrap(),
            vec!["AAAA".to_string(), "BBBB".to_string()]
        );

        let staged = cache.load(LibraryId::User, ObjectType::Item).await.unwrap();
        assert_eq!(staged.objects, vec![item("AAAA"), item("BBBB")]);
        assert!(staged.unreadable.is_empty());

        cache
            .remove(LibraryId::User, ObjectType::Item, &["AAAA".to_string()])
            .await
            .unwrap();
        assert_eq!(
            cache.keys(LibraryId::User, ObjectType::Item).await.unwrap(),
            vec!["BBBB".to_string()]
        );

        // Other libraries are untouched
        assert_eq!(
            cache.keys(LibraryId::Group(1), ObjectType::Item).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_keys_outside_the_cache_are_refused() {
        let temp = TempDir::new().unwrap();
        let cache = cache(&temp);

        let result = cache
            .stage(LibraryId::User, ObjectType::Item, &item("../../../escaped"))
            .await;
        assert!(matches!(result, Err(SyncError::Storage(_))));

        // Nothing was written above the staging root
        assert!(!temp.path().join("escaped.json").exists());
        assert!(cache.keys(LibraryId::User, ObjectType::Item).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_files_are_reported() {
        let temp = TempDir::new().unwrap();
        let cache = cache(&temp);
        let path = cache.path(LibraryId::User, ObjectType::Collection, "BROKEN");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{not json").unwrap();

        let staged = cache.load(LibraryId::User, ObjectType::Collection).await.unwrap();
        assert!(staged.objects.is_empty());
        assert_eq!(staged.unreadable, vec!["BROKEN".to_string()]);
    }

    #[tokio::test]
    async fn test_clear_library() {
        let temp = TempDir::new().unwrap();
        let cache = cache(&temp);
        cache.stage(LibraryId::Group(9), ObjectType::Item, &item("AAAA")).await.unwrap();
        cache.stage(LibraryId::Group(9), ObjectType::Trash, &item("BBBB")).await.unwrap();

        cache.clear_library(LibraryId::Group(9)).await.unwrap();

        assert!(cache.keys(LibraryId::Group(9), ObjectType::Item).await.unwrap().is_empty());
        assert!(cache.keys(LibraryId::Group(9), ObjectType::Trash).await.unwrap().is_empty());
    }
}
