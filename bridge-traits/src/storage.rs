//! Storage and File System Abstractions
//!
//! The sync engine stages every fetched remote object as its own JSON file
//! before it is committed to the local database. This module defines the file
//! system contract that staging relies on, so hosts can place the cache in a
//! sandboxed container, an app group directory, or a plain temp folder.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// File system access trait
///
/// Abstracts the small set of file operations the staging cache needs:
/// - Desktop: direct filesystem access under a cache directory
/// - iOS/Android: sandboxed app cache directories
///
/// Writes must be atomic from the reader's point of view: a staged file is
/// either absent or complete. Deletes of missing paths succeed.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::storage::FileSystemAccess;
///
/// async fn stage(fs: &dyn FileSystemAccess, json: Bytes) -> Result<()> {
///     let dir = fs.get_cache_directory().await?.join("sync/items/user");
///     fs.create_dir_all(&dir).await?;
///     fs.write_file(&dir.join("ABCD2345.json"), json).await?;
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait FileSystemAccess: Send + Sync {
    /// Get the directory that holds transient sync data.
    async fn get_cache_directory(&self) -> Result<PathBuf>;

    /// Check if a file or directory exists
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Create a directory and all parent directories if they don't exist
    async fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Read entire file contents into memory
    async fn read_file(&self, path: &Path) -> Result<Bytes>;

    /// Write data to a file, replacing any previous content atomically
    async fn write_file(&self, path: &Path, data: Bytes) -> Result<()>;

    /// Delete a file. Missing files are not an error.
    async fn delete_file(&self, path: &Path) -> Result<()>;

    /// Delete a directory and all its contents. Missing directories are not an error.
    async fn delete_dir_all(&self, path: &Path) -> Result<()>;

    /// List the direct children of a directory.
    ///
    /// Returns an empty list when the directory does not exist.
    async fn list_directory(&self, path: &Path) -> Result<Vec<PathBuf>>;
}
