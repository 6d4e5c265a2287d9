//! Integration tests for the batch processor
//!
//! A scripted remote answers each batch (keyed by its first object key) after
//! an optional delay; objects are staged into a temporary directory through
//! the desktop file system bridge.

use async_trait::async_trait;
use bridge_desktop::TokioFileSystem;
use bytes::Bytes;
use core_sync::{
    BatchProcessor, BatchProcessorConfig, DirtyObject, DownloadBatch, LibraryData, LibraryId,
    LocalStore, ObjectType, ObjectsResponse, RemoteApi, RemoteDeletions, RemoteObject,
    RemoteVersions, Result, StagingCache, SyncError, Version, Versions, WriteBatch, WriteResult,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

// ============================================================================
// Test doubles
// ============================================================================

#[derive(Clone)]
struct Reply {
    delay: Duration,
    result: Result<ObjectsResponse>,
}

#[derive(Default)]
struct ScriptedRemote {
    replies: Mutex<HashMap<String, Reply>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fetched: AtomicUsize,
}

impl ScriptedRemote {
    fn reply(&self, first_key: &str, delay_ms: u64, result: Result<ObjectsResponse>) {
        self.replies.lock().unwrap().insert(
            first_key.to_string(),
            Reply {
                delay: Duration::from_millis(delay_ms),
                result,
            },
        );
    }
}

#[async_trait]
impl RemoteApi for ScriptedRemote {
    async fn fetch_versions(
        &self,
        _library: LibraryId,
        _object_type: ObjectType,
        _since: Option<Version>,
    ) -> Result<RemoteVersions> {
        Ok(RemoteVersions::default())
    }

    async fn fetch_objects(
        &self,
        _library: LibraryId,
        _object_type: ObjectType,
        keys: &[String],
    ) -> Result<ObjectsResponse> {
        let reply = self
            .replies
            .lock()
            .unwrap()
            .get(&keys[0])
            .cloned()
            .expect("unscripted batch");

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(reply.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.fetched.fetch_add(1, Ordering::SeqCst);

        reply.result
    }

    async fn fetch_deletions(&self, _library: LibraryId, _since: Version) -> Result<RemoteDeletions> {
        Ok(RemoteDeletions::default())
    }

    async fn submit_objects(&self, _batch: &WriteBatch) -> Result<WriteResult> {
        Ok(WriteResult::default())
    }
}

/// Store that only answers the conflict lookup.
#[derive(Default)]
struct ConflictStore {
    locally_changed: Vec<String>,
}

#[async_trait]
impl LocalStore for ConflictStore {
    async fn libraries(&self) -> Result<Vec<LibraryData>> {
        Ok(Vec::new())
    }

    async fn versions(&self, _library: LibraryId) -> Result<Versions> {
        Ok(Versions::default())
    }

    async fn store_version(&self, _library: LibraryId, _object_type: ObjectType, _version: Version) -> Result<()> {
        panic!("the processor must not store versions")
    }

    async fn object_versions(&self, _library: LibraryId, _object_type: ObjectType) -> Result<HashMap<String, Version>> {
        Ok(HashMap::new())
    }

    async fn keys_marked_for_resync(
        &self,
        _library: LibraryId,
        _object_type: ObjectType,
        _include_delayed: bool,
    ) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn mark_for_resync(&self, _library: LibraryId, _object_type: ObjectType, _keys: &[String]) -> Result<()> {
        Ok(())
    }

    async fn keys_with_local_changes(
        &self,
        _library: LibraryId,
        _object_type: ObjectType,
        keys: &[String],
    ) -> Result<Vec<String>> {
        Ok(keys
            .iter()
            .filter(|key| self.locally_changed.contains(key))
            .cloned()
            .collect())
    }

    async fn commit_objects(
        &self,
        _library: LibraryId,
        _object_type: ObjectType,
        _objects: Vec<RemoteObject>,
    ) -> Result<Vec<String>> {
        panic!("the processor must not commit")
    }

    async fn apply_deletions(
        &self,
        _library: LibraryId,
        _deleted: &HashMap<ObjectType, Vec<String>>,
        _version: Version,
    ) -> Result<()> {
        Ok(())
    }

    async fn dirty_objects(&self, _library: LibraryId) -> Result<Vec<DirtyObject>> {
        Ok(Vec::new())
    }

    async fn mark_objects_synced(
        &self,
        _library: LibraryId,
        _object_type: ObjectType,
        _keys: &[String],
        _version: Version,
    ) -> Result<()> {
        Ok(())
    }

    async fn delete_group(&self, _library: LibraryId) -> Result<()> {
        Ok(())
    }

    async fn mark_group_as_local_only(&self, _library: LibraryId) -> Result<()> {
        Ok(())
    }

    async fn revert_library(&self, _library: LibraryId) -> Result<()> {
        Ok(())
    }

    async fn mark_changes_as_resolved(&self, _library: LibraryId) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

struct Fixture {
    _temp: TempDir,
    remote: Arc<ScriptedRemote>,
    staging: StagingCache,
    processor: BatchProcessor,
}

fn fixture(store: ConflictStore) -> Fixture {
    let temp = TempDir::new().unwrap();
    let fs = Arc::new(TokioFileSystem::with_cache_directory(temp.path()));
    let staging = StagingCache::new(fs, temp.path());
    let remote = Arc::new(ScriptedRemote::default());
    let processor = BatchProcessor::new(
        Arc::clone(&remote) as Arc<dyn RemoteApi>,
        Arc::new(store),
        staging.clone(),
        BatchProcessorConfig::default(),
    );

    Fixture {
        _temp: temp,
        remote,
        staging,
        processor,
    }
}

fn item_record(key: &str) -> Value {
    json!({"key": key, "version": 7, "data": {"itemType": "book", "title": key}})
}

fn collection_record(key: &str) -> Value {
    json!({"key": key, "version": 7, "data": {"name": key}})
}

fn response(version: Version, records: Vec<Value>) -> Result<ObjectsResponse> {
    Ok(ObjectsResponse {
        last_modified_version: version,
        body: Bytes::from(Value::Array(records).to_string()),
    })
}

fn batch(object_type: ObjectType, keys: &[&str], version: Version) -> DownloadBatch {
    DownloadBatch {
        library: LibraryId::User,
        object_type,
        keys: keys.iter().map(ToString::to_string).collect(),
        version,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_fetches_are_bounded_to_four() {
    let f = fixture(ConflictStore::default());
    let mut batches = Vec::new();
    for i in 0..10 {
        let key = format!("ITEM{:02}", i);
        f.remote.reply(&key, 20, response(7, vec![item_record(&key)]));
        batches.push(batch(ObjectType::Item, &[key.as_str()], 7));
    }

    let summary = f.processor.process(batches).await.unwrap();

    assert_eq!(summary.staged, 10);
    assert!(summary.is_clean());
    assert_eq!(f.remote.fetched.load(Ordering::SeqCst), 10);
    assert!(f.remote.max_in_flight.load(Ordering::SeqCst) <= 4);
    assert_eq!(f.staging.keys(LibraryId::User, ObjectType::Item).await.unwrap().len(), 10);
}

#[tokio::test]
async fn test_version_mismatch_fails_once_and_leaves_nothing_staged() {
    let f = fixture(ConflictStore::default());
    f.remote.reply("A", 0, response(7, vec![item_record("A")]));
    f.remote.reply("B", 10, response(8, vec![item_record("B")]));
    f.remote.reply("C", 200, response(7, vec![item_record("C")]));

    let err = f
        .processor
        .process(vec![
            batch(ObjectType::Item, &["A"], 7),
            batch(ObjectType::Item, &["B"], 7),
            batch(ObjectType::Item, &["C"], 7),
        ])
        .await
        .unwrap_err();

    assert_eq!(
        err,
        SyncError::VersionMismatch {
            library: LibraryId::User,
            expected: 7,
            actual: 8,
        }
    );
    // "A" was staged before the mismatch and has been discarded again
    assert!(f.staging.keys(LibraryId::User, ObjectType::Item).await.unwrap().is_empty());
    // The slow fetch was cancelled
    assert!(f.remote.fetched.load(Ordering::SeqCst) < 3);
}

#[tokio::test]
async fn test_bad_item_record_only_fails_its_key() {
    let f = fixture(ConflictStore::default());
    f.remote.reply(
        "A",
        0,
        response(
            7,
            vec![
                item_record("A"),
                json!({"key": "B", "version": 7, "data": {"title": "no item type"}}),
                item_record("C"),
            ],
        ),
    );

    let summary = f
        .processor
        .process(vec![batch(ObjectType::Item, &["A", "B", "C"], 7)])
        .await
        .unwrap();

    assert_eq!(summary.staged, 2);
    assert_eq!(summary.failed_keys, vec!["B".to_string()]);
    assert!(matches!(
        summary.parsing_errors.as_slice(),
        [SyncError::Parsing { key: Some(key), .. }] if key == "B"
    ));
}

#[tokio::test]
async fn test_bad_collection_record_only_fails_its_key() {
    let f = fixture(ConflictStore::default());
    f.remote.reply(
        "A",
        0,
        response(7, vec![collection_record("A"), json!({"key": "B", "version": 7, "data": {}})]),
    );

    let summary = f
        .processor
        .process(vec![batch(ObjectType::Collection, &["A", "B"], 7)])
        .await
        .unwrap();

    assert_eq!(summary.staged, 1);
    assert_eq!(summary.failed_keys, vec!["B".to_string()]);
    assert!(matches!(
        summary.parsing_errors.as_slice(),
        [SyncError::Parsing { key: Some(key), .. }] if key == "B"
    ));
    assert_eq!(
        f.staging.keys(LibraryId::User, ObjectType::Collection).await.unwrap(),
        vec!["A".to_string()]
    );
}

#[tokio::test]
async fn test_non_array_body_fails_batch() {
    let f = fixture(ConflictStore::default());
    f.remote.reply(
        "A",
        0,
        Ok(ObjectsResponse {
            last_modified_version: 7,
            body: Bytes::from_static(b"{\"error\": \"unavailable\"}"),
        }),
    );

    let err = f
        .processor
        .process(vec![batch(ObjectType::Collection, &["A"], 7)])
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::MalformedResponse(_)));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_collections_are_not_checked_for_conflicts() {
    let f = fixture(ConflictStore {
        locally_changed: vec!["A".to_string()],
    });
    f.remote.reply("A", 0, response(7, vec![collection_record("A")]));

    let summary = f
        .processor
        .process(vec![batch(ObjectType::Collection, &["A"], 7)])
        .await
        .unwrap();

    assert!(summary.conflicts.is_empty());
    assert_eq!(summary.staged, 1);
}

#[tokio::test]
async fn test_missing_collection_keys_are_reported() {
    let f = fixture(ConflictStore::default());
    f.remote.reply("A", 0, response(7, vec![collection_record("A")]));

    let summary = f
        .processor
        .process(vec![batch(ObjectType::Collection, &["A", "Z"], 7)])
        .await
        .unwrap();

    assert_eq!(summary.staged, 1);
    assert_eq!(summary.failed_keys, vec!["Z".to_string()]);
    assert!(summary.parsing_errors.is_empty());
}

#[tokio::test]
async fn test_local_changes_surface_as_conflicts() {
    let f = fixture(ConflictStore {
        locally_changed: vec!["B".to_string()],
    });
    f.remote.reply("A", 0, response(7, vec![item_record("A"), item_record("B")]));

    let summary = f
        .processor
        .process(vec![batch(ObjectType::Item, &["A", "B"], 7)])
        .await
        .unwrap();

    assert_eq!(summary.conflicts.len(), 1);
    assert_eq!(summary.conflicts[0].key, "B");
    // Conflicting objects are still staged; resolution happens elsewhere
    assert_eq!(summary.staged, 2);
}

#[tokio::test]
async fn test_transport_failure_cancels_remaining_fetches() {
    let f = fixture(ConflictStore::default());
    f.remote
        .reply("A", 0, Err(SyncError::Transport("connection reset".to_string())));
    for key in ["B", "C", "D", "E", "F"] {
        f.remote.reply(key, 500, response(7, vec![item_record(key)]));
    }

    let batches = ["A", "B", "C", "D", "E", "F"]
        .iter()
        .map(|key| batch(ObjectType::Item, &[key], 7))
        .collect();
    let err = f.processor.process(batches).await.unwrap_err();

    assert_eq!(err, SyncError::Transport("connection reset".to_string()));
    assert_eq!(f.remote.fetched.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_dropped_run_stops_fetching_and_discards_staged_objects() {
    let f = fixture(ConflictStore::default());
    f.remote.reply("A", 0, response(7, vec![item_record("A")]));
    for key in ["B", "C", "D", "E", "F"] {
        f.remote.reply(key, 300, response(7, vec![item_record(key)]));
    }

    let batches = ["A", "B", "C", "D", "E", "F"]
        .iter()
        .map(|key| batch(ObjectType::Item, &[key], 7))
        .collect();
    let run = tokio::time::timeout(Duration::from_millis(100), f.processor.process(batches)).await;
    assert!(run.is_err());

    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(f.remote.fetched.load(Ordering::SeqCst), 1);
    assert!(f.staging.keys(LibraryId::User, ObjectType::Item).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_empty_input_is_a_clean_summary() {
    let f = fixture(ConflictStore::default());
    let summary = f.processor.process(Vec::new()).await.unwrap();
    assert!(summary.is_clean());
    assert_eq!(summary.staged, 0);
}
