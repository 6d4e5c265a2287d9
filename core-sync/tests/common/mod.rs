//! Shared test doubles for the controller and scheduler tests.

#![allow(dead_code)]

use async_trait::async_trait;
use core_runtime::events::EventBus;
use core_sync::{
    AllowAllPermissions, BatchSummary, ChannelConflictReceiver, ConflictPrompt, ConflictResolver,
    ControllerConfig, ControllerSignal, DownloadBatch, GroupId, LibraryData, LibraryId,
    ObjectType, PassReport, PermissionReceiver, ProgressReporter, Result, SyncActionHandler,
    SyncController, SyncError, SyncType, Version, VersionDiff, Versions, WriteBatch,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// One recorded call into the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    GroupIds,
    LibraryData,
    Versions(LibraryId, ObjectType, SyncType),
    Download(DownloadBatch),
    MarkForResync(LibraryId, ObjectType, Vec<String>),
    FilesToDb(LibraryId, ObjectType, Version),
    Deletions(LibraryId),
    Updates(LibraryId),
    Submit(WriteBatch),
    DeleteGroup(GroupId),
    LocalOnly(GroupId),
    Revert(LibraryId),
    Resolved(LibraryId),
}

/// Handler answering from scripted tables and recording every call.
///
/// Anything not scripted succeeds with an empty result.
#[derive(Default)]
pub struct ScriptedHandler {
    pub calls: Mutex<Vec<Call>>,
    pub group_ids: Mutex<Option<Result<Vec<GroupId>>>>,
    pub libraries: Mutex<Vec<LibraryData>>,
    pub versions: Mutex<HashMap<(LibraryId, ObjectType), Result<VersionDiff>>>,
    pub downloads: Mutex<HashMap<(LibraryId, ObjectType), Result<BatchSummary>>>,
    pub files_to_db: Mutex<HashMap<(LibraryId, ObjectType), Result<()>>>,
    pub deletions: Mutex<HashMap<LibraryId, Result<()>>>,
    pub updates: Mutex<HashMap<LibraryId, Vec<WriteBatch>>>,
    pub submit: Mutex<Option<Result<()>>>,
}

impl ScriptedHandler {
    pub fn with_libraries(libraries: Vec<LibraryData>) -> Self {
        let groups = libraries
            .iter()
            .filter_map(|data| data.library.group_id())
            .collect();
        let handler = Self::default();
        *handler.group_ids.lock().unwrap() = Some(Ok(groups));
        *handler.libraries.lock().unwrap() = libraries;
        handler
    }

    pub fn script_versions(
        &self,
        library: LibraryId,
        object_type: ObjectType,
        result: Result<VersionDiff>,
    ) {
        self.versions
            .lock()
            .unwrap()
            .insert((library, object_type), result);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|call| predicate(call)).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

pub fn diff(version: Version, keys: &[&str]) -> VersionDiff {
    VersionDiff {
        version,
        outdated_keys: keys.iter().map(ToString::to_string).collect(),
    }
}

pub fn library(library: LibraryId, name: &str) -> LibraryData {
    LibraryData::new(library, name)
}

#[async_trait]
impl SyncActionHandler for ScriptedHandler {
    async fn load_all_group_ids(&self) -> Result<Vec<GroupId>> {
        self.record(Call::GroupIds);
        self.group_ids
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn load_library_data(&self) -> Result<Vec<LibraryData>> {
        self.record(Call::LibraryData);
        Ok(self.libraries.lock().unwrap().clone())
    }

    async fn synchronize_versions(
        &self,
        library: LibraryId,
        object_type: ObjectType,
        sync_type: SyncType,
    ) -> Result<VersionDiff> {
        self.record(Call::Versions(library, object_type, sync_type));
        self.versions
            .lock()
            .unwrap()
            .get(&(library, object_type))
            .cloned()
            .unwrap_or_else(|| Ok(VersionDiff::default()))
    }

    async fn download_object_json(&self, batch: &DownloadBatch) -> Result<BatchSummary> {
        self.record(Call::Download(batch.clone()));
        self.downloads
            .lock()
            .unwrap()
            .get(&(batch.library, batch.object_type))
            .cloned()
            .unwrap_or_else(|| Ok(BatchSummary::default()))
    }

    async fn mark_for_resync(
        &self,
        library: LibraryId,
        object_type: ObjectType,
        keys: &[String],
    ) -> Result<()> {
        self.record(Call::MarkForResync(library, object_type, keys.to_vec()));
        Ok(())
    }

    async fn synchronize_db_with_fetched_files(
        &self,
        library: LibraryId,
        object_type: ObjectType,
        version: Version,
    ) -> Result<()> {
        self.record(Call::FilesToDb(library, object_type, version));
        self.files_to_db
            .lock()
            .unwrap()
            .get(&(library, object_type))
            .cloned()
            .unwrap_or(Ok(()))
    }

    async fn synchronize_deletions(&self, library: LibraryId) -> Result<()> {
        self.record(Call::Deletions(library));
        self.deletions
            .lock()
            .unwrap()
            .get(&library)
            .cloned()
            .unwrap_or(Ok(()))
    }

    async fn updates(&self, library: LibraryId, _versions: &Versions) -> Result<Vec<WriteBatch>> {
        self.record(Call::Updates(library));
        Ok(self
            .updates
            .lock()
            .unwrap()
            .get(&library)
            .cloned()
            .unwrap_or_default())
    }

    async fn submit_update(&self, batch: &WriteBatch) -> Result<()> {
        self.record(Call::Submit(batch.clone()));
        self.submit.lock().unwrap().clone().unwrap_or(Ok(()))
    }

    async fn delete_group(&self, group_id: GroupId) -> Result<()> {
        self.record(Call::DeleteGroup(group_id));
        Ok(())
    }

    async fn mark_group_as_local_only(&self, group_id: GroupId) -> Result<()> {
        self.record(Call::LocalOnly(group_id));
        Ok(())
    }

    async fn revert_library_updates(&self, library: LibraryId) -> Result<()> {
        self.record(Call::Revert(library));
        Ok(())
    }

    async fn mark_changes_as_resolved(&self, library: LibraryId) -> Result<()> {
        self.record(Call::Resolved(library));
        Ok(())
    }
}

/// A controller wired to `handler`, plus what tests need to observe it.
pub struct Harness {
    pub controller: SyncController,
    pub signals: mpsc::UnboundedReceiver<ControllerSignal>,
    pub prompts: mpsc::Receiver<ConflictPrompt>,
    pub event_bus: EventBus,
}

pub fn harness(handler: Arc<ScriptedHandler>) -> Harness {
    harness_with(handler, Arc::new(AllowAllPermissions), ControllerConfig::default())
}

pub fn harness_with(
    handler: Arc<ScriptedHandler>,
    permissions: Arc<dyn PermissionReceiver>,
    config: ControllerConfig,
) -> Harness {
    let event_bus = EventBus::new(256);
    let (receiver, prompts) = ChannelConflictReceiver::new(4);
    let resolver = ConflictResolver::new(Arc::new(receiver), None, event_bus.clone());
    let (controller, signals) = SyncController::new(
        handler,
        resolver,
        permissions,
        ProgressReporter::new(event_bus.clone()),
        config,
    );

    Harness {
        controller,
        signals,
        prompts,
        event_bus,
    }
}

impl Harness {
    /// Wait for the next completion report, skipping resync signals.
    pub async fn completed(&mut self) -> PassReport {
        let wait = async {
            loop {
                match self.signals.recv().await {
                    Some(ControllerSignal::Completed(report)) => return report,
                    Some(ControllerSignal::Resync(_)) => continue,
                    None => panic!("controller dropped"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(60), wait)
            .await
            .expect("pass did not complete")
    }
}

pub fn no_connection() -> SyncError {
    SyncError::NoConnection
}
