//! # Sync Controller
//!
//! Runs one sync pass at a time by draining an ordered queue of
//! [`QueueAction`]s.
//!
//! ## Overview
//!
//! A pass starts with `SyncVersions(user, group)`. Each action is popped,
//! executed against the [`SyncActionHandler`] and may insert follow-up
//! actions:
//!
//! ```text
//! SyncVersions(user, group) ─> SyncObject(group)* ─> SyncAllGroups
//!   └─ per library: SyncVersions(collection|search|item|trash)
//!                     └─ SyncObject* ─> SyncFilesToDb   (inserted at the front)
//!                   SyncDeletions ─> PushChanges ─> SubmitWriteBatch*
//! ```
//!
//! ## Failure handling
//!
//! Every failure goes through [`SyncError::class`]:
//!
//! - **Fatal**: the pass is aborted, the queue discarded and a full resync is
//!   requested after `resync_delay`.
//! - **Library**: the error is recorded and the library's remaining actions
//!   are dropped.
//! - **Key subset / object**: keys are marked for resync and the pass goes on.
//!
//! Recorded errors are reported once, when the pass finishes. A pass that
//! marked anything for resync requests an `IgnoreIndividualDelays` pass over
//! the same scope after `resync_delay`.
//!
//! ## Concurrency
//!
//! Queue, flags and error list live in one `Mutex<Option<PassState>>`; the
//! lock is never held across a handler call. Every write checks the pass id,
//! so a drain task outliving a cancelled pass cannot touch the next one.

use crate::actions::{download_actions, DownloadBatch, QueueAction, WriteBatch};
use crate::batch_processor::WriteConflict;
use crate::conflict_resolver::{
    Conflict, ConflictResolution, ConflictResolver, PermissionReceiver, PermissionResponse,
};
use crate::error::{ErrorClass, Result, SyncError};
use crate::handler::{LibraryData, SyncActionHandler};
use crate::progress::ProgressReporter;
use crate::types::{
    GroupId, LibraryId, LibraryScope, ObjectType, SyncPassId, SyncType, Version,
};
use core_runtime::config::SyncSettings;
use core_runtime::events::ProgressCount;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Keys per `SyncObject` action
    pub batch_size: usize,

    /// Delay before a resync is requested
    pub resync_delay: Duration,

    /// Ask the permission receiver before every write batch
    pub confirm_writes: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::from(&SyncSettings::default())
    }
}

impl From<&SyncSettings> for ControllerConfig {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            batch_size: settings.batch_size,
            resync_delay: settings.resync_delay,
            confirm_writes: settings.confirm_writes,
        }
    }
}

/// How a pass ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Queue drained; carries the non-fatal errors collected on the way.
    Finished(Vec<SyncError>),
    Aborted(SyncError),
    Cancelled,
}

/// A pass the controller wants the scheduler to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResyncRequest {
    pub sync_type: SyncType,
    pub scope: LibraryScope,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub pass_id: SyncPassId,
    pub sync_type: SyncType,
    pub outcome: PassOutcome,
    /// Resync that will be signalled once the resync delay elapses.
    pub resync: Option<ResyncRequest>,
}

/// Messages from the controller to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerSignal {
    /// Sent once per pass, as soon as it ends.
    Completed(PassReport),
    /// Sent after the resync delay unless cancelled in between.
    Resync(ResyncRequest),
}

// ============================================================================
// Pass State
// ============================================================================

#[derive(Clone)]
struct PassContext {
    id: SyncPassId,
    sync_type: SyncType,
    scope: LibraryScope,
}

struct ObjectProgress {
    library: LibraryId,
    object_type: ObjectType,
    done: u64,
    total: u64,
}

struct PassState {
    id: SyncPassId,
    sync_type: SyncType,
    scope: LibraryScope,
    queue: VecDeque<QueueAction>,
    in_flight: Option<&'static str>,
    needs_resync: bool,
    errors: Vec<SyncError>,
    libraries: HashMap<LibraryId, LibraryData>,
    current_library: Option<LibraryId>,
    object_progress: Option<ObjectProgress>,
    changes: ProgressCount,
    cancel: CancellationToken,
}

impl PassState {
    fn new(sync_type: SyncType, scope: LibraryScope) -> Self {
        let mut queue = VecDeque::new();
        queue.push_back(QueueAction::SyncVersions {
            library: LibraryId::User,
            object_type: ObjectType::Group,
        });

        Self {
            id: SyncPassId::new(),
            sync_type,
            scope,
            queue,
            in_flight: None,
            needs_resync: false,
            errors: Vec::new(),
            libraries: HashMap::new(),
            current_library: None,
            object_progress: None,
            changes: ProgressCount::new(0, 0),
            cancel: CancellationToken::new(),
        }
    }

    fn context(&self) -> PassContext {
        PassContext {
            id: self.id,
            sync_type: self.sync_type,
            scope: self.scope.clone(),
        }
    }

    /// Insert `actions` at the front, keeping their relative order.
    fn push_front_all(&mut self, actions: impl IntoIterator<Item = QueueAction>) {
        let actions: Vec<QueueAction> = actions.into_iter().collect();
        for action in actions.into_iter().rev() {
            self.queue.push_front(action);
        }
    }

    fn drop_library(&mut self, library: LibraryId) -> usize {
        let before = self.queue.len();
        self.queue.retain(|action| action.library() != Some(library));
        before - self.queue.len()
    }

    fn library_name(&self, library: LibraryId) -> String {
        self.libraries
            .get(&library)
            .map(|data| data.name.clone())
            .unwrap_or_else(|| library.to_string())
    }

    fn advance_object(
        &mut self,
        library: LibraryId,
        object_type: ObjectType,
        count: usize,
    ) -> Option<ProgressCount> {
        let progress = self
            .object_progress
            .as_mut()
            .filter(|p| p.library == library && p.object_type == object_type)?;
        progress.done = (progress.done + count as u64).min(progress.total);
        Some(ProgressCount::new(progress.done, progress.total))
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Queue-driven sync state machine. Cheap to clone; clones share one pass.
#[derive(Clone)]
pub struct SyncController {
    handler: Arc<dyn SyncActionHandler>,
    resolver: ConflictResolver,
    permissions: Arc<dyn PermissionReceiver>,
    progress: ProgressReporter,
    config: ControllerConfig,
    state: Arc<Mutex<Option<PassState>>>,
    resync_guard: Arc<Mutex<CancellationToken>>,
    signals: mpsc::UnboundedSender<ControllerSignal>,
}

impl SyncController {
    /// Create a controller and the receiver for its completion and resync
    /// signals.
    pub fn new(
        handler: Arc<dyn SyncActionHandler>,
        resolver: ConflictResolver,
        permissions: Arc<dyn PermissionReceiver>,
        progress: ProgressReporter,
        config: ControllerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ControllerSignal>) {
        let (signals, receiver) = mpsc::unbounded_channel();
        let controller = Self {
            handler,
            resolver,
            permissions,
            progress,
            config,
            state: Arc::new(Mutex::new(None)),
            resync_guard: Arc::new(Mutex::new(CancellationToken::new())),
            signals,
        };
        (controller, receiver)
    }

    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }

    pub async fn is_syncing(&self) -> bool {
        self.state.lock().await.is_some()
    }

    /// Name of the action currently being processed, if any.
    pub async fn current_action(&self) -> Option<&'static str> {
        self.state.lock().await.as_ref().and_then(|pass| pass.in_flight)
    }

    /// Start a pass in the background.
    ///
    /// # Returns
    ///
    /// The id of the new pass. Its end is announced with
    /// [`ControllerSignal::Completed`].
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SyncInProgress`] if a pass is already running; the
    /// request is ignored in that case.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let pass_id = controller.start(SyncType::Normal, LibraryScope::All).await?;
    /// ```
    #[instrument(skip(self))]
    pub async fn start(&self, sync_type: SyncType, scope: LibraryScope) -> Result<SyncPassId> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            debug!("Start ignored, a pass is already running");
            return Err(SyncError::SyncInProgress);
        }

        let pass = PassState::new(sync_type, scope);
        let pass_id = pass.id;
        let cancel = pass.cancel.clone();
        *state = Some(pass);
        drop(state);

        info!(%pass_id, %sync_type, "Sync pass started");
        self.progress.report_starting();
        tokio::spawn(self.clone().drain(pass_id, cancel));

        Ok(pass_id)
    }

    /// Stop the running pass, discard its queue and every scheduled resync.
    ///
    /// Returns `false` if no pass was running.
    pub async fn cancel(&self) -> bool {
        self.cancel_pass(None).await
    }

    async fn cancel_pass(&self, pass_id: Option<SyncPassId>) -> bool {
        {
            let mut guard = self.resync_guard.lock().await;
            guard.cancel();
            *guard = CancellationToken::new();
        }

        let pass = {
            let mut state = self.state.lock().await;
            match pass_id {
                Some(id) if state.as_ref().map(|p| p.id) != Some(id) => None,
                _ => state.take(),
            }
        };
        let Some(pass) = pass else {
            return false;
        };

        pass.cancel.cancel();
        info!(
            pass_id = %pass.id,
            discarded = pass.queue.len(),
            "Sync pass cancelled"
        );
        self.progress.report_aborted(SyncError::Cancelled, false);
        self.signals
            .send(ControllerSignal::Completed(PassReport {
                pass_id: pass.id,
                sync_type: pass.sync_type,
                outcome: PassOutcome::Cancelled,
                resync: None,
            }))
            .ok();
        true
    }

    async fn drain(self, pass_id: SyncPassId, cancel: CancellationToken) {
        loop {
            let next = {
                let mut state = self.state.lock().await;
                match state.as_mut() {
                    Some(pass) if pass.id == pass_id => {
                        let action = pass.queue.pop_front();
                        pass.in_flight = action.as_ref().map(QueueAction::name);
                        action.map(|action| (action, pass.context()))
                    }
                    _ => return,
                }
            };
            let Some((action, ctx)) = next else {
                break;
            };

            debug!(
                %pass_id,
                action = action.name(),
                library = ?action.library(),
                "Processing action"
            );

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return,
                outcome = self.process(&ctx, action) => outcome,
            };

            if let Err(error) = outcome {
                self.abort(pass_id, error).await;
                return;
            }
        }

        self.finish(pass_id).await;
    }

    async fn process(&self, ctx: &PassContext, action: QueueAction) -> Result<()> {
        match action {
            QueueAction::SyncAllGroups => self.sync_all_groups(ctx).await,
            QueueAction::SyncVersions {
                library,
                object_type,
            } => self.sync_versions(ctx, library, object_type).await,
            QueueAction::SyncObject(batch) => self.sync_object(ctx, batch).await,
            QueueAction::SyncFilesToDb {
                library,
                object_type,
                version,
            } => {
                self.sync_files_to_db(ctx, library, object_type, version)
                    .await
            }
            QueueAction::SyncDeletions { library } => self.sync_deletions(ctx, library).await,
            QueueAction::PushChanges { library } => self.push_changes(ctx, library).await,
            QueueAction::SubmitWriteBatch(batch) => self.submit_write_batch(ctx, batch).await,
            QueueAction::ResolveConflict(conflict) => self.resolve_conflict(ctx, conflict).await,
            QueueAction::ApplyResolution(resolution) => {
                self.apply_resolution(ctx, resolution).await
            }
        }
    }

    // ------------------------------------------------------------------------
    // State helpers
    // ------------------------------------------------------------------------

    /// Run `f` on the pass if it is still the current one.
    async fn with_pass<R>(
        &self,
        pass_id: SyncPassId,
        f: impl FnOnce(&mut PassState) -> R,
    ) -> Option<R> {
        let mut state = self.state.lock().await;
        state.as_mut().filter(|pass| pass.id == pass_id).map(f)
    }

    async fn take_pass(&self, pass_id: SyncPassId) -> Option<PassState> {
        let mut state = self.state.lock().await;
        if state.as_ref().map(|pass| pass.id) == Some(pass_id) {
            state.take()
        } else {
            None
        }
    }

    async fn record(&self, ctx: &PassContext, error: SyncError) {
        self.with_pass(ctx.id, |pass| pass.errors.push(error)).await;
    }

    /// Report the library once when its first action starts.
    async fn enter_library(&self, ctx: &PassContext, library: LibraryId) -> String {
        let entered = self
            .with_pass(ctx.id, |pass| {
                let changed = pass.current_library.replace(library) != Some(library);
                (pass.library_name(library), changed)
            })
            .await;

        match entered {
            Some((name, true)) => {
                self.progress.report_library(&name);
                name
            }
            Some((name, false)) => name,
            None => library.to_string(),
        }
    }

    /// Abort on fatal errors; otherwise record the error and drop the
    /// library's remaining actions.
    async fn skip_library(
        &self,
        ctx: &PassContext,
        library: LibraryId,
        error: SyncError,
    ) -> Result<()> {
        if error.is_fatal() {
            return Err(error);
        }

        let dropped = self
            .with_pass(ctx.id, |pass| {
                let dropped = pass.drop_library(library);
                pass.errors.push(error.clone());
                dropped
            })
            .await;
        warn!(
            pass_id = %ctx.id,
            %library,
            dropped = dropped.unwrap_or_default(),
            error = %error,
            "Skipping remaining actions of library"
        );
        Ok(())
    }

    async fn mark_for_resync(
        &self,
        ctx: &PassContext,
        library: LibraryId,
        object_type: ObjectType,
        keys: &[String],
    ) -> Result<()> {
        match self.handler.mark_for_resync(library, object_type, keys).await {
            Ok(()) => {}
            Err(error) if error.is_fatal() => return Err(error),
            Err(error) => {
                warn!(%library, %object_type, error = %error, "Failed to mark objects for resync");
                self.record(ctx, error).await;
            }
        }

        self.with_pass(ctx.id, |pass| pass.needs_resync = true).await;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Actions
    // ------------------------------------------------------------------------

    #[instrument(skip(self, ctx), fields(pass_id = %ctx.id))]
    async fn sync_all_groups(&self, ctx: &PassContext) -> Result<()> {
        let group_ids = match self.handler.load_all_group_ids().await {
            Ok(ids) => Some(ids),
            Err(error) if error.is_fatal() => return Err(error),
            Err(error) => {
                warn!(error = %error, "Group list unavailable, syncing the user library only");
                self.record(ctx, error).await;
                None
            }
        };

        let known = match self.handler.load_library_data().await {
            Ok(data) => data,
            Err(error) if error.is_fatal() => return Err(error),
            Err(error) => {
                warn!(error = %error, "Local library data unavailable");
                self.record(ctx, error).await;
                Vec::new()
            }
        };
        let known: HashMap<LibraryId, LibraryData> =
            known.into_iter().map(|data| (data.library, data)).collect();

        let mut conflicts = Vec::new();
        if let Some(ids) = &group_ids {
            let remote: HashSet<GroupId> = ids.iter().copied().collect();
            let mut removed: Vec<&LibraryData> = known
                .values()
                .filter(|data| !data.local_only && ctx.scope.contains(&data.library))
                .filter(|data| matches!(data.library.group_id(), Some(id) if !remote.contains(&id)))
                .collect();
            removed.sort_by_key(|data| data.library);

            for data in removed {
                if let Some(group_id) = data.library.group_id() {
                    info!(group_id, name = %data.name, "Group no longer accessible");
                    conflicts.push(QueueAction::ResolveConflict(Conflict::GroupRemoved {
                        group_id,
                        name: data.name.clone(),
                    }));
                }
            }
        }

        let libraries: Vec<LibraryId> = std::iter::once(LibraryId::User)
            .chain(group_ids.unwrap_or_default().into_iter().map(LibraryId::Group))
            .filter(|library| ctx.scope.contains(library))
            .filter(|library| !known.get(library).map_or(false, |data| data.local_only))
            .collect();

        let mut actions = conflicts;
        for library in &libraries {
            if ctx.sync_type == SyncType::CollectionsOnly {
                actions.push(QueueAction::SyncVersions {
                    library: *library,
                    object_type: ObjectType::Collection,
                });
                continue;
            }

            actions.extend(ObjectType::DOWNLOAD_ORDER.iter().map(|object_type| {
                QueueAction::SyncVersions {
                    library: *library,
                    object_type: *object_type,
                }
            }));
            actions.push(QueueAction::SyncDeletions { library: *library });
            actions.push(QueueAction::PushChanges { library: *library });
        }

        info!(
            libraries = libraries.len(),
            actions = actions.len(),
            "Library actions queued"
        );
        self.with_pass(ctx.id, |pass| {
            pass.libraries = known;
            pass.queue.extend(actions);
        })
        .await;

        Ok(())
    }

    #[instrument(skip(self, ctx), fields(pass_id = %ctx.id))]
    async fn sync_versions(
        &self,
        ctx: &PassContext,
        library: LibraryId,
        object_type: ObjectType,
    ) -> Result<()> {
        if object_type == ObjectType::Group {
            self.progress.report_groups(None);
        } else {
            let name = self.enter_library(ctx, library).await;
            self.progress.report_object(object_type, None, &name);
        }

        match self
            .handler
            .synchronize_versions(library, object_type, ctx.sync_type)
            .await
        {
            Ok(diff) => {
                debug!(
                    version = diff.version,
                    outdated = diff.outdated_keys.len(),
                    "Versions synchronized"
                );
                let total = diff.outdated_keys.len() as u64;
                let actions = download_actions(
                    library,
                    object_type,
                    diff.version,
                    diff.outdated_keys,
                    self.config.batch_size,
                );
                self.with_pass(ctx.id, |pass| {
                    pass.object_progress = Some(ObjectProgress {
                        library,
                        object_type,
                        done: 0,
                        total,
                    });
                    pass.push_front_all(actions);
                })
                .await;
                Ok(())
            }
            Err(error) if error.is_fatal() => Err(error),
            Err(error) if object_type == ObjectType::Group => {
                warn!(error = %error, "Group versions unavailable");
                self.with_pass(ctx.id, |pass| {
                    pass.errors.push(error);
                    pass.queue.push_front(QueueAction::SyncAllGroups);
                })
                .await;
                Ok(())
            }
            Err(error) => self.skip_library(ctx, library, error).await,
        }
    }

    #[instrument(
        skip(self, ctx, batch),
        fields(pass_id = %ctx.id, library = %batch.library, object_type = %batch.object_type, keys = batch.keys.len())
    )]
    async fn sync_object(&self, ctx: &PassContext, batch: DownloadBatch) -> Result<()> {
        match self.handler.download_object_json(&batch).await {
            Ok(summary) => {
                if !summary.failed_keys.is_empty() {
                    warn!(failed = summary.failed_keys.len(), "Objects failed to download");
                    self.mark_for_resync(ctx, batch.library, batch.object_type, &summary.failed_keys)
                        .await?;
                }

                let reported = self
                    .with_pass(ctx.id, |pass| {
                        pass.errors.extend(summary.parsing_errors);
                        pass.errors.extend(
                            summary
                                .conflicts
                                .into_iter()
                                .map(WriteConflict::into_error),
                        );
                        let progress =
                            pass.advance_object(batch.library, batch.object_type, batch.keys.len());
                        (progress, pass.library_name(batch.library))
                    })
                    .await;

                if let Some((progress, name)) = reported {
                    if batch.object_type == ObjectType::Group {
                        self.progress.report_groups(progress);
                    } else {
                        self.progress.report_object(batch.object_type, progress, &name);
                    }
                }
                Ok(())
            }
            Err(error) if error.is_fatal() => Err(error),
            Err(error) => {
                warn!(error = %error, "Batch download failed, keys marked for resync");
                self.mark_for_resync(ctx, batch.library, batch.object_type, &batch.keys)
                    .await?;
                self.record(ctx, error).await;
                Ok(())
            }
        }
    }

    #[instrument(skip(self, ctx), fields(pass_id = %ctx.id))]
    async fn sync_files_to_db(
        &self,
        ctx: &PassContext,
        library: LibraryId,
        object_type: ObjectType,
        version: Version,
    ) -> Result<()> {
        let error = match self
            .handler
            .synchronize_db_with_fetched_files(library, object_type, version)
            .await
        {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };

        match error.class() {
            ErrorClass::Fatal => Err(error),
            ErrorClass::KeySubset(keys) => {
                warn!(failed = keys.len(), "Some objects could not be stored");
                self.mark_for_resync(ctx, library, object_type, &keys).await?;
                self.record(ctx, error).await;
                Ok(())
            }
            ErrorClass::Library | ErrorClass::Object => {
                self.skip_library(ctx, library, error).await
            }
        }
    }

    #[instrument(skip(self, ctx), fields(pass_id = %ctx.id))]
    async fn sync_deletions(&self, ctx: &PassContext, library: LibraryId) -> Result<()> {
        let name = self.enter_library(ctx, library).await;
        self.progress.report_deletions(&name);

        match self.handler.synchronize_deletions(library).await {
            Ok(()) => Ok(()),
            Err(error) => self.skip_library(ctx, library, error).await,
        }
    }

    #[instrument(skip(self, ctx), fields(pass_id = %ctx.id))]
    async fn push_changes(&self, ctx: &PassContext, library: LibraryId) -> Result<()> {
        // Downloads of this pass moved the versions; reload before writing
        let fresh = match self.handler.load_library_data().await {
            Ok(all) => all.into_iter().find(|data| data.library == library),
            Err(error) => return self.skip_library(ctx, library, error).await,
        };
        let data = match fresh {
            Some(data) => data,
            None => self
                .with_pass(ctx.id, |pass| pass.libraries.get(&library).cloned())
                .await
                .flatten()
                .unwrap_or_else(|| LibraryData::new(library, library.to_string())),
        };

        let batches = match self.handler.updates(library, &data.versions).await {
            Ok(batches) => batches,
            Err(error) => return self.skip_library(ctx, library, error).await,
        };
        if batches.is_empty() {
            debug!("No local changes");
            return Ok(());
        }

        if !data.can_write {
            match library {
                LibraryId::Group(group_id) => {
                    info!(group_id, "Local changes in a group without write access");
                    self.with_pass(ctx.id, |pass| {
                        pass.queue
                            .push_front(QueueAction::ResolveConflict(Conflict::GroupWriteDenied {
                                group_id,
                                name: data.name.clone(),
                            }));
                    })
                    .await;
                }
                LibraryId::User => warn!("User library is read-only, local changes kept"),
            }
            return Ok(());
        }

        let objects: u64 = batches.iter().map(|batch| batch.len() as u64).sum();
        info!(batches = batches.len(), objects, "Queueing local changes");
        self.with_pass(ctx.id, |pass| {
            pass.libraries.insert(library, data);
            pass.changes = ProgressCount::new(pass.changes.done, pass.changes.total + objects);
            pass.push_front_all(batches.into_iter().map(QueueAction::SubmitWriteBatch));
        })
        .await;

        Ok(())
    }

    #[instrument(
        skip(self, ctx, batch),
        fields(pass_id = %ctx.id, library = %batch.library, object_type = %batch.object_type, objects = batch.len())
    )]
    async fn submit_write_batch(&self, ctx: &PassContext, batch: WriteBatch) -> Result<()> {
        if self.config.confirm_writes {
            let name = self
                .with_pass(ctx.id, |pass| pass.library_name(batch.library))
                .await
                .unwrap_or_else(|| batch.library.to_string());
            let message = format!(
                "Upload {} changed {} objects to {}?",
                batch.len(),
                batch.object_type,
                name
            );

            match self.permissions.ask_for_permission(&message).await {
                PermissionResponse::Allowed => {}
                PermissionResponse::SkipAction => {
                    info!("Write batch skipped by user");
                    return Ok(());
                }
                PermissionResponse::CancelSync => {
                    info!("Sync cancelled by user");
                    self.cancel_pass(Some(ctx.id)).await;
                    return Ok(());
                }
            }
        }

        let result = self.handler.submit_update(&batch).await;

        let progress = self
            .with_pass(ctx.id, |pass| {
                pass.changes.done = (pass.changes.done + batch.len() as u64).min(pass.changes.total);
                pass.changes
            })
            .await;
        if let Some(progress) = progress {
            self.progress.report_changes(progress);
        }

        match result {
            Ok(()) => Ok(()),
            Err(error) if error.is_fatal() => Err(error),
            Err(error) => {
                warn!(error = %error, "Write batch failed");
                self.with_pass(ctx.id, |pass| {
                    pass.errors.push(error);
                    pass.needs_resync = true;
                })
                .await;
                Ok(())
            }
        }
    }

    #[instrument(skip(self, ctx), fields(pass_id = %ctx.id))]
    async fn resolve_conflict(&self, ctx: &PassContext, conflict: Conflict) -> Result<()> {
        let library = conflict.library();
        match self.resolver.resolve(conflict).await {
            Ok(resolution) => {
                self.with_pass(ctx.id, |pass| {
                    pass.queue
                        .push_front(QueueAction::ApplyResolution(resolution));
                })
                .await;
                Ok(())
            }
            Err(error) => self.skip_library(ctx, library, error).await,
        }
    }

    #[instrument(skip(self, ctx), fields(pass_id = %ctx.id))]
    async fn apply_resolution(
        &self,
        ctx: &PassContext,
        resolution: ConflictResolution,
    ) -> Result<()> {
        let library = resolution.library();
        let (result, ends_library) = match resolution {
            ConflictResolution::DeleteGroup(group_id) => {
                (self.handler.delete_group(group_id).await, true)
            }
            ConflictResolution::MarkGroupAsLocalOnly(group_id) => {
                (self.handler.mark_group_as_local_only(group_id).await, true)
            }
            ConflictResolution::RevertLibraryToOriginal(library) => {
                (self.handler.revert_library_updates(library).await, false)
            }
            ConflictResolution::MarkChangesAsResolved(library) => {
                (self.handler.mark_changes_as_resolved(library).await, false)
            }
        };

        match result {
            Ok(()) => {
                info!(resolution = resolution.as_str(), %library, "Resolution applied");
                if ends_library {
                    self.with_pass(ctx.id, |pass| pass.drop_library(library))
                        .await;
                }
                Ok(())
            }
            Err(error) => self.skip_library(ctx, library, error).await,
        }
    }

    // ------------------------------------------------------------------------
    // Pass end
    // ------------------------------------------------------------------------

    async fn finish(&self, pass_id: SyncPassId) {
        let Some(pass) = self.take_pass(pass_id).await else {
            return;
        };

        let resync = pass.needs_resync.then(|| ResyncRequest {
            sync_type: SyncType::IgnoreIndividualDelays,
            scope: pass.scope.clone(),
        });
        info!(
            %pass_id,
            errors = pass.errors.len(),
            resync = resync.is_some(),
            "Sync pass finished"
        );

        self.progress.report_finished(pass.errors.clone());
        self.complete(PassReport {
            pass_id,
            sync_type: pass.sync_type,
            outcome: PassOutcome::Finished(pass.errors),
            resync,
        })
        .await;
    }

    async fn abort(&self, pass_id: SyncPassId, error: SyncError) {
        let Some(pass) = self.take_pass(pass_id).await else {
            return;
        };
        pass.cancel.cancel();

        error!(
            %pass_id,
            error = %error,
            discarded = pass.queue.len(),
            "Sync pass aborted"
        );
        self.progress.report_aborted(error.clone(), true);
        self.complete(PassReport {
            pass_id,
            sync_type: pass.sync_type,
            outcome: PassOutcome::Aborted(error),
            resync: Some(ResyncRequest {
                sync_type: SyncType::Full,
                scope: LibraryScope::All,
            }),
        })
        .await;
    }

    async fn complete(&self, report: PassReport) {
        if let Some(resync) = report.resync.clone() {
            self.schedule_resync(resync).await;
        }
        self.signals.send(ControllerSignal::Completed(report)).ok();
    }

    async fn schedule_resync(&self, request: ResyncRequest) {
        let guard = self.resync_guard.lock().await.clone();
        let signals = self.signals.clone();
        let delay = self.config.resync_delay;

        debug!(?delay, sync_type = %request.sync_type, "Resync scheduled");
        tokio::spawn(async move {
            tokio::select! {
                _ = guard.cancelled() => debug!("Scheduled resync cancelled"),
                _ = tokio::time::sleep(delay) => {
                    signals.send(ControllerSignal::Resync(request)).ok();
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn versions(library: LibraryId, object_type: ObjectType) -> QueueAction {
        QueueAction::SyncVersions {
            library,
            object_type,
        }
    }

    #[test]
    fn test_new_pass_starts_with_group_versions() {
        let pass = PassState::new(SyncType::Normal, LibraryScope::All);
        assert_eq!(
            pass.queue.iter().cloned().collect::<Vec<_>>(),
            vec![versions(LibraryId::User, ObjectType::Group)]
        );
        assert!(!pass.needs_resync);
    }

    #[test]
    fn test_push_front_all_keeps_order() {
        let mut pass = PassState::new(SyncType::Normal, LibraryScope::All);
        pass.queue.clear();
        pass.queue.push_back(versions(LibraryId::User, ObjectType::Search));

        pass.push_front_all(download_actions(
            LibraryId::User,
            ObjectType::Collection,
            5,
            (0..60).map(|i| format!("K{}", i)).collect(),
            50,
        ));

        let names: Vec<&str> = pass.queue.iter().map(QueueAction::name).collect();
        assert_eq!(
            names,
            vec!["sync_object", "sync_object", "sync_files_to_db", "sync_versions"]
        );
    }

    #[test]
    fn test_drop_library_keeps_other_libraries() {
        let mut pass = PassState::new(SyncType::Normal, LibraryScope::All);
        pass.queue.clear();
        pass.queue.extend([
            versions(LibraryId::Group(1), ObjectType::Item),
            versions(LibraryId::Group(2), ObjectType::Item),
            QueueAction::SyncDeletions {
                library: LibraryId::Group(1),
            },
            QueueAction::SyncAllGroups,
        ]);

        assert_eq!(pass.drop_library(LibraryId::Group(1)), 2);
        assert_eq!(
            pass.queue.iter().cloned().collect::<Vec<_>>(),
            vec![
                versions(LibraryId::Group(2), ObjectType::Item),
                QueueAction::SyncAllGroups
            ]
        );
    }

    #[test]
    fn test_object_progress_is_clamped() {
        let mut pass = PassState::new(SyncType::Normal, LibraryScope::All);
        pass.object_progress = Some(ObjectProgress {
            library: LibraryId::User,
            object_type: ObjectType::Item,
            done: 0,
            total: 70,
        });

        assert_eq!(
            pass.advance_object(LibraryId::User, ObjectType::Item, 50),
            Some(ProgressCount::new(50, 70))
        );
        assert_eq!(
            pass.advance_object(LibraryId::User, ObjectType::Item, 50),
            Some(ProgressCount::new(70, 70))
        );
        assert_eq!(pass.advance_object(LibraryId::User, ObjectType::Trash, 1), None);
    }

    #[test]
    fn test_config_from_settings() {
        let settings = SyncSettings::default()
            .with_batch_size(20)
            .with_write_confirmation(true);
        let config = ControllerConfig::from(&settings);
        assert_eq!(config.batch_size, 20);
        assert!(config.confirm_writes);
        assert_eq!(config.resync_delay, Duration::from_secs(15));
    }
}
