//! Conflict Resolution for Sync Operations
//!
//! Some situations cannot be settled by the engine alone and need a user
//! decision before the pass may touch the affected library again.
//!
//! ## Overview
//!
//! - **Group removed**: a locally known group is no longer accessible. The
//!   user either deletes it locally or keeps it as a read-only local copy.
//! - **Write denied**: the user has unsynced changes in a group they can no
//!   longer write to. The changes are either reverted to the last remote
//!   state or kept and marked as resolved so they stop blocking sync.
//!
//! Each conflict offers exactly two resolutions. The controller suspends on
//! [`ConflictResolver::resolve`] and queues the chosen resolution.
//!
//! ## Usage
//!
//! ```ignore
//! use core_sync::conflict_resolver::{ChannelConflictReceiver, ConflictResolver};
//!
//! let (receiver, mut prompts) = ChannelConflictReceiver::new(8);
//! let resolver = ConflictResolver::new(Arc::new(receiver), None, event_bus.clone());
//!
//! // UI side
//! while let Some(prompt) = prompts.recv().await {
//!     let [first, _second] = prompt.options();
//!     prompt.respond(first);
//! }
//! ```

use crate::error::{Result, SyncError};
use crate::types::{GroupId, LibraryId};
use async_trait::async_trait;
use core_runtime::events::{ConflictEvent, CoreEvent, EventBus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, instrument, warn};

/// A situation that requires the user to choose between two outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conflict {
    GroupRemoved { group_id: GroupId, name: String },
    GroupWriteDenied { group_id: GroupId, name: String },
}

impl Conflict {
    pub fn group_id(&self) -> GroupId {
        match self {
            Conflict::GroupRemoved { group_id, .. } | Conflict::GroupWriteDenied { group_id, .. } => {
                *group_id
            }
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Conflict::GroupRemoved { name, .. } | Conflict::GroupWriteDenied { name, .. } => name,
        }
    }

    pub fn library(&self) -> LibraryId {
        LibraryId::Group(self.group_id())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Conflict::GroupRemoved { .. } => "group_removed",
            Conflict::GroupWriteDenied { .. } => "group_write_denied",
        }
    }

    /// The two resolutions the user may pick from.
    pub fn options(&self) -> [ConflictResolution; 2] {
        let group_id = self.group_id();
        match self {
            Conflict::GroupRemoved { .. } => [
                ConflictResolution::DeleteGroup(group_id),
                ConflictResolution::MarkGroupAsLocalOnly(group_id),
            ],
            Conflict::GroupWriteDenied { .. } => [
                ConflictResolution::RevertLibraryToOriginal(LibraryId::Group(group_id)),
                ConflictResolution::MarkChangesAsResolved(LibraryId::Group(group_id)),
            ],
        }
    }

    pub fn accepts(&self, resolution: &ConflictResolution) -> bool {
        self.options().contains(resolution)
    }
}

/// What to do about a [`Conflict`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    DeleteGroup(GroupId),
    MarkGroupAsLocalOnly(GroupId),
    /// Drop unsynced local changes and restore the last synced state.
    RevertLibraryToOriginal(LibraryId),
    /// Keep local changes but stop treating them as pending uploads.
    MarkChangesAsResolved(LibraryId),
}

impl ConflictResolution {
    pub fn library(&self) -> LibraryId {
        match self {
            ConflictResolution::DeleteGroup(id) | ConflictResolution::MarkGroupAsLocalOnly(id) => {
                LibraryId::Group(*id)
            }
            ConflictResolution::RevertLibraryToOriginal(library)
            | ConflictResolution::MarkChangesAsResolved(library) => *library,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictResolution::DeleteGroup(_) => "delete_group",
            ConflictResolution::MarkGroupAsLocalOnly(_) => "mark_group_as_local_only",
            ConflictResolution::RevertLibraryToOriginal(_) => "revert_library_to_original",
            ConflictResolution::MarkChangesAsResolved(_) => "mark_changes_as_resolved",
        }
    }
}

/// Answer to a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionResponse {
    Allowed,
    /// Skip only the action that asked.
    SkipAction,
    /// Stop the whole pass.
    CancelSync,
}

/// Host side of conflict arbitration, typically backed by a dialog.
#[async_trait]
pub trait ConflictReceiver: Send + Sync {
    /// Ask the user how to resolve `conflict`. May wait indefinitely.
    async fn resolve(&self, conflict: Conflict) -> Result<ConflictResolution>;
}

/// Host side of permission prompts.
#[async_trait]
pub trait PermissionReceiver: Send + Sync {
    /// Ask whether an action described by `message` may proceed.
    async fn ask_for_permission(&self, message: &str) -> PermissionResponse;

    /// Ask whether a missing remote file storage directory should be created.
    ///
    /// Hosts without a custom file storage backend can keep the default.
    async fn ask_to_create_remote_directory(&self, _url: &str) -> bool {
        false
    }
}

/// Permission receiver that allows everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllPermissions;

#[async_trait]
impl PermissionReceiver for AllowAllPermissions {
    async fn ask_for_permission(&self, _message: &str) -> PermissionResponse {
        PermissionResponse::Allowed
    }
}

// ============================================================================
// Resolver
// ============================================================================

/// Presents conflicts to a [`ConflictReceiver`] and validates the answer.
#[derive(Clone)]
pub struct ConflictResolver {
    receiver: Arc<dyn ConflictReceiver>,
    timeout: Option<Duration>,
    event_bus: EventBus,
}

impl ConflictResolver {
    /// `timeout` of `None` waits for the user as long as it takes.
    pub fn new(
        receiver: Arc<dyn ConflictReceiver>,
        timeout: Option<Duration>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            receiver,
            timeout,
            event_bus,
        }
    }

    #[instrument(skip(self), fields(group_id = conflict.group_id(), kind = conflict.kind()))]
    pub async fn resolve(&self, conflict: Conflict) -> Result<ConflictResolution> {
        self.event_bus
            .emit(CoreEvent::Conflict(ConflictEvent::Presented {
                kind: conflict.kind().to_string(),
                group_id: conflict.group_id(),
                group_name: conflict.name().to_string(),
            }))
            .ok();

        let pending = self.receiver.resolve(conflict.clone());
        let resolution = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, pending).await.map_err(|_| {
                warn!(?timeout, "Conflict prompt timed out");
                SyncError::ConflictUnresolved {
                    group_id: conflict.group_id(),
                    reason: format!("no answer within {:?}", timeout),
                }
            })??,
            None => pending.await?,
        };

        if !conflict.accepts(&resolution) {
            return Err(SyncError::ConflictUnresolved {
                group_id: conflict.group_id(),
                reason: format!(
                    "{} is not a valid answer to {}",
                    resolution.as_str(),
                    conflict.kind()
                ),
            });
        }

        info!(resolution = resolution.as_str(), "Conflict resolved");
        self.event_bus
            .emit(CoreEvent::Conflict(ConflictEvent::Resolved {
                kind: conflict.kind().to_string(),
                group_id: conflict.group_id(),
                resolution: resolution.as_str().to_string(),
            }))
            .ok();

        Ok(resolution)
    }
}

// ============================================================================
// Channel Receiver
// ============================================================================

/// A conflict waiting for an answer from the UI.
#[derive(Debug)]
pub struct ConflictPrompt {
    pub conflict: Conflict,
    responder: oneshot::Sender<ConflictResolution>,
}

impl ConflictPrompt {
    pub fn options(&self) -> [ConflictResolution; 2] {
        self.conflict.options()
    }

    /// Send the answer back. Returns `false` if the pass no longer waits.
    pub fn respond(self, resolution: ConflictResolution) -> bool {
        self.responder.send(resolution).is_ok()
    }
}

/// [`ConflictReceiver`] that forwards prompts over an `mpsc` channel.
#[derive(Clone)]
pub struct ChannelConflictReceiver {
    sender: mpsc::Sender<ConflictPrompt>,
}

impl ChannelConflictReceiver {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<ConflictPrompt>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl ConflictReceiver for ChannelConflictReceiver {
    async fn resolve(&self, conflict: Conflict) -> Result<ConflictResolution> {
        let group_id = conflict.group_id();
        let (responder, answer) = oneshot::channel();

        self.sender
            .send(ConflictPrompt {
                conflict,
                responder,
            })
            .await
            .map_err(|_| SyncError::ConflictUnresolved {
                group_id,
                reason: "no prompt listener".to_string(),
            })?;

        answer.await.map_err(|_| SyncError::ConflictUnresolved {
            group_id,
            reason: "prompt dismissed".to_string(),
        })
    }
}
