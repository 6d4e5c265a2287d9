//! # Progress Reporting
//!
//! Turns controller transitions into [`SyncProgress`] values. Every report is
//! published twice: on the [`EventBus`] as a [`SyncEvent`] for streaming
//! observers, and into a `watch` channel holding the latest state for
//! observers that attach mid-pass.

use crate::error::SyncError;
use crate::types::ObjectType;
use core_runtime::events::{CoreEvent, EventBus, ProgressCount, SyncEvent};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Current phase of a sync pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncProgress {
    Starting,
    Groups(Option<ProgressCount>),
    Library(String),
    Object {
        object_type: ObjectType,
        progress: Option<ProgressCount>,
        library_name: String,
    },
    Deletions(String),
    Changes(ProgressCount),
    Uploads(ProgressCount),
    Finished(Vec<SyncError>),
    Aborted(SyncError),
}

impl SyncProgress {
    fn to_event(&self, resync_scheduled: bool) -> SyncEvent {
        match self {
            SyncProgress::Starting => SyncEvent::Starting,
            SyncProgress::Groups(progress) => SyncEvent::Groups {
                progress: *progress,
            },
            SyncProgress::Library(name) => SyncEvent::Library { name: name.clone() },
            SyncProgress::Object {
                object_type,
                progress,
                library_name,
            } => SyncEvent::Object {
                object: object_type.as_str().to_string(),
                progress: *progress,
                library_name: library_name.clone(),
            },
            SyncProgress::Deletions(name) => SyncEvent::Deletions {
                library_name: name.clone(),
            },
            SyncProgress::Changes(progress) => SyncEvent::Changes {
                progress: *progress,
            },
            SyncProgress::Uploads(progress) => SyncEvent::Uploads {
                progress: *progress,
            },
            SyncProgress::Finished(errors) => SyncEvent::Finished {
                errors: errors.iter().map(ToString::to_string).collect(),
            },
            SyncProgress::Aborted(error) => SyncEvent::Aborted {
                message: error.to_string(),
                recoverable: resync_scheduled,
            },
        }
    }
}

/// Publishes sync progress. Cheap to clone.
#[derive(Clone)]
pub struct ProgressReporter {
    event_bus: EventBus,
    latest: Arc<watch::Sender<Option<SyncProgress>>>,
}

impl ProgressReporter {
    pub fn new(event_bus: EventBus) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            event_bus,
            latest: Arc::new(latest),
        }
    }

    /// The most recent state, `None` before the first pass.
    pub fn current(&self) -> Option<SyncProgress> {
        self.latest.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<SyncProgress>> {
        self.latest.subscribe()
    }

    fn publish(&self, progress: SyncProgress, resync_scheduled: bool) {
        debug!(?progress, "Sync progress");
        self.event_bus
            .emit(CoreEvent::Sync(progress.to_event(resync_scheduled)))
            .ok();
        self.latest.send_replace(Some(progress));
    }

    pub fn report_starting(&self) {
        self.publish(SyncProgress::Starting, false);
    }

    pub fn report_groups(&self, progress: Option<ProgressCount>) {
        self.publish(SyncProgress::Groups(progress), false);
    }

    pub fn report_library(&self, name: &str) {
        self.publish(SyncProgress::Library(name.to_string()), false);
    }

    pub fn report_object(
        &self,
        object_type: ObjectType,
        progress: Option<ProgressCount>,
        library_name: &str,
    ) {
        self.publish(
            SyncProgress::Object {
                object_type,
                progress,
                library_name: library_name.to_string(),
            },
            false,
        );
    }

    pub fn report_deletions(&self, library_name: &str) {
        self.publish(SyncProgress::Deletions(library_name.to_string()), false);
    }

    pub fn report_changes(&self, progress: ProgressCount) {
        self.publish(SyncProgress::Changes(progress), false);
    }

    pub fn report_finished(&self, errors: Vec<SyncError>) {
        self.publish(SyncProgress::Finished(errors), false);
    }

    pub fn report_aborted(&self, error: SyncError, resync_scheduled: bool) {
        self.publish(SyncProgress::Aborted(error), resync_scheduled);
    }
}
