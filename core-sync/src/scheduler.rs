//! # Sync Scheduler
//!
//! Public entry point for sync requests.
//!
//! ## Overview
//!
//! The scheduler holds at most one pending and one in-progress request.
//! Requests arriving while another one is pending are merged into it:
//!
//! - the sync type escalates (`collectionsOnly < normal < ignoreIndividualDelays < full`)
//! - library scopes are united, and `All` is never narrowed again
//!
//! Library-scoped requests wait for the debounce delay so a burst of local
//! edits turns into one pass. Requests covering all libraries are dispatched
//! right away. Requested full syncs are throttled by a cooldown measured from
//! the end of the last successful full pass; the automatic retry of an aborted
//! pass is not.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let (controller, signals) = SyncController::new(handler, resolver, permissions, progress, config);
//! let scheduler = SyncScheduler::new(controller, signals, SchedulerConfig::default());
//!
//! scheduler.request(SyncType::Normal, LibraryScope::specific([LibraryId::User])).await;
//! ```

use crate::controller::{ControllerSignal, PassOutcome, PassReport, SyncController};
use crate::types::{LibraryId, LibraryScope, SyncPassId, SyncType};
use core_runtime::config::SyncSettings;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Delay used to coalesce library-scoped requests
    pub debounce: Duration,

    /// Minimum time between the end of one full sync and the start of the next
    pub full_sync_cooldown: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&SyncSettings::default())
    }
}

impl From<&SyncSettings> for SchedulerConfig {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            debounce: settings.debounce,
            full_sync_cooldown: settings.full_sync_cooldown,
        }
    }
}

/// A requested pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub sync_type: SyncType,
    pub scope: LibraryScope,
}

impl SyncRequest {
    pub fn new(sync_type: SyncType, scope: LibraryScope) -> Self {
        // A full sync always covers every library
        let scope = if sync_type == SyncType::Full {
            LibraryScope::All
        } else {
            scope
        };
        Self { sync_type, scope }
    }

    /// Combine two requests into one that does at least what both ask for.
    pub fn merge(self, other: SyncRequest) -> SyncRequest {
        SyncRequest {
            sync_type: self.sync_type.escalate(other.sync_type),
            scope: self.scope.merge(other.scope),
        }
    }
}

struct SchedulerState {
    pending: Option<SyncRequest>,
    in_progress: Option<(SyncPassId, SyncRequest)>,
    debounce: CancellationToken,
    last_full_sync: Option<Instant>,
}

struct Inner {
    controller: SyncController,
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    busy: watch::Sender<bool>,
}

/// Debouncing front of the [`SyncController`]. Cheap to clone.
#[derive(Clone)]
pub struct SyncScheduler {
    inner: Arc<Inner>,
}

impl SyncScheduler {
    /// Create a scheduler driving `controller`.
    ///
    /// `signals` is the receiver returned by [`SyncController::new`]. Must be
    /// called inside a Tokio runtime; a listener task is spawned that lives
    /// as long as the scheduler.
    pub fn new(
        controller: SyncController,
        signals: mpsc::UnboundedReceiver<ControllerSignal>,
        config: SchedulerConfig,
    ) -> Self {
        let (busy, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            controller,
            config,
            state: Mutex::new(SchedulerState {
                pending: None,
                in_progress: None,
                debounce: CancellationToken::new(),
                last_full_sync: None,
            }),
            busy,
        });

        tokio::spawn(Inner::listen(Arc::downgrade(&inner), signals));
        Self { inner }
    }

    /// Request a sync pass.
    ///
    /// # Arguments
    ///
    /// * `sync_type` - How thorough the pass should be. `Full` always covers
    ///   all libraries and is dropped while its cooldown is active.
    /// * `scope` - Libraries to sync. `All` dispatches immediately, a
    ///   specific set waits for the debounce delay.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// scheduler.request(SyncType::Normal, LibraryScope::specific([LibraryId::Group(42)])).await;
    /// scheduler.request(SyncType::Full, LibraryScope::All).await;
    /// ```
    #[instrument(skip(self))]
    pub async fn request(&self, sync_type: SyncType, scope: LibraryScope) {
        self.inner
            .request(SyncRequest::new(sync_type, scope), false)
            .await;
    }

    /// A library changed on the server.
    pub async fn notify_remote_change(&self, library: LibraryId) {
        debug!(%library, "Remote change notification");
        self.request(SyncType::Normal, LibraryScope::specific([library]))
            .await;
    }

    /// Cancel the running pass and forget everything pending.
    #[instrument(skip(self))]
    pub async fn cancel_sync(&self) {
        let mut state = self.inner.state.lock().await;
        state.pending = None;
        state.debounce.cancel();
        state.in_progress = None;

        let cancelled = self.inner.controller.cancel().await;
        self.inner.busy.send_replace(false);
        info!(cancelled, "Sync cancelled");
    }

    pub async fn pending(&self) -> Option<SyncRequest> {
        self.inner.state.lock().await.pending.clone()
    }

    pub fn is_in_progress(&self) -> bool {
        *self.inner.busy.borrow()
    }

    /// Watch the busy flag; `true` while a pass runs.
    pub fn subscribe_in_progress(&self) -> watch::Receiver<bool> {
        self.inner.busy.subscribe()
    }
}

impl Inner {
    async fn listen(
        inner: Weak<Inner>,
        mut signals: mpsc::UnboundedReceiver<ControllerSignal>,
    ) {
        while let Some(signal) = signals.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            match signal {
                ControllerSignal::Completed(report) => inner.on_completed(report).await,
                ControllerSignal::Resync(request) => {
                    info!(sync_type = %request.sync_type, "Resync requested");
                    inner
                        .request(SyncRequest::new(request.sync_type, request.scope), true)
                        .await;
                }
            }
        }
        debug!("Scheduler listener stopped");
    }

    /// Retries of aborted passes skip the cooldown; a running full pass
    /// throttles every full request.
    fn full_sync_throttled(&self, state: &SchedulerState, resync: bool) -> bool {
        let running = matches!(
            &state.in_progress,
            Some((_, request)) if request.sync_type == SyncType::Full
        );
        let recent = !resync
            && state
                .last_full_sync
                .map_or(false, |at| at.elapsed() < self.config.full_sync_cooldown);
        running || recent
    }

    async fn request(self: &Arc<Self>, request: SyncRequest, resync: bool) {
        let mut state = self.state.lock().await;

        if request.sync_type == SyncType::Full && self.full_sync_throttled(&state, resync) {
            info!(resync, "Full sync skipped, throttled");
            return;
        }

        let merged = match state.pending.take() {
            Some(pending) => pending.merge(request),
            None => request,
        };
        debug!(sync_type = %merged.sync_type, all = merged.scope.is_all(), "Request pending");

        let immediate = merged.scope.is_all();
        state.pending = Some(merged);

        if immediate {
            state.debounce.cancel();
            self.dispatch(&mut state).await;
        } else {
            self.restart_timer(&mut state);
        }
    }

    async fn dispatch(self: &Arc<Self>, state: &mut SchedulerState) {
        if state.in_progress.is_some() {
            debug!("Pass running, request stays pending");
            return;
        }
        let Some(request) = state.pending.take() else {
            return;
        };

        match self
            .controller
            .start(request.sync_type, request.scope.clone())
            .await
        {
            Ok(pass_id) => {
                info!(%pass_id, sync_type = %request.sync_type, "Sync dispatched");
                state.in_progress = Some((pass_id, request));
                self.busy.send_replace(true);
            }
            Err(error) => {
                warn!(error = %error, "Controller did not start, retrying after debounce");
                state.pending = Some(request);
                self.restart_timer(state);
            }
        }
    }

    fn restart_timer(self: &Arc<Self>, state: &mut SchedulerState) {
        state.debounce.cancel();
        let token = CancellationToken::new();
        state.debounce = token.clone();

        let inner = Arc::clone(self);
        let delay = self.config.debounce;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let mut state = inner.state.lock().await;
                    if !token.is_cancelled() {
                        inner.dispatch(&mut state).await;
                    }
                }
            }
        });
    }

    async fn on_completed(self: &Arc<Self>, report: PassReport) {
        let mut state = self.state.lock().await;

        let request = match state.in_progress.take() {
            Some((pass_id, request)) if pass_id == report.pass_id => request,
            other => {
                state.in_progress = other;
                debug!(pass_id = %report.pass_id, "Ignoring report of a stale pass");
                return;
            }
        };
        self.busy.send_replace(false);

        if request.sync_type == SyncType::Full && matches!(report.outcome, PassOutcome::Finished(_)) {
            state.last_full_sync = Some(Instant::now());
        }
        debug!(
            pass_id = %report.pass_id,
            resync = report.resync.is_some(),
            pending = state.pending.is_some(),
            "Pass completed"
        );

        if state.pending.is_some() {
            self.restart_timer(&mut state);
        }
    }
}
