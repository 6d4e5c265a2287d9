//! # Event Bus System
//!
//! Broadcasts sync progress and conflict prompts to any number of read-only
//! observers (a pull-to-refresh indicator, a toolbar badge, a log exporter)
//! using `tokio::sync::broadcast`.
//!
//! ## Overview
//!
//! - **Event Types**: [`CoreEvent`] wraps [`SyncEvent`] (one variant per
//!   progress phase) and [`ConflictEvent`].
//! - **EventBus**: Central broadcast channel for publishing events
//! - **EventStream**: Wrapper for consuming events with filtering
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, SyncEvent};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let event_bus = EventBus::new(100);
//! let mut stream = event_bus.subscribe();
//!
//! event_bus.emit(CoreEvent::Sync(SyncEvent::Starting)).ok();
//! assert_eq!(stream.recv().await.unwrap(), CoreEvent::Sync(SyncEvent::Starting));
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: the subscriber missed `n` events and can keep
//!   receiving. Progress is a "latest value wins" stream, so lagging is benign.
//! - **`RecvError::Closed`**: every sender was dropped; treat it as shutdown.
//!
//! `emit` fails only when nobody is subscribed. Publishers ignore that with
//! `.ok()`: progress without observers is not an error.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum published through the event bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Sync pass progress
    Sync(SyncEvent),
    /// Conflicts waiting for, or resolved by, the user
    Conflict(ConflictEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Sync(e) => e.description(),
            CoreEvent::Conflict(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Sync(SyncEvent::Aborted { .. }) => EventSeverity::Error,
            CoreEvent::Sync(SyncEvent::Finished { errors }) if !errors.is_empty() => {
                EventSeverity::Warning
            }
            CoreEvent::Conflict(ConflictEvent::Presented { .. }) => EventSeverity::Warning,
            CoreEvent::Sync(SyncEvent::Finished { .. }) => EventSeverity::Info,
            CoreEvent::Sync(SyncEvent::Starting) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Sync Events
// ============================================================================

/// A `(done, total)` counter attached to progress phases.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressCount {
    pub done: u64,
    pub total: u64,
}

impl ProgressCount {
    pub fn new(done: u64, total: u64) -> Self {
        Self { done, total }
    }
}

/// Phases of a sync pass, in the order a consumer normally sees them.
///
/// Exactly one of `Finished` or `Aborted` terminates each pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum SyncEvent {
    /// A pass has been started by the scheduler.
    Starting,
    /// Group metadata is being synchronized.
    Groups {
        progress: Option<ProgressCount>,
    },
    /// A library's version diff has begun.
    Library {
        name: String,
    },
    /// Objects of one type are being fetched for a library.
    Object {
        /// Object type name, e.g. `"item"`.
        object: String,
        progress: Option<ProgressCount>,
        library_name: String,
    },
    /// Remote deletions are being applied to a library.
    Deletions {
        library_name: String,
    },
    /// Local changes are being written to the remote.
    Changes {
        progress: ProgressCount,
    },
    /// Attachment files are being uploaded.
    Uploads {
        progress: ProgressCount,
    },
    /// The pass completed; `errors` lists the non-fatal failures it recorded.
    Finished {
        errors: Vec<String>,
    },
    /// The pass stopped on a fatal error.
    Aborted {
        message: String,
        /// Whether a retry has been scheduled.
        recoverable: bool,
    },
}

impl SyncEvent {
    fn description(&self) -> &str {
        match self {
            SyncEvent::Starting => "Sync starting",
            SyncEvent::Groups { .. } => "Syncing groups",
            SyncEvent::Library { .. } => "Syncing library",
            SyncEvent::Object { .. } => "Syncing objects",
            SyncEvent::Deletions { .. } => "Applying remote deletions",
            SyncEvent::Changes { .. } => "Uploading local changes",
            SyncEvent::Uploads { .. } => "Uploading attachments",
            SyncEvent::Finished { .. } => "Sync finished",
            SyncEvent::Aborted { .. } => "Sync aborted",
        }
    }

    /// Returns `true` for the two phases that end a pass.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncEvent::Finished { .. } | SyncEvent::Aborted { .. })
    }
}

// ============================================================================
// Conflict Events
// ============================================================================

/// Events about conflicts that need a user decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum ConflictEvent {
    /// The pass is suspended until the conflict is answered.
    Presented {
        /// Conflict kind, e.g. `"group_removed"`.
        kind: String,
        group_id: u64,
        group_name: String,
    },
    /// A resolution was chosen and queued.
    Resolved {
        kind: String,
        group_id: u64,
        resolution: String,
    },
}

impl ConflictEvent {
    fn description(&self) -> &str {
        match self {
            ConflictEvent::Presented { .. } => "Conflict awaiting resolution",
            ConflictEvent::Resolved { .. } => "Conflict resolved",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central broadcast channel for [`CoreEvent`]s.
///
/// Cloning the bus is cheap and every clone publishes into the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus that buffers `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an error
    /// if there are no active subscribers.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber. Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A `broadcast::Receiver` with an optional filter.
///
/// ```rust
/// use core_runtime::events::{CoreEvent, EventBus, EventStream};
///
/// let event_bus = EventBus::new(16);
/// let conflicts = EventStream::new(event_bus.subscribe())
///     .filter(|event| matches!(event, CoreEvent::Conflict(_)));
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events that match `predicate` will be returned.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    fn accepts(&self, event: &CoreEvent) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }

    /// Receives the next event that passes the filter.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    /// Attempts to receive a matching event without waiting.
    ///
    /// Returns `None` if no matching events are currently buffered.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.accepts(&event) => return Some(Ok(event)),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
