//! # Host Bridge Traits
//!
//! Capability traits that each host platform implements for the sync core.
//!
//! ## Overview
//!
//! The sync engine never touches the file system or the host logger directly.
//! It talks to the traits below, and each platform ships an adapter crate.
//!
//! ## Traits
//!
//! - [`FileSystemAccess`](storage::FileSystemAccess) - Staging cache I/O
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Platform Requirements
//!
//! | Platform | Implementation Crate | Status |
//! |----------|---------------------|--------|
//! | Desktop  | `bridge-desktop`    | ✅ Available |
//! | iOS      | TBD                 | 📋 Planned |
//! | Android  | TBD                 | 📋 Planned |
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Adapters should
//! convert platform errors into it and keep the offending path in the message.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` so a single adapter can be shared by
//! the scheduler, the controller and the batch fetch workers.

pub mod error;
pub mod storage;
pub mod time;

pub use error::BridgeError;

pub use storage::FileSystemAccess;
pub use time::{ConsoleLogger, LogEntry, LogLevel, LoggerSink};
