//! # Core Runtime Module
//!
//! Runtime infrastructure shared by the sync crates:
//! - Logging and tracing setup
//! - Configuration with fail-fast validation
//! - Event bus for progress and conflict notifications
//!
//! ## Overview
//!
//! Nothing in this crate knows about libraries or object types. It carries the
//! plumbing that `core-sync` and host applications agree on.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
