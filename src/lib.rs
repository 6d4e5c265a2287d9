//! Workspace facade crate.
//!
//! Re-exports the sync engine so host applications can depend on
//! `refsync-workspace` alone. The `desktop-shims` feature additionally wires
//! the Tokio-backed bridge implementations into `core-runtime`.

pub use core_sync::*;

#[cfg(feature = "desktop-shims")]
pub use core_runtime;
