use crate::types::{GroupId, LibraryId, ObjectType, Version};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("No internet connection")]
    NoConnection,

    #[error("API request failed with status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Staging cache error: {0}")]
    Storage(String),

    #[error("Version mismatch in {library}: expected {expected}, got {actual}")]
    VersionMismatch {
        library: LibraryId,
        expected: Version,
        actual: Version,
    },

    #[error("Failed to parse {object_type} {key:?}: {message}")]
    Parsing {
        object_type: ObjectType,
        key: Option<String>,
        message: String,
    },

    #[error("Write conflict for {object_type} {key} in {library}")]
    ObjectConflict {
        library: LibraryId,
        object_type: ObjectType,
        key: String,
    },

    #[error("{} {object_type} objects failed to commit in {library}", keys.len())]
    ObjectsFailed {
        library: LibraryId,
        object_type: ObjectType,
        keys: Vec<String>,
    },

    #[error("Unexpected failure: {0}")]
    Unexpected(String),

    #[error("Conflict for group {group_id} was not resolved: {reason}")]
    ConflictUnresolved { group_id: GroupId, reason: String },

    #[error("Sync cancelled")]
    Cancelled,

    #[error("Sync already in progress")]
    SyncInProgress,

    #[error("Invalid sync type: {0}")]
    InvalidSyncType(String),

    #[error("Invalid library identifier: {0}")]
    InvalidLibrary(String),

    #[error("Invalid object type: {0}")]
    InvalidObjectType(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// How a failure affects the running pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    /// Abort the whole pass and retry later.
    Fatal,
    /// Only these keys failed; mark them for resync and continue.
    KeySubset(Vec<String>),
    /// Drop the remaining actions of the affected library.
    Library,
    /// Record and continue; the affected objects are retried on the next pass.
    Object,
}

impl SyncError {
    /// The single abort decision for every failure the controller sees.
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::NoConnection
            | SyncError::Transport(_)
            | SyncError::MalformedResponse(_)
            | SyncError::Database(_)
            | SyncError::Storage(_)
            | SyncError::VersionMismatch { .. }
            | SyncError::Cancelled
            | SyncError::Config(_) => ErrorClass::Fatal,

            SyncError::Api { status, .. } if (400..500).contains(status) => ErrorClass::Fatal,
            SyncError::Api { .. } => ErrorClass::Library,

            SyncError::ObjectsFailed { keys, .. } => ErrorClass::KeySubset(keys.clone()),

            SyncError::Parsing { .. } | SyncError::ObjectConflict { .. } => ErrorClass::Object,

            SyncError::Unexpected(_)
            | SyncError::ConflictUnresolved { .. }
            | SyncError::SyncInProgress
            | SyncError::InvalidSyncType(_)
            | SyncError::InvalidLibrary(_)
            | SyncError::InvalidObjectType(_) => ErrorClass::Library,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }
}

impl From<bridge_traits::BridgeError> for SyncError {
    fn from(err: bridge_traits::BridgeError) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<core_runtime::Error> for SyncError {
    fn from(err: core_runtime::Error) -> Self {
        match err {
            core_runtime::Error::Config(message) => SyncError::Config(message),
            other => SyncError::Config(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
