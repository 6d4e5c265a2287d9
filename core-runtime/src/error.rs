use thiserror::Error;

/// Errors raised while setting up the runtime (configuration, logging).
#[derive(Error, Debug)]
pub enum Error {
    /// A setting is missing or out of range.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A host bridge the engine cannot run without was not provided.
    #[error("Capability missing: {capability} - {message}")]
    CapabilityMissing { capability: String, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;
