//! Error types for the discovery engine
//!
//! These are engine-level failures (bad configuration, an unusable store,
//! a run finalized twice). Failures observed while talking to a cloud
//! provider are *not* errors here: they travel as [`crate::provider::ProviderFault`]
//! values and end up as classified entries in the run result.

use thiserror::Error;

/// Discovery result type
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Errors that can occur in the discovery engine
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Inventory store error
    #[error("Inventory store error: {0}")]
    Store(String),

    /// Fixture document error
    #[error("Fixture error: {0}")]
    Fixture(String),

    /// Terminal run status was already set
    #[error("Discovery run {run_id} already finalized as {status}")]
    AlreadyFinalized {
        /// Run identifier
        run_id: String,
        /// Status that was set first
        status: String,
    },

    /// Generic AWS service error (S3 store, etc.)
    #[error("AWS service error: {0}")]
    AwsService(String),
}

impl DiscoveryError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a fixture error
    pub fn fixture(msg: impl Into<String>) -> Self {
        Self::Fixture(msg.into())
    }

    /// Convert from generic AWS SDK error
    pub fn from_aws<E>(err: E) -> Self
    where
        E: std::fmt::Display,
    {
        Self::AwsService(err.to_string())
    }
}
