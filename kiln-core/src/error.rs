//! Error types shared across Kiln crates

use thiserror::Error;

/// Errors produced while reading a build configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not parse build configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("unknown top-level key `{0}` in build configuration")]
    UnknownKey(String),

    #[error("{0}")]
    Invalid(String),
}

/// Errors returned by a credential store
#[derive(Debug, Error)]
pub enum CredentialError {
    /// No credential exists for the requested key
    #[error("no credential found for {0}")]
    NotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors returned by a VCS handler
#[derive(Debug, Error)]
pub enum VcsError {
    /// The requested file does not exist at that ref
    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
