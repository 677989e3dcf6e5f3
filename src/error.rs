//! Error types for the backup engine

use crate::transfer::ErrorClass;
use thiserror::Error;

/// Main error type for backup operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid configuration: {reason}")]
    Configuration { reason: String },

    #[error("Unknown provider: {name}")]
    UnknownProvider { name: String },

    #[error("Provider {provider} is not supported: {reason}")]
    NotSupported { provider: String, reason: String },

    #[error("None of the configured backup items exist")]
    NoBackupItems,

    #[error("Archive error: {reason}")]
    Archive { reason: String },

    #[error("Encryption error: {reason}")]
    Encryption { reason: String },

    #[error("Integrity verification failed: {reason}")]
    IntegrityError { reason: String },

    #[error("Provider {provider} failed ({class}): {message}")]
    Provider {
        provider: String,
        class: ErrorClass,
        message: String,
    },

    #[error("Backup failed on every provider")]
    AllProvidersFailed,

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Shorthand for a configuration error
    pub fn config(reason: impl Into<String>) -> Self {
        Error::Configuration {
            reason: reason.into(),
        }
    }

    /// Whether this error was raised before any I/O took place
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Configuration { .. } | Error::UnknownProvider { .. } | Error::NotSupported { .. }
        )
    }
}

/// Result type alias for backup operations
pub type Result<T> = std::result::Result<T, Error>;
