//! Error types for trailsync-core

use thiserror::Error;

/// Result type alias using trailsync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in trailsync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// The host offers no usable persistent storage at the requested location
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The storage engine aborted a transaction; none of its writes were applied
    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Queued or failed event not found
    #[error("Event not found: {0}")]
    NotFound(String),

    /// A required collaborator (collector URL, transport) is not configured
    #[error("Not configured: {0}")]
    NotConfigured(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error came from the storage layer rather than from caller input
    pub const fn is_storage_fault(&self) -> bool {
        matches!(
            self,
            Self::StorageUnavailable(_) | Self::TransactionAborted(_) | Self::Database(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_faults_are_told_apart_from_input_faults() {
        assert!(Error::StorageUnavailable("read-only volume".into()).is_storage_fault());
        assert!(Error::TransactionAborted("quota".into()).is_storage_fault());
        assert!(!Error::InvalidInput("empty id".into()).is_storage_fault());
        assert!(!Error::NotFound("a".into()).is_storage_fault());
    }
}
