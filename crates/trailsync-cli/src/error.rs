use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] trailsync_core::Error),
    #[error(transparent)]
    Config(#[from] trailsync_core::ConfigError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("No statement provided")]
    EmptyStatement,
    #[error("Statement must be a JSON object: {0}")]
    InvalidStatement(String),
    #[error("Statement ID cannot be empty")]
    EmptyEventId,
    #[error("No dead-lettered statement with id {0}")]
    FailedEventNotFound(String),
    #[error("Refusing to reset without --yes")]
    ResetNotConfirmed,
    #[error("Connectivity check error: {0}")]
    Connectivity(String),
}
