//! rtconfig Error Types

use thiserror::Error;

use crate::quorum::{QuorumReadResult, QuorumWriteResult};

/// Result type alias for rtconfig operations
pub type Result<T> = std::result::Result<T, Error>;

/// Stage of a composite replica operation that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStage {
    /// Reading the quorum configuration
    Read,
    /// Writing the updated configuration back
    Write,
}

impl std::fmt::Display for OperationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationStage::Read => write!(f, "read"),
            OperationStage::Write => write!(f, "write"),
        }
    }
}

/// Outcome carried by a failed composite operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageResult {
    Read(QuorumReadResult),
    Write(QuorumWriteResult),
}

impl std::fmt::Display for StageResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageResult::Read(result) => write!(f, "{}", result),
            StageResult::Write(result) => write!(f, "{}", result),
        }
    }
}

/// rtconfig error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Caller errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Storage errors
    #[error("Storage error at {location}: {reason}")]
    Storage { location: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Operation timed out at {0}")]
    Timeout(String),

    #[error("Configuration read failed, result={0}")]
    QuorumRead(QuorumReadResult),

    // Composite operation errors
    #[error("{operation}={account}: failed to {stage} configuration, result={result}")]
    ReplicaOperation {
        operation: &'static str,
        account: String,
        stage: OperationStage,
        result: StageResult,
    },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::Http(_)
                | Error::Storage { .. }
                | Error::QuorumRead(_)
                | Error::ReplicaOperation { .. }
        )
    }

    /// Check if this error was caused by the caller
    pub fn is_argument_error(&self) -> bool {
        matches!(self, Error::InvalidArgument(_))
    }
}
