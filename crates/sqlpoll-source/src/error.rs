//! Error types for sqlpoll-source
//!
//! Errors fall into two groups. Configuration and storage failures are
//! surfaced to the host and stop the source; query execution and emission
//! failures abort a single cycle and are retried on the next one. An
//! execution-layer configuration error is never retried.

use sqlpoll_rdbc::error::ErrorCategory;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type alias for source operations
pub type Result<T> = std::result::Result<T, SourceError>;

/// Failure reported by a downstream [`RecordEmitter`](crate::emit::RecordEmitter)
#[derive(Debug, Error)]
#[error("emission failed: {message}")]
pub struct EmissionError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl EmissionError {
    /// Create an emission error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Create an emission error with an underlying cause
    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// The error message
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Errors that can occur while running the polling source
#[derive(Debug, Error)]
pub enum SourceError {
    /// Missing or invalid configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Status file or directory could not be read or written
    #[error("storage error at {}: {source}", path.display())]
    Storage {
        /// File or directory involved
        path: PathBuf,
        /// Underlying I/O failure
        #[source]
        source: std::io::Error,
    },

    /// Status file exists but does not hold a single watermark value
    #[error("malformed status file {}: {reason}", path.display())]
    MalformedStatus {
        /// Status file path
        path: PathBuf,
        /// What is wrong with its contents
        reason: String,
    },

    /// Statement execution failed
    #[error("query execution failed: {0}")]
    QueryExecution(#[from] sqlpoll_rdbc::Error),

    /// Downstream rejected a batch
    #[error(transparent)]
    Emission(#[from] EmissionError),

    /// The source is not running
    #[error("source is not running")]
    Shutdown,
}

impl SourceError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a storage error for `path`
    pub fn storage(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Create a malformed status error for `path`
    pub fn malformed(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        Self::MalformedStatus {
            path: path.as_ref().to_path_buf(),
            reason: reason.into(),
        }
    }

    /// Whether the failed cycle can simply be retried after the poll delay
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::QueryExecution(e) => e.category() != ErrorCategory::Configuration,
            Self::Emission(_) => true,
            _ => false,
        }
    }

    /// Whether a retry is expected to succeed without anything changing
    pub fn is_transient(&self) -> bool {
        match self {
            Self::QueryExecution(e) => e.is_retriable(),
            Self::Emission(_) => true,
            _ => false,
        }
    }

    /// Whether this is a status file failure
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage { .. } | Self::MalformedStatus { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SourceError::config("statusFileName is required");
        assert_eq!(
            err.to_string(),
            "configuration error: statusFileName is required"
        );

        let err = SourceError::malformed("/tmp/status", "file is empty");
        assert_eq!(
            err.to_string(),
            "malformed status file /tmp/status: file is empty"
        );
    }

    #[test]
    fn test_recoverable_check() {
        assert!(SourceError::from(sqlpoll_rdbc::Error::connection("reset")).is_recoverable());
        assert!(SourceError::from(EmissionError::new("channel full")).is_recoverable());
        assert!(SourceError::from(sqlpoll_rdbc::Error::query("syntax error")).is_recoverable());
        assert!(
            SourceError::from(sqlpoll_rdbc::Error::type_conversion("interval")).is_recoverable()
        );
        assert!(!SourceError::from(sqlpoll_rdbc::Error::config("bad url")).is_recoverable());

        assert!(!SourceError::config("bad").is_recoverable());
        assert!(!SourceError::Shutdown.is_recoverable());
        let storage = SourceError::storage(
            "/tmp/x",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(!storage.is_recoverable());
        assert!(storage.is_storage());
    }

    #[test]
    fn test_transient_check() {
        assert!(SourceError::from(sqlpoll_rdbc::Error::timeout("slow")).is_transient());
        assert!(!SourceError::from(sqlpoll_rdbc::Error::query("syntax error")).is_transient());
        assert!(!SourceError::config("bad").is_transient());
    }

    #[test]
    fn test_emission_error_source() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err = EmissionError::with_source("downstream gone", io);
        assert_eq!(err.message(), "downstream gone");
        assert!(std::error::Error::source(&err).is_some());
    }
}
