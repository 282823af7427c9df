//! Centralized error types for the registry and its ingestion pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// All errors produced by the incoming-registry library.
///
/// The ingestion loop inspects [`RegistryError::is_fatal`] to decide whether a
/// failure ends the run or only skips the current message.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The mailbox rejected the credentials.
    #[error("Mailbox authentication failed: {0}")]
    Auth(String),

    /// The mailbox could not be reached, or the session broke mid-run.
    #[error("Mailbox connection error: {0}")]
    Connectivity(String),

    /// A single message could not be fetched or flagged.
    #[error("Failed to fetch message {id}: {reason}")]
    Fetch { id: String, reason: String },

    /// A message or one of its parts could not be decoded.
    #[error("Parse error: {0}")]
    Parse(String),

    /// The summarization backend returned an error or an unusable result.
    #[error("Summarization failed: {0}")]
    Summarization(String),

    /// The summarization backend did not answer in time.
    #[error("Summarization timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Writing or reading records failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Record fields were rejected (duplicate or non-positive number, etc.).
    #[error("Invalid record: {0}")]
    Validation(String),

    /// The requested record does not exist.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// I/O error with the associated file path.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The configuration is incomplete or inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Convenience alias for `Result<T, RegistryError>`.
pub type Result<T> = std::result::Result<T, RegistryError>;

impl RegistryError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a `Fetch` variant for a message id.
    pub fn fetch(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Fetch {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Connection-level failures end an ingestion run; everything else only
    /// affects the message being processed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Connectivity(_))
    }
}

impl From<rusqlite::Error> for RegistryError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}

/// Allow `?` on `std::io::Error` when no path context is available
/// (rare; prefer `RegistryError::io`).
impl From<std::io::Error> for RegistryError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::from("<unknown>"),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connection_errors_are_fatal() {
        assert!(RegistryError::Auth("bad password".into()).is_fatal());
        assert!(RegistryError::Connectivity("reset".into()).is_fatal());
        assert!(!RegistryError::fetch("7", "NO").is_fatal());
        assert!(!RegistryError::Parse("empty".into()).is_fatal());
        assert!(!RegistryError::Persistence("locked".into()).is_fatal());
        assert!(!RegistryError::Timeout(std::time::Duration::from_secs(20)).is_fatal());
    }

    #[test]
    fn test_fetch_display() {
        let e = RegistryError::fetch("42", "no body");
        assert_eq!(e.to_string(), "Failed to fetch message 42: no body");
    }
}
