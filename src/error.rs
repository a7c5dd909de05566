//! Error types for the package engine.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur while installing, verifying or updating a package.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A network request failed at the transport level.
    #[error("request to {url} failed: {reason}")]
    Remote { url: String, reason: String },

    /// The server answered with a non-success status code.
    #[error("unexpected HTTP status {status} from {url}")]
    RemoteStatus { url: String, status: u16 },

    /// Failed to read a file or directory.
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    /// Failed to write a file.
    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    /// Failed to create a directory.
    #[error("failed to create directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    /// The decompressed manifest does not match its embedded checksum.
    #[error("manifest {id} checksum mismatch: expected {expected}, got {actual}")]
    ManifestChecksum {
        id: String,
        expected: String,
        actual: String,
    },

    /// The manifest bytes could not be parsed.
    #[error("failed to decode manifest {id}: {reason}")]
    ManifestDecode { id: String, reason: String },

    /// A background task panicked or was aborted.
    #[error("worker task failed: {0}")]
    Task(String),

    /// The running operation was cancelled cooperatively.
    #[error("operation cancelled")]
    Cancelled,

    /// Status file (de)serialization failure.
    #[error("status file serialization failed: {0}")]
    Status(#[from] serde_json::Error),

    /// Uncontextualized I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl EngineError {
    /// Whether this error is the cooperative-cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }

    pub(crate) fn read(path: impl Into<PathBuf>, source: io::Error) -> Self {
        EngineError::Read {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn write(path: impl Into<PathBuf>, source: io::Error) -> Self {
        EngineError::Write {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn create_dir(path: impl Into<PathBuf>, source: io::Error) -> Self {
        EngineError::CreateDir {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_status_display() {
        let err = EngineError::RemoteStatus {
            url: "http://cdn/x_1".to_string(),
            status: 503,
        };
        assert_eq!(err.to_string(), "unexpected HTTP status 503 from http://cdn/x_1");
    }

    #[test]
    fn test_manifest_checksum_display() {
        let err = EngineError::ManifestChecksum {
            id: "blob".to_string(),
            expected: "abc".to_string(),
            actual: "def".to_string(),
        };
        assert!(err.to_string().contains("checksum mismatch"));
        assert!(err.to_string().contains("abc"));
        assert!(err.to_string().contains("def"));
    }

    #[test]
    fn test_cancelled_flag() {
        assert!(EngineError::Cancelled.is_cancelled());
        assert!(!EngineError::Task("boom".into()).is_cancelled());
    }
}
