//! Error types for the Palimpsest library
//!
//! This module defines all error types that can occur while detecting
//! context shifts, storing snapshots and walking the version timeline.
//!
//! Routine lookups (a node, branch or snapshot that simply does not exist)
//! are reported as `Ok(None)` or `false` by the engines. The error variants
//! here are reserved for conditions a caller has to act on: broken data,
//! failing storage, or misuse of the API.
//!
//! Two soft conditions are deliberately *not* errors:
//! - a rate-limited automatic snapshot is a [`crate::types::ChangeOutcome`]
//! - merge conflicts are listed in [`crate::types::MergeResult`]

use thiserror::Error;

/// Type alias for Results in the Palimpsest library
pub type Result<T> = std::result::Result<T, VersioningError>;

/// Main error type for all Palimpsest operations
#[derive(Debug, Error)]
pub enum VersioningError {
    /// A referenced entity is absent where the operation requires it
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Entity kind ("node", "branch", "snapshot", "file history", ...)
        kind: &'static str,
        /// Identifier that was looked up
        id: String,
    },

    /// Stored data violates a structural invariant
    ///
    /// Broken diff chains, snapshots with neither full content nor a diff,
    /// and inconsistent parent/child edges all end up here.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Linking two nodes would make a node its own ancestor
    #[error("Circular dependency detected in timeline")]
    CircularDependency,

    /// Persistence call failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O errors from the file-backed store
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors during bincode serialization/deserialization
    #[error("Bincode error: {0}")]
    Bincode(String),

    /// Compression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// Decompression errors
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// A patch could not be produced or applied
    #[error("Diff error: {0}")]
    Diff(String),

    /// A signal analyzer failed
    #[error("Analyzer '{analyzer}' failed: {message}")]
    Analyzer {
        /// Analyzer kind
        analyzer: String,
        /// Failure description
        message: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// UTF-8 conversion error
    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<bincode::error::DecodeError> for VersioningError {
    fn from(err: bincode::error::DecodeError) -> Self {
        VersioningError::Bincode(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for VersioningError {
    fn from(err: bincode::error::EncodeError) -> Self {
        VersioningError::Bincode(err.to_string())
    }
}

impl From<regex::Error> for VersioningError {
    fn from(err: regex::Error) -> Self {
        VersioningError::Analyzer {
            analyzer: "keyword".to_string(),
            message: err.to_string(),
        }
    }
}

impl VersioningError {
    /// Create a not-found error for an entity kind
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        VersioningError::NotFound { kind, id: id.into() }
    }

    /// Create an integrity error with a custom message
    pub fn integrity(msg: impl Into<String>) -> Self {
        VersioningError::Integrity(msg.into())
    }

    /// Create a storage error with a custom message
    pub fn storage(msg: impl Into<String>) -> Self {
        VersioningError::Storage(msg.into())
    }

    /// Create a compression error with a custom message
    pub fn compression(msg: impl Into<String>) -> Self {
        VersioningError::Compression(msg.into())
    }

    /// Create a decompression error with a custom message
    pub fn decompression(msg: impl Into<String>) -> Self {
        VersioningError::Decompression(msg.into())
    }

    /// Create a diff error with a custom message
    pub fn diff(msg: impl Into<String>) -> Self {
        VersioningError::Diff(msg.into())
    }

    /// Create an analyzer error
    pub fn analyzer(analyzer: impl Into<String>, msg: impl Into<String>) -> Self {
        VersioningError::Analyzer {
            analyzer: analyzer.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        VersioningError::Internal(msg.into())
    }

    /// Check if this error is recoverable by retrying
    pub fn is_recoverable(&self) -> bool {
        matches!(self, VersioningError::Storage(_) | VersioningError::Io(_))
    }

    /// Check if this error indicates corrupted history
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            VersioningError::Integrity(_)
                | VersioningError::CircularDependency
                | VersioningError::Decompression(_)
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            VersioningError::NotFound { kind, id } => {
                format!("No {} with id '{}'. Use 'palimpsest log <file>' to list versions.", kind, id)
            }
            VersioningError::Integrity(msg) => {
                format!(
                    "Version history is damaged ({}). Run 'palimpsest verify <file>' for a full report.",
                    msg
                )
            }
            VersioningError::Storage(msg) => {
                format!("Storage backend failed: {}. The operation can be retried.", msg)
            }
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = VersioningError::not_found("node", "abc123");
        assert_eq!(err.to_string(), "node not found: abc123");
    }

    #[test]
    fn test_error_recoverable() {
        assert!(VersioningError::storage("disk full").is_recoverable());
        assert!(!VersioningError::integrity("broken chain").is_recoverable());
    }

    #[test]
    fn test_error_integrity() {
        assert!(VersioningError::CircularDependency.is_integrity());
        assert!(VersioningError::integrity("missing ancestor").is_integrity());
        assert!(!VersioningError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "test"
        ))
        .is_integrity());
    }

    #[test]
    fn test_regex_error_maps_to_analyzer() {
        let err: VersioningError = regex::Regex::new("(").unwrap_err().into();
        assert!(matches!(err, VersioningError::Analyzer { ref analyzer, .. } if analyzer == "keyword"));
    }
}
