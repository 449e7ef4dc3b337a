//! Error types for the kernel memory-map builder.
//!
//! Only configuration-class failures surface through [`MapError`]. Memory
//! access failures met while walking a snapshot are reported as
//! [`MemoryError`](crate::memory::MemoryError) and are absorbed by the
//! builder at the smallest possible scope.

use crate::memory::MemoryError;
use thiserror::Error;

/// Main error type for memory-map operations.
#[derive(Debug, Error)]
pub enum MapError {
    /// A required collaborator was not supplied
    #[error("Missing collaborator: {0}")]
    MissingCollaborator(&'static str),

    /// Configuration values that cannot be used for a build or diff
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Parse error with location information
    #[error("Parse error in {source_name} at line {line}: {message}")]
    ParseError {
        source_name: String,
        line: usize,
        message: String,
    },

    /// Physical memory of a snapshot is not available for comparison
    #[error("Physical memory unavailable: {0}")]
    PhysicalMemoryUnavailable(String),

    /// A type id that the symbol source does not know
    #[error("Type not found: {0}")]
    TypeNotFound(String),

    /// The worker thread pool could not be created
    #[error("Worker pool error: {0}")]
    WorkerPool(String),

    /// Memory access that could not be degraded to a skip
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    /// File I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for MapError {
    fn from(err: serde_json::Error) -> Self {
        MapError::Serialization(err.to_string())
    }
}

/// Result type alias for memory-map operations
pub type Result<T> = std::result::Result<T, MapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MapError::MissingCollaborator("symbol source");
        assert_eq!(err.to_string(), "Missing collaborator: symbol source");

        let err = MapError::ParseError {
            source_name: "slabs.txt".to_string(),
            line: 7,
            message: "expected two words".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Parse error in slabs.txt at line 7: expected two words"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "dump missing");
        let err: MapError = io_err.into();
        assert!(matches!(err, MapError::Io(_)));
    }

    #[test]
    fn test_memory_error_conversion() {
        let err: MapError = MemoryError::Unreadable(0xdead_0000).into();
        assert!(err.to_string().contains("0xdead0000"));
    }

    #[test]
    fn test_serde_error_conversion() {
        let bad = serde_json::from_str::<u32>("not a number").unwrap_err();
        let err: MapError = bad.into();
        assert!(matches!(err, MapError::Serialization(_)));
    }
}
