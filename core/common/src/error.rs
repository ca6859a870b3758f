//! Common error types for notesync.

use thiserror::Error;

/// Top-level error type for notesync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport failure talking to the backend (connection refused, DNS,
    /// timeout, unreadable body).
    #[error("Network error: {0}")]
    Network(String),

    /// The backend answered with a non-success status.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Resource not found, locally or remotely.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Connectivity is down.
    #[error("Cannot sync while offline")]
    Offline,

    /// No backend API base has been configured.
    #[error("No backend configured")]
    NotConfigured,

    /// Local store operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Whether this error affects a whole sync run rather than one queued
    /// operation.
    pub fn is_systemic(&self) -> bool {
        matches!(self, Error::Network(_))
    }

    /// Whether the backend reported the resource as missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::Api { status: 404, .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_network_errors_are_systemic() {
        assert!(Error::Network("connection reset".to_string()).is_systemic());
        assert!(!Error::Api {
            status: 500,
            message: "boom".to_string()
        }
        .is_systemic());
        assert!(!Error::NotFound("note n1".to_string()).is_systemic());
        assert!(!Error::Offline.is_systemic());
    }

    #[test]
    fn test_not_found_classification() {
        assert!(Error::NotFound("x".to_string()).is_not_found());
        assert!(Error::Api {
            status: 404,
            message: String::new()
        }
        .is_not_found());
        assert!(!Error::Api {
            status: 409,
            message: String::new()
        }
        .is_not_found());
    }
}
