//! Error types for the PDF highlight server

use thiserror::Error;

/// Result type alias for the PDF highlight server
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the PDF highlight server
#[derive(Error, Debug)]
pub enum Error {
    /// No file key was given and no file is active
    #[error("No file key provided and no active file is set")]
    NoActiveFile,

    /// A payload or highlight is tagged with a different file than the operation targets
    #[error("File key mismatch: expected {expected}, found {found}")]
    FileKeyMismatch { expected: String, found: String },

    /// Highlight id not present on the page
    #[error("Highlight {id} not found on page {page}")]
    HighlightNotFound { page: u32, id: String },

    /// Malformed detection or search payload
    #[error("Invalid payload: {reason}")]
    InvalidPayload { reason: String },

    /// Highlight failed validation (non-finite geometry, bad page, ...)
    #[error("Invalid highlight: {reason}")]
    InvalidHighlight { reason: String },

    /// Storage backend failure
    #[error("Storage error: {reason}")]
    Storage { reason: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Return a sanitized error message safe to send to clients.
    /// Internal details (paths, serializer positions) are omitted.
    /// Full details should be logged via tracing before calling this.
    pub fn client_message(&self) -> String {
        match self {
            Error::NoActiveFile => "No active file".to_string(),
            Error::FileKeyMismatch { expected, .. } => {
                format!("Data does not belong to file {}", expected)
            }
            Error::HighlightNotFound { page, id } => {
                format!("Highlight {} not found on page {}", id, page)
            }
            Error::InvalidPayload { reason } => format!("Invalid payload: {}", reason),
            Error::InvalidHighlight { reason } => format!("Invalid highlight: {}", reason),
            Error::Storage { .. } => "Storage error".to_string(),
            Error::Io(_) => "I/O error".to_string(),
            Error::Serialization(_) => "Serialization error".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_hides_storage_details() {
        let err = Error::Storage {
            reason: "/home/user/.cache/annotations.json: permission denied".to_string(),
        };
        assert_eq!(err.client_message(), "Storage error");
        assert!(err.to_string().contains("permission denied"));
    }

    #[test]
    fn test_client_message_keeps_lookup_details() {
        let err = Error::HighlightNotFound {
            page: 3,
            id: "17".to_string(),
        };
        assert_eq!(err.client_message(), "Highlight 17 not found on page 3");
    }
}
