//! Error types for agent-mesh

use std::time::Duration;

use thiserror::Error;

/// The main error type for agent-mesh operations
#[derive(Error, Debug)]
pub enum Error {
    /// Target of a send/receive is not registered
    #[error("Unknown participant '{id}' (registered: [{}])", known.join(", "))]
    UnknownParticipant {
        /// The id that was looked up
        id: String,
        /// Ids registered at the time of the failure, sorted
        known: Vec<String>,
    },

    /// A blocking operation exceeded its deadline
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// Operation that timed out (e.g. "receive", "send_request")
        operation: &'static str,
        /// The deadline that elapsed
        after: Duration,
    },

    /// A bounded mailbox is full and the send was not allowed to wait
    #[error("Mailbox '{id}' is full (capacity {capacity})")]
    MailboxFull { id: String, capacity: usize },

    /// An outstanding request was cancelled before a reply arrived
    #[error("Request {correlation_id} was cancelled")]
    RequestCancelled { correlation_id: String },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for errors caused by an elapsed deadline
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// True when the target participant was not registered
    pub fn is_unknown_participant(&self) -> bool {
        matches!(self, Error::UnknownParticipant { .. })
    }
}

/// A specialized Result type for agent-mesh operations
pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_participant_lists_known_ids() {
        let err = Error::UnknownParticipant {
            id: "ghost".to_string(),
            known: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Unknown participant 'ghost' (registered: [a, b])"
        );
        assert!(err.is_unknown_participant());
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_timeout_display() {
        let err = Error::Timeout {
            operation: "receive",
            after: Duration::from_millis(100),
        };
        assert_eq!(err.to_string(), "receive timed out after 100ms");
        assert!(err.is_timeout());
    }
}
