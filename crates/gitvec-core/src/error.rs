//! Error types for gitvec.

use thiserror::Error;

/// Result type alias using gitvec's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for gitvec operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Dedup ledger operation failed
    #[error("Claim error: {0}")]
    Claim(String),

    /// Job queue operation failed
    #[error("Job error: {0}")]
    Job(String),

    /// Illegal status transition on a claim or job
    #[error("Invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// Embedding producer failed with a retryable error (network, timeout)
    #[error("Producer error (transient): {0}")]
    ProducerTransient(String),

    /// Embedding producer failed permanently (malformed repository)
    #[error("Producer error (permanent): {0}")]
    ProducerPermanent(String),

    /// Vector index operation failed
    #[error("Index error: {0}")]
    Index(String),

    /// Migration run failed
    #[error("Migration error: {0}")]
    Migration(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the caller may retry the failed operation.
    ///
    /// Storage and network failures are retryable; permanent producer
    /// failures, illegal transitions, and bad input are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Database(_)
                | Error::ProducerTransient(_)
                | Error::Request(_)
                | Error::Index(_)
                | Error::Io(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_claim() {
        let err = Error::Claim("ledger unavailable".to_string());
        assert_eq!(err.to_string(), "Claim error: ledger unavailable");
    }

    #[test]
    fn test_error_display_invalid_transition() {
        let err = Error::InvalidTransition {
            entity: "job",
            from: "completed".to_string(),
            to: "processing".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid job transition: completed -> processing"
        );
    }

    #[test]
    fn test_error_display_producer_variants() {
        let t = Error::ProducerTransient("timeout".to_string());
        let p = Error::ProducerPermanent("repository malformed".to_string());
        assert_eq!(t.to_string(), "Producer error (transient): timeout");
        assert_eq!(
            p.to_string(),
            "Producer error (permanent): repository malformed"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::ProducerTransient("x".into()).is_retryable());
        assert!(Error::Index("x".into()).is_retryable());
        assert!(Error::Request("x".into()).is_retryable());
        assert!(!Error::ProducerPermanent("x".into()).is_retryable());
        assert!(!Error::InvalidInput("x".into()).is_retryable());
        assert!(!Error::Config("x".into()).is_retryable());
        assert!(!Error::InvalidTransition {
            entity: "claim",
            from: "completed".into(),
            to: "processing".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
