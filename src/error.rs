//! Error types for the relay.

use thiserror::Error;

/// Main error type for relay operations.
///
/// Claim conflicts are not errors: `compare_and_delete` reports them as
/// [`CommitOutcome::Conflict`](crate::types::CommitOutcome).
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Delivery of {key} failed after claim: {reason}")]
    DeliveryFailure { key: String, reason: String },

    #[error("Authentication rejected")]
    AuthRejected,

    #[error("Transport closed")]
    TransportClosed,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Invalid entry id: {0}")]
    InvalidId(String),

    #[error("Missing configuration: {0}")]
    NotConfigured(String),

    #[error("Session thread panicked")]
    SessionPanicked,
}

impl RelayError {
    /// Fold any backend failure into the `StoreUnavailable` category.
    pub fn unavailable(err: RelayError) -> Self {
        match err {
            RelayError::StoreUnavailable(_) => err,
            other => RelayError::StoreUnavailable(other.to_string()),
        }
    }

    /// Whether this error came from the entry store.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, RelayError::StoreUnavailable(_))
    }
}

impl From<rmp_serde::encode::Error> for RelayError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        RelayError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for RelayError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        RelayError::Deserialization(e.to_string())
    }
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
