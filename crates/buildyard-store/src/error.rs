//! Error types for the request store.

use buildyard_core::RequestId;
use thiserror::Error;

/// Result type alias for request store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during request store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another actor already claimed one of the requested ids.
    /// Recoverable: re-fetch the unclaimed set and retry the pass.
    #[error("request already claimed: {0}")]
    AlreadyClaimed(RequestId),

    #[error("request not found: {0}")]
    NotFound(RequestId),

    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}

impl StoreError {
    /// Whether a failed claim should be retried against fresh data
    /// rather than propagated.
    pub fn is_claim_race(&self) -> bool {
        matches!(self, StoreError::AlreadyClaimed(_))
    }
}
