//! Dispatch error types.

use buildyard_core::RequestId;
use thiserror::Error;

/// Errors that can occur during a matching pass.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The selection policy returned a worker that is not in the
    /// available set — a configuration bug; the pass is aborted.
    #[error("policy chose worker not in the available set: {0}")]
    PolicyChoseUnavailableWorker(String),

    /// The request chooser picked an id not in the unclaimed set —
    /// likewise a configuration bug.
    #[error("chooser picked request not in the unclaimed set: {0}")]
    ChoseUnknownRequest(RequestId),

    #[error("request store error: {0}")]
    Store(#[from] buildyard_store::StoreError),
}

pub type DispatchResult<T> = Result<T, DispatchError>;
