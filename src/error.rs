//! Classified indexer errors
//!
//! Most failures travel as `anyhow::Error` with context attached. The few
//! conditions a caller has to branch on are typed here and recovered with
//! `downcast_ref`.

use thiserror::Error;

/// Errors that change how an indexer loop reacts.
#[derive(Debug, Error)]
pub enum IndexerError {
    /// The node serves a different network than the one configured locally.
    #[error("network id mismatch: configured {configured}, node reports {reported}")]
    NetworkMismatch { configured: u64, reported: u64 },

    /// The node answered with a non-success HTTP status.
    #[error("node returned HTTP {status} for {path}")]
    NodeStatus { status: u16, path: String },

    /// An outbound call exceeded its deadline.
    #[error("request to {path} timed out")]
    Timeout { path: String },
}

impl IndexerError {
    /// Returns `true` if retrying cannot fix the error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::NetworkMismatch { .. })
    }
}

/// Returns `true` if any error in the chain is a fatal [`IndexerError`].
pub fn is_fatal(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<IndexerError>())
        .any(IndexerError::is_fatal)
}
