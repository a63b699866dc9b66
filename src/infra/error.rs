//! Error types for the aggregator infrastructure.

use thiserror::Error;

/// Errors surfaced by the coordinator and its collaborators.
#[derive(Error, Debug)]
pub enum AggregatorError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Distinguished not-found signal from store selections. The scheduler
    /// swallows it: nothing to prove / aggregate / verify right now.
    #[error("not found")]
    NotFound,

    /// The selected batch did not pass the profitability policy. Treated like
    /// [`AggregatorError::NotFound`] by the scheduler.
    #[error("batch is not profitable to aggregate")]
    NotProfitable,

    /// A prover RPC failed or returned a failure result.
    #[error("prover error: {0}")]
    Prover(String),

    /// The bidirectional prover stream was closed by the peer.
    #[error("prover channel closed")]
    ProverChannelClosed,

    /// L1 RPC or transaction submission error.
    #[error("ethereum error: {0}")]
    Ethereum(String),

    /// JSON encoding of prover inputs failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl AggregatorError {
    /// True for the benign nothing-to-do signal from store selections.
    pub fn is_not_found(&self) -> bool {
        matches!(self, AggregatorError::NotFound)
    }
}

/// Result type for aggregator operations.
pub type Result<T> = std::result::Result<T, AggregatorError>;
