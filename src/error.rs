//! Error types for the Crossbook node

use thiserror::Error;

/// Main error type for the coordinator node
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Ledger unavailable for chain {chain}: {message}")]
    LedgerUnavailable { chain: String, message: String },

    #[error("Snapshot I/O error: {0}")]
    SnapshotIo(#[from] std::io::Error),

    #[error("Snapshot encoding error: {0}")]
    SnapshotEncoding(#[from] serde_json::Error),

    #[error("Signature rejected for transaction {tx_id}: {reason}")]
    SignatureReject { tx_id: String, reason: String },

    #[error("Payout for {context} yields no positive amount after fees")]
    PayoutUnderflow { context: String },

    #[error("Order {0} not found")]
    OrderNotFound(String),

    #[error("Transaction {0} not found")]
    TransactionNotFound(String),

    #[error("Chain {0} not found")]
    ChainNotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl NodeError {
    /// Check if error is retryable on the next interleaver tick
    pub fn is_retryable(&self) -> bool {
        matches!(self, NodeError::LedgerUnavailable { .. })
    }
}

/// Result type for node operations
pub type NodeResult<T> = Result<T, NodeError>;
