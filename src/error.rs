//! Error types for the swap engine

use thiserror::Error;

/// Main error type for the node
#[derive(Error, Debug)]
pub enum SwapError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Funding mismatch on chain {chain_id}: {message}")]
    FundingMismatch { chain_id: u64, message: String },

    #[error("Chain RPC error for chain {chain_id}: {message}")]
    ChainRpc { chain_id: u64, message: String },

    #[error("Reorg detected on chain {chain_id} at height {height}")]
    ReorgDetected { chain_id: u64, height: u64 },

    #[error("Extracted preimage does not match the negotiated hash")]
    SecretMismatch,

    #[error("Refund window missed for swap {swap_id} on chain {chain_id}")]
    RefundWindowMissed { swap_id: String, chain_id: u64 },

    #[error("Invalid state transition from {from} on {event}")]
    InvalidStateTransition { from: String, event: String },

    #[error("Chain {chain_id} not found")]
    ChainNotFound { chain_id: u64 },

    #[error("Swap {0} not found")]
    SwapNotFound(String),

    #[error("Signer error: {0}")]
    Signer(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Contract construction error: {0}")]
    Contract(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SwapError {
    /// Check if error is retryable (transient, no state transition)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SwapError::ChainRpc { .. } | SwapError::Timeout { .. } | SwapError::Transport(_)
        )
    }

    /// Check if error should trigger an operator alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            SwapError::FundingMismatch { .. }
                | SwapError::ReorgDetected { .. }
                | SwapError::RefundWindowMissed { .. }
                | SwapError::Signer(_)
        )
    }

    /// Check if error is fatal for the swap (funds may be at risk)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SwapError::FundingMismatch { .. } | SwapError::RefundWindowMissed { .. }
        )
    }
}

/// Result type for swap engine operations
pub type SwapResult<T> = Result<T, SwapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        let rpc = SwapError::ChainRpc {
            chain_id: 1,
            message: "connection refused".into(),
        };
        assert!(rpc.is_retryable());
        assert!(!rpc.is_fatal());

        let mismatch = SwapError::FundingMismatch {
            chain_id: 2,
            message: "amount 90 != 100".into(),
        };
        assert!(!mismatch.is_retryable());
        assert!(mismatch.should_alert());
        assert!(mismatch.is_fatal());
    }
}
