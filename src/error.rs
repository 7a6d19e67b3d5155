//! Error types for the crossflow router

use ethers::types::H256;
use thiserror::Error;

/// Contract revert code emitted when a transaction was already prepared
/// by someone else (receiver-side duplicate prepare).
pub const ALREADY_PREPARED: &str = "#P:015";
/// Contract revert code for an already-fulfilled transaction.
pub const ALREADY_FULFILLED: &str = "#F:019";
/// Contract revert code for an already-cancelled transaction.
pub const ALREADY_CANCELLED: &str = "#C:019";

/// Main error type for the router
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// A chain the loop was asked to act on has no configuration. This is
    /// checked at startup, so hitting it mid-loop indicates a bug and must
    /// propagate rather than be swallowed.
    #[error("Chain {chain_id} not configured")]
    ChainNotConfigured { chain_id: u64 },

    #[error("Gateway error for chain {chain_id}: {message}")]
    Gateway { chain_id: u64, message: String },

    #[error("Gas estimation failed: {0}")]
    GasEstimation(String),

    /// On-chain revert surfaced from a send or a dry-run estimate. The
    /// revert string carries the transaction-manager error code.
    #[error("Contract reverted on chain {chain_id}: {reason}")]
    ContractRevert { chain_id: u64, reason: String },

    /// The indexer-supplied invariant data does not match on-chain records.
    /// Aborts every submission tier for the call that detected it.
    #[error("Sanitation check failed for {transaction_id:?} on chain {chain_id}: {message}")]
    SanitationFailed {
        chain_id: u64,
        transaction_id: H256,
        message: String,
    },

    #[error("Relay service error: {0}")]
    RelayService(String),

    #[error("Messaging error: {0}")]
    Messaging(String),

    #[error("Subgraph error: {0}")]
    Subgraph(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RouterError {
    /// True when the underlying revert says the action was already performed
    /// by someone else. Treated as idempotent success by the state machine,
    /// never as a failure and never a trigger for compensation.
    pub fn is_already_performed(&self) -> bool {
        match self {
            RouterError::ContractRevert { reason, .. } => {
                reason.contains(ALREADY_PREPARED)
                    || reason.contains(ALREADY_FULFILLED)
                    || reason.contains(ALREADY_CANCELLED)
            }
            _ => false,
        }
    }

    /// True when a failed receiver-side prepare should be compensated by
    /// cancelling the sender-side lock. Only validation-shaped failures
    /// qualify: acting on stale/tampered indexer data, or a revert that is
    /// not a duplicate.
    pub fn is_cancellable(&self) -> bool {
        match self {
            RouterError::SanitationFailed { .. } => true,
            RouterError::ContractRevert { .. } => !self.is_already_performed(),
            _ => false,
        }
    }
}

/// Result type for router operations
pub type RouterResult<T> = Result<T, RouterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_performed_matches_revert_codes() {
        let err = RouterError::ContractRevert {
            chain_id: 1,
            reason: "execution reverted: #F:019".into(),
        };
        assert!(err.is_already_performed());
        assert!(!err.is_cancellable());
    }

    #[test]
    fn sanitation_failure_is_cancellable() {
        let err = RouterError::SanitationFailed {
            chain_id: 4,
            transaction_id: H256::from_low_u64_be(1),
            message: "variant hash mismatch".into(),
        };
        assert!(err.is_cancellable());
        assert!(!err.is_already_performed());
    }

    #[test]
    fn timeout_is_neither() {
        let err = RouterError::Timeout {
            operation: "relay event".into(),
        };
        assert!(!err.is_already_performed());
        assert!(!err.is_cancellable());
    }
}
