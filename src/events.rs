//! Typed contract event bus
//!
//! Republishes on-chain transaction-manager events, filtered to this
//! router's address by the listeners, so submission code can await a
//! specific outcome. Waiters subscribe before the triggering submission is
//! sent; the broadcast channel buffers events published after the subscribe,
//! closing the race where an event fires before the waiter registers.

use crate::error::{RouterError, RouterResult};
use crate::types::{InvariantTransactionData, VariantData};

use ethers::types::{Address, Bytes, H256, U256};
use tokio::sync::broadcast;
use tokio::time::{timeout_at, Duration, Instant};

/// Events relevant to this router, keyed by transaction id where one exists.
#[derive(Debug, Clone)]
pub enum ContractEvent {
    Prepared {
        chain_id: u64,
        invariant: InvariantTransactionData,
        variant: VariantData,
        tx_hash: H256,
        block_number: u64,
    },
    Fulfilled {
        chain_id: u64,
        invariant: InvariantTransactionData,
        signature: Bytes,
        tx_hash: H256,
        block_number: u64,
    },
    Cancelled {
        chain_id: u64,
        invariant: InvariantTransactionData,
        tx_hash: H256,
        block_number: u64,
    },
    LiquidityRemoved {
        chain_id: u64,
        router: Address,
        asset_id: Address,
        amount: U256,
        recipient: Address,
        tx_hash: H256,
        block_number: u64,
    },
}

impl ContractEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ContractEvent::Prepared { .. } => "prepared",
            ContractEvent::Fulfilled { .. } => "fulfilled",
            ContractEvent::Cancelled { .. } => "cancelled",
            ContractEvent::LiquidityRemoved { .. } => "liquidity_removed",
        }
    }

    pub fn chain_id(&self) -> u64 {
        match self {
            ContractEvent::Prepared { chain_id, .. }
            | ContractEvent::Fulfilled { chain_id, .. }
            | ContractEvent::Cancelled { chain_id, .. }
            | ContractEvent::LiquidityRemoved { chain_id, .. } => *chain_id,
        }
    }

    pub fn tx_hash(&self) -> H256 {
        match self {
            ContractEvent::Prepared { tx_hash, .. }
            | ContractEvent::Fulfilled { tx_hash, .. }
            | ContractEvent::Cancelled { tx_hash, .. }
            | ContractEvent::LiquidityRemoved { tx_hash, .. } => *tx_hash,
        }
    }

    /// Transaction id, for events that carry invariant data.
    pub fn transaction_id(&self) -> Option<H256> {
        match self {
            ContractEvent::Prepared { invariant, .. }
            | ContractEvent::Fulfilled { invariant, .. }
            | ContractEvent::Cancelled { invariant, .. } => Some(invariant.transaction_id),
            ContractEvent::LiquidityRemoved { .. } => None,
        }
    }
}

/// Process-wide publish/subscribe channel for contract events.
pub struct ContractEventBus {
    sender: broadcast::Sender<ContractEvent>,
}

impl ContractEventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }

    /// Publish an event to all current subscribers. Having no subscribers
    /// is not an error.
    pub fn publish(&self, event: ContractEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> EventWaiter {
        EventWaiter {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for ContractEventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered subscriber that can await the first event matching a
/// predicate, bounded by a timeout. Dropping the waiter unregisters it.
pub struct EventWaiter {
    receiver: broadcast::Receiver<ContractEvent>,
}

impl EventWaiter {
    /// Wait until an event satisfying `predicate` arrives or the timeout
    /// elapses. Lagged events (buffer overrun) are skipped rather than
    /// treated as failure.
    pub async fn wait_for<F>(
        &mut self,
        wait: Duration,
        operation: &str,
        mut predicate: F,
    ) -> RouterResult<ContractEvent>
    where
        F: FnMut(&ContractEvent) -> bool,
    {
        let deadline = Instant::now() + wait;
        loop {
            match timeout_at(deadline, self.receiver.recv()).await {
                Ok(Ok(event)) => {
                    if predicate(&event) {
                        return Ok(event);
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(RouterError::Internal(format!(
                        "event bus closed while waiting for {}",
                        operation
                    )))
                }
                Err(_) => {
                    return Err(RouterError::Timeout {
                        operation: operation.to_string(),
                    })
                }
            }
        }
    }
}
