//! Three-tier submission pipeline
//!
//! Every state-changing call goes through the same funnel: a gas pre-check
//! that surfaces reverts before any money moves, then the cheapest
//! submission path that works. When relayed terms are attached the call is
//! first offered to the third-party relay service, then to the peer relayer
//! network as a meta-transaction (exactly one publish per attempt), and
//! only then sent directly from the router's own signer. The relayed tiers
//! report success solely through the contract event bus.

use crate::adapters::{Messaging, MetaTxRequest, RelayRequest, RelayService};
use crate::chain::{ChainGateway, TransactionRequestData};
use crate::error::{RouterError, RouterResult};
use crate::events::{ContractEvent, ContractEventBus};
use crate::types::TransactionReason;

use ethers::types::{Address, Bytes, H256, U256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Which contract event confirms the submission landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitEvent {
    Prepared,
    Fulfilled,
    Cancelled,
}

impl WaitEvent {
    fn matches(&self, event: &ContractEvent, transaction_id: H256) -> bool {
        if event.transaction_id() != Some(transaction_id) {
            return false;
        }
        matches!(
            (self, event),
            (WaitEvent::Prepared, ContractEvent::Prepared { .. })
                | (WaitEvent::Fulfilled, ContractEvent::Fulfilled { .. })
                | (WaitEvent::Cancelled, ContractEvent::Cancelled { .. })
        )
    }
}

/// Fee terms authorizing third parties to submit on the router's behalf.
#[derive(Debug, Clone)]
pub struct RelayedTerms {
    pub fee_asset: Address,
    pub fee: U256,
    pub fee_signature: Bytes,
}

/// One call to submit. `to`/`data` are what the router's own signer would
/// send; the relayed tiers submit the same calldata.
#[derive(Debug, Clone)]
pub struct Submission {
    pub chain_id: u64,
    pub transaction_id: H256,
    pub reason: TransactionReason,
    pub to: Address,
    pub data: Bytes,
    pub event_kind: WaitEvent,
    pub relayed: Option<RelayedTerms>,
}

/// Which tier carried the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionTier {
    Relay,
    MetaTx,
    Direct,
}

#[derive(Debug, Clone)]
pub struct SubmissionOutcome {
    pub tx_hash: H256,
    pub block_number: u64,
    pub tier: SubmissionTier,
}

/// Default window to observe a relayed submission's event on chain.
pub const RELAY_EVENT_WAIT: Duration = Duration::from_secs(300);

pub struct SubmissionPipeline {
    relay: Arc<dyn RelayService>,
    messaging: Arc<dyn Messaging>,
    event_bus: Arc<ContractEventBus>,
    event_wait: Duration,
}

impl SubmissionPipeline {
    pub fn new(
        relay: Arc<dyn RelayService>,
        messaging: Arc<dyn Messaging>,
        event_bus: Arc<ContractEventBus>,
    ) -> Self {
        Self {
            relay,
            messaging,
            event_bus,
            event_wait: RELAY_EVENT_WAIT,
        }
    }

    #[cfg(test)]
    pub fn with_event_wait(mut self, wait: Duration) -> Self {
        self.event_wait = wait;
        self
    }

    /// Run the funnel. A revert from the gas pre-check propagates untouched
    /// so callers can classify duplicates; tier failures short of that fall
    /// through to the next tier.
    pub async fn submit(
        &self,
        gateway: &Arc<dyn ChainGateway>,
        submission: Submission,
    ) -> RouterResult<SubmissionOutcome> {
        let request = TransactionRequestData {
            to: submission.to,
            data: submission.data.clone(),
            value: U256::zero(),
        };

        // reverts cost nothing here and abort every tier
        gateway.estimate_gas(request.clone()).await?;

        if let Some(terms) = &submission.relayed {
            if let Some(outcome) = self.try_relay_service(&submission, terms).await {
                return Ok(outcome);
            }
            if let Some(outcome) = self.try_meta_tx(&submission, terms).await {
                return Ok(outcome);
            }
        }

        let receipt = gateway.submit_and_confirm(request).await?;
        let block_number = receipt.block_number.map(|b| b.as_u64()).unwrap_or(0);
        let gas_cost = receipt
            .gas_used
            .unwrap_or_default()
            .saturating_mul(receipt.effective_gas_price.unwrap_or_default());
        crate::metrics::record_gas_consumed(
            submission.chain_id,
            submission.reason.as_str(),
            gas_cost,
        );

        Ok(SubmissionOutcome {
            tx_hash: receipt.transaction_hash,
            block_number,
            tier: SubmissionTier::Direct,
        })
    }

    /// Tier 1: third-party relay service. `None` means fall through.
    async fn try_relay_service(
        &self,
        submission: &Submission,
        terms: &RelayedTerms,
    ) -> Option<SubmissionOutcome> {
        if !self.relay.is_chain_supported(submission.chain_id) {
            return None;
        }

        // subscribe before submitting so the event cannot slip past
        let mut waiter = self.event_bus.subscribe();

        let task_id = match self
            .relay
            .submit(RelayRequest {
                chain_id: submission.chain_id,
                to: submission.to,
                data: submission.data.clone(),
                fee_asset: terms.fee_asset,
                fee_amount: terms.fee,
            })
            .await
        {
            Ok(task_id) => task_id,
            Err(e) => {
                warn!(
                    transaction_id = ?submission.transaction_id,
                    "Relay service submission failed, trying next tier: {}", e
                );
                return None;
            }
        };

        match self
            .wait_for_event(&mut waiter, submission, "relay service confirmation")
            .await
        {
            Some(outcome) => {
                info!(
                    transaction_id = ?submission.transaction_id,
                    task_id = %task_id,
                    tx_hash = ?outcome.tx_hash,
                    "Relay service carried submission"
                );
                crate::metrics::record_relayer_fee_paid(
                    submission.chain_id,
                    terms.fee_asset,
                    terms.fee,
                );
                Some(SubmissionOutcome {
                    tier: SubmissionTier::Relay,
                    ..outcome
                })
            }
            None => {
                warn!(
                    transaction_id = ?submission.transaction_id,
                    task_id = %task_id,
                    "Relay task produced no event in time, trying next tier"
                );
                None
            }
        }
    }

    /// Tier 2: one meta-transaction publish to the peer relayer network.
    async fn try_meta_tx(
        &self,
        submission: &Submission,
        terms: &RelayedTerms,
    ) -> Option<SubmissionOutcome> {
        let mut waiter = self.event_bus.subscribe();

        if let Err(e) = self
            .messaging
            .publish_meta_tx(MetaTxRequest {
                transaction_id: submission.transaction_id,
                chain_id: submission.chain_id,
                to: submission.to,
                data: submission.data.clone(),
                relayer_fee_asset: terms.fee_asset,
                relayer_fee: terms.fee,
                fee_signature: terms.fee_signature.clone(),
            })
            .await
        {
            warn!(
                transaction_id = ?submission.transaction_id,
                "Meta-tx publish failed, falling back to direct send: {}", e
            );
            return None;
        }

        match self
            .wait_for_event(&mut waiter, submission, "meta-tx confirmation")
            .await
        {
            Some(outcome) => {
                info!(
                    transaction_id = ?submission.transaction_id,
                    tx_hash = ?outcome.tx_hash,
                    "Peer relayer carried submission"
                );
                crate::metrics::record_relayer_fee_paid(
                    submission.chain_id,
                    terms.fee_asset,
                    terms.fee,
                );
                Some(SubmissionOutcome {
                    tier: SubmissionTier::MetaTx,
                    ..outcome
                })
            }
            None => {
                warn!(
                    transaction_id = ?submission.transaction_id,
                    "No event after meta-tx publish, falling back to direct send"
                );
                None
            }
        }
    }

    async fn wait_for_event(
        &self,
        waiter: &mut crate::events::EventWaiter,
        submission: &Submission,
        operation: &str,
    ) -> Option<SubmissionOutcome> {
        let kind = submission.event_kind;
        let chain_id = submission.chain_id;
        let transaction_id = submission.transaction_id;

        waiter
            .wait_for(
                self.event_wait,
                operation,
                move |event| event.chain_id() == chain_id && kind.matches(event, transaction_id),
            )
            .await
            .ok()
            // listeners publish only mined logs, so the event's hash and
            // block are the relayed transaction's receipt data
            .map(|event| SubmissionOutcome {
                tx_hash: event.tx_hash(),
                block_number: match &event {
                    ContractEvent::Prepared { block_number, .. }
                    | ContractEvent::Fulfilled { block_number, .. }
                    | ContractEvent::Cancelled { block_number, .. }
                    | ContractEvent::LiquidityRemoved { block_number, .. } => *block_number,
                },
                tier: SubmissionTier::Direct,
            })
    }
}
