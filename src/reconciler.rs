//! Reconciliation loop and per-transfer state machine
//!
//! Every poll cycle reads the full set of transfers requiring action from
//! the indexing layer and dispatches a handler per transfer. The indexer is
//! the single source of truth: handlers never mutate the view, they submit
//! on-chain actions and let the next poll observe the result. The dedup
//! tracker gates dispatch so a transfer is handled at most once per status.

use crate::adapters::ContractReader;
use crate::cache::AuctionCache;
use crate::chain::ChainManager;
use crate::config::Settings;
use crate::contract::{ContractOperations, SubmissionOutcome};
use crate::error::{RouterError, RouterResult};
use crate::metrics::{self, TransferLabels};
use crate::tracker::HandlingTracker;
use crate::types::{ActiveTransaction, CancelSide, StatusPayload, TransactionHashes};

use ethers::types::{Bytes, H256, U256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Fallback receiver-side expiry margin below the sender lock, used when
/// the indexer has not yet surfaced the receiving variant.
const RECEIVER_EXPIRY_BUFFER: u64 = 24 * 60 * 60;

pub struct Reconciler {
    reader: Arc<dyn ContractReader>,
    operations: Arc<ContractOperations>,
    chain_manager: Arc<ChainManager>,
    tracker: Arc<HandlingTracker>,
    cache: Arc<AuctionCache>,
    settings: Arc<Settings>,
}

impl Reconciler {
    pub fn new(
        reader: Arc<dyn ContractReader>,
        operations: Arc<ContractOperations>,
        chain_manager: Arc<ChainManager>,
        tracker: Arc<HandlingTracker>,
        cache: Arc<AuctionCache>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            reader,
            operations,
            chain_manager,
            tracker,
            cache,
            settings,
        }
    }

    /// Poll forever. Cycle failures are logged and retried on the next
    /// tick; the loop itself never exits.
    pub async fn run(self: Arc<Self>) {
        let period = Duration::from_secs(self.settings.router.poll_interval_secs);
        info!(poll_interval_secs = period.as_secs(), "Reconciler started");

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.poll_once().await;
        }
    }

    /// One reconciliation cycle: housekeeping, then dispatch.
    pub async fn poll_once(self: &Arc<Self>) {
        match self.reader.get_synced_blocks().await {
            Ok(synced) => {
                for (chain_id, block) in synced {
                    let reaped = self.tracker.reap_terminal(chain_id, block);
                    if !reaped.is_empty() {
                        debug!(chain_id, count = reaped.len(), "Reaped terminal tracker entries");
                    }
                }
            }
            Err(e) => warn!("Failed to fetch synced blocks: {}", e),
        }
        self.cache.prune();

        let transactions = match self.reader.get_active_transactions().await {
            Ok(transactions) => transactions,
            Err(e) => {
                warn!("Failed to fetch active transactions: {}", e);
                return;
            }
        };
        metrics::record_active_transactions(transactions.len());

        let dispatch_delay = Duration::from_millis(self.settings.router.dispatch_delay_ms);
        for transaction in transactions {
            let transaction_id = transaction.transaction_id();
            let status = transaction.status();
            let chain_id = transaction.action_chain_id();

            // the claim must land before the task is spawned, otherwise the
            // next cycle could dispatch the same transfer again
            if !self
                .tracker
                .try_begin_processing(transaction_id, status, chain_id)
            {
                debug!(
                    transaction_id = ?transaction_id,
                    status = status.as_str(),
                    "Already handled or in flight, skipping"
                );
                continue;
            }

            let handler = self.clone();
            tokio::spawn(async move {
                handler.process(transaction).await;
            });

            // spread dispatches so the gateways are not hit in a burst
            tokio::time::sleep(dispatch_delay).await;
        }

        metrics::record_tracked_transactions(self.tracker.len());
    }

    /// Drive one claimed transfer to completion and settle its tracker
    /// entry. Committed entries record the confirmed block so the reaper
    /// can wait for the indexer to pass it.
    pub async fn process(&self, transaction: ActiveTransaction) {
        let transaction_id = transaction.transaction_id();
        let status = transaction.status();
        let chain_id = transaction.action_chain_id();

        match self.handle_single(&transaction).await {
            Ok(Some(outcome)) if outcome.block_number > 0 => {
                self.tracker
                    .commit(transaction_id, status, chain_id, outcome.block_number);
            }
            Ok(_) => {
                // nothing landed, or no block to wait behind: let the next
                // poll take another look
                self.tracker.discard(transaction_id);
            }
            Err(e) => {
                error!(
                    transaction_id = ?transaction_id,
                    status = status.as_str(),
                    "Handling failed: {}", e
                );
                self.tracker.discard(transaction_id);
            }
        }
    }

    /// The per-transfer state machine. Returns `Ok(None)` when nothing was
    /// submitted this cycle, either because a precondition is not yet met
    /// (soft skip) or because someone else already performed the action.
    pub async fn handle_single(
        &self,
        transaction: &ActiveTransaction,
    ) -> RouterResult<Option<SubmissionOutcome>> {
        match &transaction.action {
            StatusPayload::SenderPrepared {
                hashes,
                bid_signature,
                encoded_bid,
                encrypted_call_data,
            } => {
                self.handle_sender_prepared(
                    transaction,
                    hashes,
                    bid_signature,
                    encoded_bid,
                    encrypted_call_data,
                )
                .await
            }
            StatusPayload::ReceiverFulfilled {
                hashes,
                signature,
                call_data,
                relayer_fee,
            } => {
                self.handle_receiver_fulfilled(transaction, hashes, signature, call_data, *relayer_fee)
                    .await
            }
            StatusPayload::ReceiverExpired { hashes } => {
                self.handle_receiver_expired(transaction, hashes).await
            }
            StatusPayload::SenderExpired { hashes } => {
                self.handle_sender_expired(transaction, hashes).await
            }
            StatusPayload::ReceiverCancelled { hashes } => {
                self.handle_receiver_cancelled(transaction, hashes).await
            }
            StatusPayload::ReceiverNotConfigured { hashes } => {
                self.handle_receiver_not_configured(transaction, hashes).await
            }
        }
    }

    /// Sender lock observed; owe a receiver-side prepare.
    async fn handle_sender_prepared(
        &self,
        transaction: &ActiveTransaction,
        hashes: &TransactionHashes,
        bid_signature: &Bytes,
        encoded_bid: &Bytes,
        encrypted_call_data: &Bytes,
    ) -> RouterResult<Option<SubmissionOutcome>> {
        let invariant = &transaction.crosschain.invariant;
        let transaction_id = invariant.transaction_id;
        let labels = self.transfer_labels(transaction);

        let sending_hashes = match &hashes.sending {
            Some(sending) => sending,
            None => {
                warn!(
                    transaction_id = ?transaction_id,
                    "Sender prepare observed without a sending-side hash, skipping"
                );
                return Ok(None);
            }
        };

        if !self
            .has_confirmations(invariant.sending_chain_id, sending_hashes.prepare_hash)
            .await?
        {
            debug!(
                transaction_id = ?transaction_id,
                "Sender prepare not yet at confirmation depth"
            );
            return Ok(None);
        }

        if !self.cache.confirm_bid(
            invariant.receiving_chain_id,
            invariant.receiving_asset_id,
            transaction_id,
        ) {
            // no live reservation; liquidity may be transiently overstated
            // in quoting, which is safe
            warn!(
                transaction_id = ?transaction_id,
                "No live bid reservation for prepare, proceeding"
            );
        }

        // the indexer may not have surfaced the receiving variant yet;
        // fall back to the sender terms with a shortened expiry
        let (amount, expiry) = match &transaction.crosschain.receiving {
            Some(receiving) => (receiving.amount, receiving.expiry),
            None => (
                transaction.crosschain.sending.amount,
                transaction
                    .crosschain
                    .sending
                    .expiry
                    .saturating_sub(RECEIVER_EXPIRY_BUFFER),
            ),
        };

        let result = self
            .operations
            .prepare(
                invariant.receiving_chain_id,
                invariant,
                amount,
                expiry,
                encrypted_call_data,
                encoded_bid,
                bid_signature,
            )
            .await;

        // the reservation is released on every outcome; on success the
        // liquidity is now locked in the transfer on chain
        self.cache.remove_bid(
            invariant.receiving_chain_id,
            invariant.receiving_asset_id,
            transaction_id,
        );

        match result {
            Ok(outcome) => {
                info!(
                    transaction_id = ?transaction_id,
                    tx_hash = ?outcome.tx_hash,
                    "Receiver side prepared"
                );
                metrics::inc_transfer_counter(&metrics::SUCCESSFUL_AUCTION, &labels);
                metrics::inc_transfer_counter(&metrics::SENDER_PREPARED, &labels);
                metrics::inc_transfer_counter(&metrics::RECEIVER_PREPARED, &labels);
                metrics::inc_transfer_counter(&metrics::ATTEMPTED_TRANSFER, &labels);
                Ok(Some(outcome))
            }
            Err(e) => {
                metrics::inc_transfer_counter(&metrics::RECEIVER_FAILED_PREPARE, &labels);

                if e.is_already_performed() {
                    warn!(
                        transaction_id = ?transaction_id,
                        "Receiver side already prepared elsewhere: {}", e
                    );
                    return Ok(None);
                }

                if e.is_cancellable() {
                    warn!(
                        transaction_id = ?transaction_id,
                        "Prepare failed, unwinding sender side: {}", e
                    );
                    return self
                        .compensating_sender_cancel(transaction, &labels, true)
                        .await;
                }

                Err(e)
            }
        }
    }

    /// User's secret released on the receiving chain; reclaim the sender
    /// lock.
    async fn handle_receiver_fulfilled(
        &self,
        transaction: &ActiveTransaction,
        hashes: &TransactionHashes,
        signature: &Bytes,
        call_data: &Bytes,
        relayer_fee: U256,
    ) -> RouterResult<Option<SubmissionOutcome>> {
        let invariant = &transaction.crosschain.invariant;
        let transaction_id = invariant.transaction_id;
        let labels = self.transfer_labels(transaction);

        let fulfill_hash = match hashes.receiving.as_ref().and_then(|r| r.fulfill_hash) {
            Some(hash) => hash,
            None => {
                warn!(
                    transaction_id = ?transaction_id,
                    "Receiver fulfill observed without its hash, skipping"
                );
                return Ok(None);
            }
        };

        if !self
            .has_confirmations(invariant.receiving_chain_id, fulfill_hash)
            .await?
        {
            debug!(
                transaction_id = ?transaction_id,
                "Receiver fulfill not yet at confirmation depth"
            );
            return Ok(None);
        }

        let sending = transaction.crosschain.sending.clone();
        let result = self
            .operations
            .fulfill(
                invariant.sending_chain_id,
                invariant,
                &sending,
                relayer_fee,
                signature,
                call_data,
            )
            .await;

        match result {
            Ok(outcome) => {
                info!(
                    transaction_id = ?transaction_id,
                    tx_hash = ?outcome.tx_hash,
                    "Sender side fulfilled, transfer complete"
                );
                metrics::inc_transfer_counter(&metrics::COMPLETED_TRANSFER, &labels);
                metrics::inc_transfer_counter(&metrics::RECEIVER_FULFILLED, &labels);
                metrics::inc_transfer_counter(&metrics::SENDER_FULFILLED, &labels);

                self.record_transfer_financials(transaction);

                Ok(Some(outcome))
            }
            Err(e) => {
                metrics::inc_transfer_counter(&metrics::SENDER_FAILED_FULFILL, &labels);
                if e.is_already_performed() {
                    warn!(
                        transaction_id = ?transaction_id,
                        "Sender side already fulfilled elsewhere: {}", e
                    );
                    return Ok(None);
                }
                Err(e)
            }
        }
    }

    /// Receiver lock passed expiry unfulfilled; reclaim the receiver side.
    async fn handle_receiver_expired(
        &self,
        transaction: &ActiveTransaction,
        hashes: &TransactionHashes,
    ) -> RouterResult<Option<SubmissionOutcome>> {
        let invariant = &transaction.crosschain.invariant;
        let transaction_id = invariant.transaction_id;
        let labels = self.transfer_labels(transaction);

        if hashes.receiving.is_none() {
            warn!(
                transaction_id = ?transaction_id,
                "Receiver expiry without receiving-side hashes, skipping"
            );
            return Ok(None);
        }
        let receiving = match &transaction.crosschain.receiving {
            Some(receiving) => receiving.clone(),
            None => {
                warn!(
                    transaction_id = ?transaction_id,
                    "Receiver expiry without receiving variant data, skipping"
                );
                return Ok(None);
            }
        };

        let result = self
            .operations
            .cancel(
                CancelSide::Receiver,
                invariant.receiving_chain_id,
                invariant,
                &receiving,
            )
            .await;

        match result {
            Ok(outcome) => {
                info!(
                    transaction_id = ?transaction_id,
                    tx_hash = ?outcome.tx_hash,
                    "Expired receiver side cancelled"
                );
                metrics::inc_transfer_counter(&metrics::RECEIVER_CANCELLED, &labels);
                metrics::inc_transfer_counter(&metrics::RECEIVER_EXPIRED, &labels);
                Ok(Some(outcome))
            }
            Err(e) => {
                metrics::inc_transfer_counter(&metrics::RECEIVER_FAILED_CANCEL, &labels);
                if e.is_already_performed() {
                    warn!(
                        transaction_id = ?transaction_id,
                        "Receiver side already cancelled elsewhere: {}", e
                    );
                    return Ok(None);
                }
                Err(e)
            }
        }
    }

    /// Sender lock expired; unwind it. If the receiver side also needs
    /// cancelling, the expired-receiver arm handles that on its own cycle.
    async fn handle_sender_expired(
        &self,
        transaction: &ActiveTransaction,
        hashes: &TransactionHashes,
    ) -> RouterResult<Option<SubmissionOutcome>> {
        let invariant = &transaction.crosschain.invariant;
        let transaction_id = invariant.transaction_id;
        let labels = self.transfer_labels(transaction);

        if hashes.sending.is_none() {
            warn!(
                transaction_id = ?transaction_id,
                "Sender expiry without sending-side hashes, skipping"
            );
            return Ok(None);
        }

        let result = self
            .operations
            .cancel(
                CancelSide::Sender,
                invariant.sending_chain_id,
                invariant,
                &transaction.crosschain.sending,
            )
            .await;

        match result {
            Ok(outcome) => {
                info!(
                    transaction_id = ?transaction_id,
                    tx_hash = ?outcome.tx_hash,
                    "Expired sender side cancelled"
                );
                metrics::inc_transfer_counter(&metrics::SENDER_CANCELLED, &labels);
                metrics::inc_transfer_counter(&metrics::SENDER_EXPIRED, &labels);
                Ok(Some(outcome))
            }
            Err(e) => {
                if e.is_already_performed() {
                    warn!(
                        transaction_id = ?transaction_id,
                        "Sender side already cancelled elsewhere: {}", e
                    );
                    return Ok(None);
                }
                Err(e)
            }
        }
    }

    /// Receiver side cancelled; propagate the cancellation to the sender
    /// lock once the receiving-chain cancel is confirmed.
    async fn handle_receiver_cancelled(
        &self,
        transaction: &ActiveTransaction,
        hashes: &TransactionHashes,
    ) -> RouterResult<Option<SubmissionOutcome>> {
        let invariant = &transaction.crosschain.invariant;
        let transaction_id = invariant.transaction_id;
        let labels = self.transfer_labels(transaction);

        if hashes.sending.is_none() {
            warn!(
                transaction_id = ?transaction_id,
                "Receiver cancel without sending-side hashes, skipping"
            );
            return Ok(None);
        }
        let cancel_hash = match hashes.receiving.as_ref().and_then(|r| r.cancel_hash) {
            Some(hash) => hash,
            None => {
                warn!(
                    transaction_id = ?transaction_id,
                    "Receiver cancel observed without its hash, skipping"
                );
                return Ok(None);
            }
        };

        if !self
            .has_confirmations(invariant.receiving_chain_id, cancel_hash)
            .await?
        {
            debug!(
                transaction_id = ?transaction_id,
                "Receiver cancel not yet at confirmation depth"
            );
            return Ok(None);
        }

        self.compensating_sender_cancel(transaction, &labels, false)
            .await
    }

    /// The receiving chain is not serviced by this router; the user's
    /// sender lock can never complete, unwind it.
    async fn handle_receiver_not_configured(
        &self,
        transaction: &ActiveTransaction,
        hashes: &TransactionHashes,
    ) -> RouterResult<Option<SubmissionOutcome>> {
        let transaction_id = transaction.transaction_id();
        let labels = self.transfer_labels(transaction);

        if hashes.sending.is_none() {
            warn!(
                transaction_id = ?transaction_id,
                "Unconfigured receiver chain without sending-side hashes, skipping"
            );
            return Ok(None);
        }

        self.compensating_sender_cancel(transaction, &labels, false)
            .await
    }

    /// Cancel the sender-side lock. Shared by the compensation path of a
    /// failed prepare and the arms that propagate a dead receiver side.
    async fn compensating_sender_cancel(
        &self,
        transaction: &ActiveTransaction,
        labels: &TransferLabels,
        after_failed_prepare: bool,
    ) -> RouterResult<Option<SubmissionOutcome>> {
        let invariant = &transaction.crosschain.invariant;
        let transaction_id = invariant.transaction_id;

        let result = self
            .operations
            .cancel(
                CancelSide::Sender,
                invariant.sending_chain_id,
                invariant,
                &transaction.crosschain.sending,
            )
            .await;

        match result {
            Ok(outcome) => {
                info!(
                    transaction_id = ?transaction_id,
                    tx_hash = ?outcome.tx_hash,
                    "Sender side cancelled"
                );
                metrics::inc_transfer_counter(&metrics::SENDER_CANCELLED, labels);
                if after_failed_prepare {
                    // the auction still resolved, just to a cancellation
                    metrics::inc_transfer_counter(&metrics::SUCCESSFUL_AUCTION, labels);
                }
                Ok(Some(outcome))
            }
            Err(e) => {
                metrics::inc_transfer_counter(&metrics::SENDER_FAILED_CANCEL, labels);
                if e.is_already_performed() {
                    warn!(
                        transaction_id = ?transaction_id,
                        "Sender side already cancelled elsewhere: {}", e
                    );
                    return Ok(None);
                }
                if after_failed_prepare {
                    // the prepare error was already reported; do not let the
                    // compensation error mask it in the tracker path
                    error!(
                        transaction_id = ?transaction_id,
                        "Failed to unwind sender side after failed prepare: {}", e
                    );
                    return Ok(None);
                }
                Err(e)
            }
        }
    }

    /// Spread and volume accounting for a completed transfer, detached so
    /// a slow metrics path cannot delay the fulfill result.
    fn record_transfer_financials(&self, transaction: &ActiveTransaction) {
        let invariant = transaction.crosschain.invariant.clone();
        let sending_amount = transaction.crosschain.sending.amount;
        let receiving_amount = transaction
            .crosschain
            .receiving
            .as_ref()
            .map(|r| r.amount)
            .unwrap_or(sending_amount);
        let settings = self.settings.clone();

        tokio::spawn(async move {
            let receiving_name =
                settings.asset_name(invariant.receiving_chain_id, invariant.receiving_asset_id);
            metrics::record_transferred_volume(
                invariant.receiving_chain_id,
                &receiving_name,
                receiving_amount,
            );

            let fees = sending_amount.saturating_sub(receiving_amount);
            if !fees.is_zero() {
                let sending_name =
                    settings.asset_name(invariant.sending_chain_id, invariant.sending_asset_id);
                metrics::record_fees_collected(invariant.sending_chain_id, &sending_name, fees);
            }
        });
    }

    fn transfer_labels(&self, transaction: &ActiveTransaction) -> TransferLabels {
        let invariant = &transaction.crosschain.invariant;
        TransferLabels {
            sending_chain_id: invariant.sending_chain_id,
            receiving_chain_id: invariant.receiving_chain_id,
            asset_name: self
                .settings
                .asset_name(invariant.sending_chain_id, invariant.sending_asset_id),
        }
    }

    /// Whether a mined transaction has reached the chain's configured
    /// confirmation depth.
    async fn has_confirmations(&self, chain_id: u64, tx_hash: H256) -> RouterResult<bool> {
        let gateway = self.chain_manager.get_gateway(chain_id)?;
        let required = self
            .settings
            .get_chain_by_id(chain_id)
            .ok_or(RouterError::ChainNotConfigured { chain_id })?
            .confirmations;
        let confirmations = gateway.get_confirmations(tx_hash).await?;
        Ok(confirmations >= required)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::messaging::MockMessaging;
    use crate::adapters::relay::MockRelayService;
    use crate::adapters::subgraph::MockContractReader;
    use crate::chain::gateway::MockChainGateway;
    use crate::chain::ChainGateway;
    use crate::contract::encode;
    use crate::contract::SubmissionPipeline;
    use crate::events::ContractEventBus;
    use crate::tracker::{HandlingTracker, TrackedStatus};
    use crate::types::{
        CrosschainTransaction, InvariantTransactionData, ReceivingHashes, SendingHashes, Status,
        TransactionHashes, VariantData,
    };
    use ethers::signers::LocalWallet;
    use ethers::types::{Address, Bytes, TransactionReceipt};
    use std::collections::HashMap;

    const SENDING_CHAIN: u64 = 1337;
    const RECEIVING_CHAIN: u64 = 1338;

    fn settings() -> Arc<Settings> {
        Arc::new(
            toml::from_str(
                r#"
                [router]
                dispatch_delay_ms = 0

                [metrics]
                enabled = false
                port = 9090

                [relay]
                endpoint = "https://relay.example.com"

                [messaging]
                endpoint = "https://messaging.example.com"

                [chains.sending]
                chain_id = 1337
                name = "sending"
                providers = ["http://localhost:8545"]
                transaction_manager_address = "0x0000000000000000000000000000000000000008"
                subgraph = ["http://localhost:8000"]
                confirmations = 2

                [chains.receiving]
                chain_id = 1338
                name = "receiving"
                providers = ["http://localhost:8546"]
                transaction_manager_address = "0x0000000000000000000000000000000000000009"
                subgraph = ["http://localhost:8001"]
                confirmations = 2
                "#,
            )
            .unwrap(),
        )
    }

    fn wallet() -> LocalWallet {
        "0000000000000000000000000000000000000000000000000000000000000001"
            .parse()
            .unwrap()
    }

    fn invariant() -> InvariantTransactionData {
        InvariantTransactionData {
            transaction_id: H256::from_low_u64_be(1),
            user: Address::from_low_u64_be(2),
            router: Address::from_low_u64_be(3),
            initiator: Address::from_low_u64_be(2),
            sending_asset_id: Address::zero(),
            receiving_asset_id: Address::zero(),
            sending_chain_fallback: Address::from_low_u64_be(2),
            call_to: Address::zero(),
            receiving_address: Address::from_low_u64_be(4),
            call_data_hash: H256::zero(),
            sending_chain_id: SENDING_CHAIN,
            receiving_chain_id: RECEIVING_CHAIN,
            receiving_chain_tx_manager_address: Address::from_low_u64_be(9),
        }
    }

    fn sending_variant() -> VariantData {
        VariantData {
            amount: U256::from(1000u64),
            expiry: 4_000_000_000,
            prepared_block_number: 10,
        }
    }

    fn sender_prepared_tx() -> ActiveTransaction {
        ActiveTransaction {
            crosschain: CrosschainTransaction {
                invariant: invariant(),
                sending: sending_variant(),
                receiving: None,
            },
            action: StatusPayload::SenderPrepared {
                hashes: TransactionHashes {
                    sending: Some(SendingHashes {
                        prepare_hash: H256::from_low_u64_be(0xaa),
                        cancel_hash: None,
                    }),
                    receiving: None,
                },
                bid_signature: Bytes::from(vec![1]),
                encoded_bid: Bytes::from(vec![2]),
                encrypted_call_data: Bytes::new(),
            },
        }
    }

    fn receiver_fulfilled_tx() -> ActiveTransaction {
        ActiveTransaction {
            crosschain: CrosschainTransaction {
                invariant: invariant(),
                sending: sending_variant(),
                receiving: Some(VariantData {
                    amount: U256::from(990u64),
                    expiry: 3_999_000_000,
                    prepared_block_number: 20,
                }),
            },
            action: StatusPayload::ReceiverFulfilled {
                hashes: TransactionHashes {
                    sending: Some(SendingHashes {
                        prepare_hash: H256::from_low_u64_be(0xaa),
                        cancel_hash: None,
                    }),
                    receiving: Some(ReceivingHashes {
                        prepare_hash: Some(H256::from_low_u64_be(0xbb)),
                        fulfill_hash: Some(H256::from_low_u64_be(0xcc)),
                        cancel_hash: None,
                    }),
                },
                signature: Bytes::from(vec![9]),
                call_data: Bytes::new(),
                relayer_fee: U256::zero(),
            },
        }
    }

    fn sender_expired_tx() -> ActiveTransaction {
        ActiveTransaction {
            crosschain: CrosschainTransaction {
                invariant: invariant(),
                sending: sending_variant(),
                receiving: None,
            },
            action: StatusPayload::SenderExpired {
                hashes: TransactionHashes {
                    sending: Some(SendingHashes {
                        prepare_hash: H256::from_low_u64_be(0xaa),
                        cancel_hash: None,
                    }),
                    receiving: None,
                },
            },
        }
    }

    fn receiver_not_configured_tx() -> ActiveTransaction {
        ActiveTransaction {
            crosschain: CrosschainTransaction {
                invariant: invariant(),
                sending: sending_variant(),
                receiving: None,
            },
            action: StatusPayload::ReceiverNotConfigured {
                hashes: TransactionHashes {
                    sending: Some(SendingHashes {
                        prepare_hash: H256::from_low_u64_be(0xaa),
                        cancel_hash: None,
                    }),
                    receiving: None,
                },
            },
        }
    }

    fn receipt(block: u64) -> TransactionReceipt {
        TransactionReceipt {
            transaction_hash: H256::from_low_u64_be(55),
            block_number: Some(block.into()),
            gas_used: Some(U256::from(21000u64)),
            effective_gas_price: Some(U256::from(2u64)),
            status: Some(1.into()),
            ..Default::default()
        }
    }

    fn zero_word() -> Bytes {
        Bytes::from(vec![0u8; 32])
    }

    struct Fixture {
        reconciler: Arc<Reconciler>,
        tracker: Arc<HandlingTracker>,
        cache: Arc<AuctionCache>,
    }

    fn fixture(
        sending: MockChainGateway,
        receiving: MockChainGateway,
        reader: MockContractReader,
    ) -> Fixture {
        fixture_with_settings(settings(), sending, receiving, reader)
    }

    fn fixture_with_settings(
        settings: Arc<Settings>,
        sending: MockChainGateway,
        receiving: MockChainGateway,
        reader: MockContractReader,
    ) -> Fixture {
        let event_bus = Arc::new(ContractEventBus::new());
        let sending: Arc<dyn ChainGateway> = Arc::new(sending);
        let receiving: Arc<dyn ChainGateway> = Arc::new(receiving);
        let chain_manager = Arc::new(ChainManager::from_gateways(
            vec![sending, receiving],
            event_bus.clone(),
        ));
        let pipeline = SubmissionPipeline::new(
            Arc::new(MockRelayService::new()),
            Arc::new(MockMessaging::new()),
            event_bus,
        );
        let operations = Arc::new(
            ContractOperations::new(&settings, chain_manager.clone(), pipeline, wallet()).unwrap(),
        );
        let tracker = Arc::new(HandlingTracker::new());
        let cache = Arc::new(AuctionCache::new());
        let reconciler = Arc::new(Reconciler::new(
            Arc::new(reader),
            operations,
            chain_manager,
            tracker.clone(),
            cache.clone(),
            settings,
        ));
        Fixture {
            reconciler,
            tracker,
            cache,
        }
    }

    fn sending_gateway() -> MockChainGateway {
        let mut mock = MockChainGateway::new();
        mock.expect_chain_id().return_const(SENDING_CHAIN);
        mock
    }

    fn receiving_gateway() -> MockChainGateway {
        let mut mock = MockChainGateway::new();
        mock.expect_chain_id().return_const(RECEIVING_CHAIN);
        mock
    }

    #[tokio::test]
    async fn in_flight_transfer_is_not_redispatched() {
        let mut sending = sending_gateway();
        sending.expect_get_confirmations().times(0);
        sending.expect_submit_and_confirm().times(0);
        let mut receiving = receiving_gateway();
        receiving.expect_read().times(0);
        receiving.expect_submit_and_confirm().times(0);

        let mut reader = MockContractReader::new();
        reader
            .expect_get_synced_blocks()
            .returning(|| Ok(HashMap::new()));
        reader
            .expect_get_active_transactions()
            .returning(|| Ok(vec![sender_prepared_tx()]));

        let f = fixture(sending, receiving, reader);
        // a previous cycle already claimed this transfer
        assert!(f.tracker.try_begin_processing(
            H256::from_low_u64_be(1),
            Status::SenderPrepared,
            RECEIVING_CHAIN
        ));

        f.reconciler.poll_once().await;

        let entry = f.tracker.get(H256::from_low_u64_be(1)).unwrap();
        assert_eq!(entry.status, TrackedStatus::Processing);
    }

    #[tokio::test]
    async fn sender_prepared_prepares_receiver_and_releases_bid() {
        let mut sending = sending_gateway();
        sending
            .expect_get_confirmations()
            .times(1)
            .returning(|_| Ok(5));

        let mut receiving = receiving_gateway();
        // sanitation: the receiver-side slot must be empty
        receiving
            .expect_read()
            .times(1)
            .returning(|_| Ok(zero_word()));
        receiving
            .expect_estimate_gas()
            .returning(|_| Ok(U256::from(200_000u64)));
        receiving
            .expect_submit_and_confirm()
            .times(1)
            .returning(|_| Ok(receipt(12)));

        let f = fixture(sending, receiving, MockContractReader::new());
        let tx = sender_prepared_tx();
        let id = tx.transaction_id();
        f.cache
            .add_bid(RECEIVING_CHAIN, Address::zero(), id, U256::from(1000u64));
        assert!(f
            .tracker
            .try_begin_processing(id, Status::SenderPrepared, RECEIVING_CHAIN));

        f.reconciler.process(tx).await;

        let entry = f.tracker.get(id).unwrap();
        assert_eq!(entry.status, TrackedStatus::Completed(Status::SenderPrepared));
        assert_eq!(entry.chain_id, RECEIVING_CHAIN);
        assert_eq!(entry.block, 12);
        // reservation released on success
        assert_eq!(
            f.cache.outstanding_liquidity(RECEIVING_CHAIN, Address::zero()),
            U256::zero()
        );
    }

    #[tokio::test]
    async fn prepare_waits_for_sender_confirmation_depth() {
        let mut sending = sending_gateway();
        // one confirmation, two required
        sending
            .expect_get_confirmations()
            .times(1)
            .returning(|_| Ok(1));

        let mut receiving = receiving_gateway();
        receiving.expect_read().times(0);
        receiving.expect_submit_and_confirm().times(0);

        let f = fixture(sending, receiving, MockContractReader::new());
        let tx = sender_prepared_tx();
        let id = tx.transaction_id();
        assert!(f
            .tracker
            .try_begin_processing(id, Status::SenderPrepared, RECEIVING_CHAIN));

        f.reconciler.process(tx).await;

        // soft skip: the claim is released so the next poll can retry
        assert!(f.tracker.get(id).is_none());
    }

    #[tokio::test]
    async fn bid_released_even_when_prepare_reverts_as_duplicate() {
        let mut sending = sending_gateway();
        sending
            .expect_get_confirmations()
            .times(1)
            .returning(|_| Ok(5));
        // duplicate revert is idempotent success, never compensated
        sending.expect_submit_and_confirm().times(0);

        let mut receiving = receiving_gateway();
        receiving
            .expect_read()
            .times(1)
            .returning(|_| Ok(zero_word()));
        receiving.expect_estimate_gas().returning(|_| {
            Err(crate::error::RouterError::ContractRevert {
                chain_id: RECEIVING_CHAIN,
                reason: "execution reverted: #P:015".to_string(),
            })
        });
        receiving.expect_submit_and_confirm().times(0);

        let f = fixture(sending, receiving, MockContractReader::new());
        let tx = sender_prepared_tx();
        let id = tx.transaction_id();
        f.cache
            .add_bid(RECEIVING_CHAIN, Address::zero(), id, U256::from(1000u64));
        assert!(f
            .tracker
            .try_begin_processing(id, Status::SenderPrepared, RECEIVING_CHAIN));

        f.reconciler.process(tx).await;

        assert!(f.tracker.get(id).is_none());
        assert_eq!(
            f.cache.outstanding_liquidity(RECEIVING_CHAIN, Address::zero()),
            U256::zero()
        );
    }

    #[tokio::test]
    async fn cancellable_prepare_failure_unwinds_sender_side() {
        let mut sending = sending_gateway();
        sending
            .expect_get_confirmations()
            .times(1)
            .returning(|_| Ok(5));
        // compensation path: sanitation for the sender-side cancel
        let sender_variant_word =
            Bytes::from(encode::variant_hash(&sending_variant()).as_bytes().to_vec());
        sending
            .expect_read()
            .times(1)
            .returning(move |_| Ok(sender_variant_word.clone()));
        sending
            .expect_estimate_gas()
            .returning(|_| Ok(U256::from(90_000u64)));
        sending
            .expect_submit_and_confirm()
            .times(1)
            .returning(|_| Ok(receipt(30)));

        let mut receiving = receiving_gateway();
        receiving
            .expect_read()
            .times(1)
            .returning(|_| Ok(zero_word()));
        receiving.expect_estimate_gas().returning(|_| {
            Err(crate::error::RouterError::ContractRevert {
                chain_id: RECEIVING_CHAIN,
                reason: "execution reverted: INVALID_EXPIRY".to_string(),
            })
        });
        receiving.expect_submit_and_confirm().times(0);

        let f = fixture(sending, receiving, MockContractReader::new());
        let tx = sender_prepared_tx();
        let id = tx.transaction_id();
        assert!(f
            .tracker
            .try_begin_processing(id, Status::SenderPrepared, RECEIVING_CHAIN));

        f.reconciler.process(tx).await;

        // the cancel landed, so the entry commits under the original status
        let entry = f.tracker.get(id).unwrap();
        assert_eq!(entry.status, TrackedStatus::Completed(Status::SenderPrepared));
        assert_eq!(entry.block, 30);
    }

    #[tokio::test]
    async fn fulfilled_receiver_reclaims_sender_lock() {
        let mut sending = sending_gateway();
        let sender_variant_word =
            Bytes::from(encode::variant_hash(&sending_variant()).as_bytes().to_vec());
        sending
            .expect_read()
            .times(1)
            .returning(move |_| Ok(sender_variant_word.clone()));
        sending
            .expect_estimate_gas()
            .returning(|_| Ok(U256::from(120_000u64)));
        sending
            .expect_submit_and_confirm()
            .times(1)
            .returning(|_| Ok(receipt(40)));

        let mut receiving = receiving_gateway();
        receiving
            .expect_get_confirmations()
            .times(1)
            .returning(|_| Ok(7));
        receiving.expect_submit_and_confirm().times(0);

        let f = fixture(sending, receiving, MockContractReader::new());
        let tx = receiver_fulfilled_tx();
        let id = tx.transaction_id();
        assert!(f
            .tracker
            .try_begin_processing(id, Status::ReceiverFulfilled, SENDING_CHAIN));

        f.reconciler.process(tx).await;

        let entry = f.tracker.get(id).unwrap();
        assert_eq!(
            entry.status,
            TrackedStatus::Completed(Status::ReceiverFulfilled)
        );
        assert_eq!(entry.chain_id, SENDING_CHAIN);
        assert_eq!(entry.block, 40);
    }

    #[tokio::test]
    async fn duplicate_fulfill_is_idempotent_success() {
        let mut sending = sending_gateway();
        let sender_variant_word =
            Bytes::from(encode::variant_hash(&sending_variant()).as_bytes().to_vec());
        sending
            .expect_read()
            .times(1)
            .returning(move |_| Ok(sender_variant_word.clone()));
        sending.expect_estimate_gas().returning(|_| {
            Err(crate::error::RouterError::ContractRevert {
                chain_id: SENDING_CHAIN,
                reason: "execution reverted: #F:019".to_string(),
            })
        });
        sending.expect_submit_and_confirm().times(0);

        let mut receiving = receiving_gateway();
        receiving
            .expect_get_confirmations()
            .times(1)
            .returning(|_| Ok(7));

        let f = fixture(sending, receiving, MockContractReader::new());
        let tx = receiver_fulfilled_tx();
        let id = tx.transaction_id();
        assert!(f
            .tracker
            .try_begin_processing(id, Status::ReceiverFulfilled, SENDING_CHAIN));

        f.reconciler.process(tx).await;

        // nothing landed this cycle; the indexer will stop producing the
        // status once it observes the external fulfill
        assert!(f.tracker.get(id).is_none());
    }

    #[tokio::test]
    async fn receiver_expiry_without_hashes_is_skipped() {
        let mut sending = sending_gateway();
        sending.expect_submit_and_confirm().times(0);
        let mut receiving = receiving_gateway();
        receiving.expect_read().times(0);
        receiving.expect_submit_and_confirm().times(0);

        let f = fixture(sending, receiving, MockContractReader::new());
        let tx = ActiveTransaction {
            crosschain: CrosschainTransaction {
                invariant: invariant(),
                sending: sending_variant(),
                receiving: None,
            },
            action: StatusPayload::ReceiverExpired {
                hashes: TransactionHashes::default(),
            },
        };
        let id = tx.transaction_id();
        assert!(f
            .tracker
            .try_begin_processing(id, Status::ReceiverExpired, SENDING_CHAIN));

        f.reconciler.process(tx).await;

        assert!(f.tracker.get(id).is_none());
    }

    #[tokio::test]
    async fn receiver_cancel_gated_on_confirmation_depth() {
        let mut sending = sending_gateway();
        sending.expect_read().times(0);
        sending.expect_submit_and_confirm().times(0);
        let mut receiving = receiving_gateway();
        receiving
            .expect_get_confirmations()
            .times(1)
            .returning(|_| Ok(1));

        let f = fixture(sending, receiving, MockContractReader::new());
        let tx = ActiveTransaction {
            crosschain: CrosschainTransaction {
                invariant: invariant(),
                sending: sending_variant(),
                receiving: Some(VariantData {
                    amount: U256::from(990u64),
                    expiry: 3_999_000_000,
                    prepared_block_number: 20,
                }),
            },
            action: StatusPayload::ReceiverCancelled {
                hashes: TransactionHashes {
                    sending: Some(SendingHashes {
                        prepare_hash: H256::from_low_u64_be(0xaa),
                        cancel_hash: None,
                    }),
                    receiving: Some(ReceivingHashes {
                        prepare_hash: Some(H256::from_low_u64_be(0xbb)),
                        fulfill_hash: None,
                        cancel_hash: Some(H256::from_low_u64_be(0xdd)),
                    }),
                },
            },
        };
        let id = tx.transaction_id();
        assert!(f
            .tracker
            .try_begin_processing(id, Status::ReceiverCancelled, SENDING_CHAIN));

        f.reconciler.process(tx).await;

        assert!(f.tracker.get(id).is_none());
    }

    #[tokio::test]
    async fn expired_sender_lock_is_reclaimed() {
        let mut sending = sending_gateway();
        // sanitation: the sender-side slot must still hold the lock
        let sender_variant_word =
            Bytes::from(encode::variant_hash(&sending_variant()).as_bytes().to_vec());
        sending
            .expect_read()
            .times(1)
            .returning(move |_| Ok(sender_variant_word.clone()));
        sending
            .expect_estimate_gas()
            .returning(|_| Ok(U256::from(90_000u64)));
        sending
            .expect_submit_and_confirm()
            .times(1)
            .returning(|_| Ok(receipt(44)));

        let mut receiving = receiving_gateway();
        // only the sender side is unwound here
        receiving.expect_read().times(0);
        receiving.expect_submit_and_confirm().times(0);

        let f = fixture(sending, receiving, MockContractReader::new());
        let tx = sender_expired_tx();
        let id = tx.transaction_id();
        assert!(f
            .tracker
            .try_begin_processing(id, Status::SenderExpired, RECEIVING_CHAIN));

        f.reconciler.process(tx).await;

        let entry = f.tracker.get(id).unwrap();
        assert_eq!(entry.status, TrackedStatus::Completed(Status::SenderExpired));
        assert_eq!(entry.chain_id, RECEIVING_CHAIN);
        assert_eq!(entry.block, 44);
    }

    #[tokio::test]
    async fn duplicate_sender_cancel_is_idempotent_success() {
        let mut sending = sending_gateway();
        let sender_variant_word =
            Bytes::from(encode::variant_hash(&sending_variant()).as_bytes().to_vec());
        sending
            .expect_read()
            .times(1)
            .returning(move |_| Ok(sender_variant_word.clone()));
        sending.expect_estimate_gas().returning(|_| {
            Err(crate::error::RouterError::ContractRevert {
                chain_id: SENDING_CHAIN,
                reason: "execution reverted: #C:019".to_string(),
            })
        });
        sending.expect_submit_and_confirm().times(0);

        let receiving = receiving_gateway();

        let f = fixture(sending, receiving, MockContractReader::new());
        let tx = sender_expired_tx();
        let id = tx.transaction_id();
        assert!(f
            .tracker
            .try_begin_processing(id, Status::SenderExpired, RECEIVING_CHAIN));

        f.reconciler.process(tx).await;

        assert!(f.tracker.get(id).is_none());
    }

    #[tokio::test]
    async fn sender_expiry_without_hashes_is_skipped() {
        let mut sending = sending_gateway();
        sending.expect_read().times(0);
        sending.expect_submit_and_confirm().times(0);
        let receiving = receiving_gateway();

        let f = fixture(sending, receiving, MockContractReader::new());
        let tx = ActiveTransaction {
            crosschain: CrosschainTransaction {
                invariant: invariant(),
                sending: sending_variant(),
                receiving: None,
            },
            action: StatusPayload::SenderExpired {
                hashes: TransactionHashes::default(),
            },
        };
        let id = tx.transaction_id();
        assert!(f
            .tracker
            .try_begin_processing(id, Status::SenderExpired, RECEIVING_CHAIN));

        f.reconciler.process(tx).await;

        assert!(f.tracker.get(id).is_none());
    }

    #[tokio::test]
    async fn unconfigured_receiver_chain_unwinds_sender_lock() {
        let mut sending = sending_gateway();
        let sender_variant_word =
            Bytes::from(encode::variant_hash(&sending_variant()).as_bytes().to_vec());
        sending
            .expect_read()
            .times(1)
            .returning(move |_| Ok(sender_variant_word.clone()));
        sending
            .expect_estimate_gas()
            .returning(|_| Ok(U256::from(90_000u64)));
        sending
            .expect_submit_and_confirm()
            .times(1)
            .returning(|_| Ok(receipt(50)));

        let mut receiving = receiving_gateway();
        receiving.expect_read().times(0);
        receiving.expect_submit_and_confirm().times(0);

        let f = fixture(sending, receiving, MockContractReader::new());
        let tx = receiver_not_configured_tx();
        let id = tx.transaction_id();
        assert!(f
            .tracker
            .try_begin_processing(id, Status::ReceiverNotConfigured, SENDING_CHAIN));

        f.reconciler.process(tx).await;

        let entry = f.tracker.get(id).unwrap();
        assert_eq!(
            entry.status,
            TrackedStatus::Completed(Status::ReceiverNotConfigured)
        );
        assert_eq!(entry.chain_id, SENDING_CHAIN);
        assert_eq!(entry.block, 50);
    }

    #[tokio::test]
    async fn missing_chain_config_fails_confirmation_gate() {
        // gateway connected, but the chain is absent from configuration
        let sending = sending_gateway();
        let mut receiving = receiving_gateway();
        receiving.expect_get_confirmations().times(0);
        receiving.expect_submit_and_confirm().times(0);

        let settings: Arc<Settings> = Arc::new(
            toml::from_str(
                r#"
                [router]
                dispatch_delay_ms = 0

                [metrics]
                enabled = false
                port = 9090

                [relay]
                endpoint = "https://relay.example.com"

                [messaging]
                endpoint = "https://messaging.example.com"

                [chains.sending]
                chain_id = 1337
                name = "sending"
                providers = ["http://localhost:8545"]
                transaction_manager_address = "0x0000000000000000000000000000000000000008"
                subgraph = ["http://localhost:8000"]
                confirmations = 2
                "#,
            )
            .unwrap(),
        );
        let f = fixture_with_settings(settings, sending, receiving, MockContractReader::new());
        let tx = receiver_fulfilled_tx();

        let err = f.reconciler.handle_single(&tx).await.unwrap_err();
        assert!(matches!(
            err,
            RouterError::ChainNotConfigured {
                chain_id: RECEIVING_CHAIN
            }
        ));
    }
}
