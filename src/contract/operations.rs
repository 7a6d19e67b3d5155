//! Logical contract operations
//!
//! One method per protocol action. Each state-changing transfer operation
//! runs the sanitation check, encodes calldata for either the transaction
//! manager (direct mode) or the router contract (relayed mode, when
//! `router_contract_address` is configured), and hands the call to the
//! submission pipeline. Liquidity management always submits directly.

use crate::chain::{ChainManager, TransactionRequestData};
use crate::config::Settings;
use crate::error::{RouterError, RouterResult};
use crate::types::{CancelSide, InvariantTransactionData, TransactionReason, VariantData};

use super::encode;
use super::pipeline::{
    RelayedTerms, Submission, SubmissionOutcome, SubmissionPipeline, WaitEvent,
};
use super::sanitation::{sanitation_check, Expectation};

use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, H256, TransactionReceipt, U256};
use std::sync::Arc;
use tracing::{info, warn};

pub struct ContractOperations {
    chain_manager: Arc<ChainManager>,
    pipeline: SubmissionPipeline,
    wallet: LocalWallet,
    router_contract: Option<Address>,
    relayer_fee_asset: Address,
    relayer_fee: U256,
    transaction_managers: std::collections::HashMap<u64, Address>,
}

impl ContractOperations {
    pub fn new(
        settings: &Settings,
        chain_manager: Arc<ChainManager>,
        pipeline: SubmissionPipeline,
        wallet: LocalWallet,
    ) -> RouterResult<Self> {
        let relayer_fee = if settings.relay.relayer_fee.is_empty() {
            U256::zero()
        } else {
            U256::from_dec_str(&settings.relay.relayer_fee)
                .map_err(|e| RouterError::Config(format!("invalid relayer_fee: {}", e)))?
        };
        let transaction_managers = settings
            .enabled_chains()
            .into_iter()
            .map(|(_, c)| (c.chain_id, c.transaction_manager_address))
            .collect();

        Ok(Self {
            chain_manager,
            pipeline,
            wallet,
            router_contract: settings.router.router_contract_address,
            relayer_fee_asset: settings.relay.relayer_fee_asset,
            relayer_fee,
            transaction_managers,
        })
    }

    fn transaction_manager(&self, chain_id: u64) -> RouterResult<Address> {
        self.transaction_managers
            .get(&chain_id)
            .copied()
            .ok_or(RouterError::ChainNotConfigured { chain_id })
    }

    /// Router signature over the fee terms for relayed submission.
    async fn relayed_terms(
        &self,
        transaction_id: H256,
        chain_id: u64,
    ) -> RouterResult<RelayedTerms> {
        let payload = encode::fee_payload_hash(
            transaction_id,
            self.relayer_fee_asset,
            self.relayer_fee,
            chain_id,
        );
        let signature = self
            .wallet
            .sign_message(payload.as_bytes())
            .await
            .map_err(|e| RouterError::Wallet(e.to_string()))?;
        Ok(RelayedTerms {
            fee_asset: self.relayer_fee_asset,
            fee: self.relayer_fee,
            fee_signature: Bytes::from(signature.to_vec()),
        })
    }

    /// Receiver-side prepare, locking the router's liquidity against the
    /// user's sender-side lock.
    #[allow(clippy::too_many_arguments)]
    pub async fn prepare(
        &self,
        chain_id: u64,
        invariant: &InvariantTransactionData,
        amount: U256,
        expiry: u64,
        encrypted_call_data: &Bytes,
        encoded_bid: &Bytes,
        bid_signature: &Bytes,
    ) -> RouterResult<SubmissionOutcome> {
        let gateway = self.chain_manager.get_gateway(chain_id)?;
        let transaction_manager = self.transaction_manager(chain_id)?;

        sanitation_check(&gateway, transaction_manager, invariant, Expectation::Unprepared)
            .await?;

        let submission = match self.router_contract {
            Some(router_contract) => {
                let terms = self
                    .relayed_terms(invariant.transaction_id, chain_id)
                    .await?;
                Submission {
                    chain_id,
                    transaction_id: invariant.transaction_id,
                    reason: TransactionReason::PrepareReceiver,
                    to: router_contract,
                    data: encode::encode_router_prepare(
                        invariant,
                        amount,
                        expiry,
                        encrypted_call_data,
                        encoded_bid,
                        bid_signature,
                        terms.fee_asset,
                        terms.fee,
                        &terms.fee_signature,
                    ),
                    event_kind: WaitEvent::Prepared,
                    relayed: Some(terms),
                }
            }
            None => Submission {
                chain_id,
                transaction_id: invariant.transaction_id,
                reason: TransactionReason::PrepareReceiver,
                to: transaction_manager,
                data: encode::encode_prepare(
                    invariant,
                    amount,
                    expiry,
                    encrypted_call_data,
                    encoded_bid,
                    bid_signature,
                ),
                event_kind: WaitEvent::Prepared,
                relayed: None,
            },
        };

        self.pipeline.submit(&gateway, submission).await
    }

    /// Sender-side fulfill, reclaiming the router's funds with the user's
    /// released signature.
    pub async fn fulfill(
        &self,
        chain_id: u64,
        invariant: &InvariantTransactionData,
        variant: &VariantData,
        relayer_fee: U256,
        signature: &Bytes,
        call_data: &Bytes,
    ) -> RouterResult<SubmissionOutcome> {
        let gateway = self.chain_manager.get_gateway(chain_id)?;
        let transaction_manager = self.transaction_manager(chain_id)?;

        sanitation_check(
            &gateway,
            transaction_manager,
            invariant,
            Expectation::Prepared(variant.clone()),
        )
        .await?;

        let submission = match self.router_contract {
            Some(router_contract) => {
                let terms = self
                    .relayed_terms(invariant.transaction_id, chain_id)
                    .await?;
                Submission {
                    chain_id,
                    transaction_id: invariant.transaction_id,
                    reason: TransactionReason::FulfillSender,
                    to: router_contract,
                    data: encode::encode_router_fulfill(
                        invariant,
                        variant,
                        relayer_fee,
                        signature,
                        call_data,
                        terms.fee_asset,
                        terms.fee,
                        &terms.fee_signature,
                    ),
                    event_kind: WaitEvent::Fulfilled,
                    relayed: Some(terms),
                }
            }
            None => Submission {
                chain_id,
                transaction_id: invariant.transaction_id,
                reason: TransactionReason::FulfillSender,
                to: transaction_manager,
                data: encode::encode_fulfill(invariant, variant, relayer_fee, signature, call_data),
                event_kind: WaitEvent::Fulfilled,
                relayed: None,
            },
        };

        self.pipeline.submit(&gateway, submission).await
    }

    /// Cancel one side of a transfer. Router-initiated cancels carry no
    /// user signature; the contract accepts them only past expiry.
    pub async fn cancel(
        &self,
        side: CancelSide,
        chain_id: u64,
        invariant: &InvariantTransactionData,
        variant: &VariantData,
    ) -> RouterResult<SubmissionOutcome> {
        let gateway = self.chain_manager.get_gateway(chain_id)?;
        let transaction_manager = self.transaction_manager(chain_id)?;

        sanitation_check(
            &gateway,
            transaction_manager,
            invariant,
            Expectation::Prepared(variant.clone()),
        )
        .await?;

        let reason = match side {
            CancelSide::Sender => TransactionReason::CancelSender,
            CancelSide::Receiver => TransactionReason::CancelReceiver,
        };
        let signature = Bytes::new();

        let submission = match self.router_contract {
            Some(router_contract) => {
                let terms = self
                    .relayed_terms(invariant.transaction_id, chain_id)
                    .await?;
                Submission {
                    chain_id,
                    transaction_id: invariant.transaction_id,
                    reason,
                    to: router_contract,
                    data: encode::encode_router_cancel(
                        invariant,
                        variant,
                        &signature,
                        terms.fee_asset,
                        terms.fee,
                        &terms.fee_signature,
                    ),
                    event_kind: WaitEvent::Cancelled,
                    relayed: Some(terms),
                }
            }
            None => Submission {
                chain_id,
                transaction_id: invariant.transaction_id,
                reason,
                to: transaction_manager,
                data: encode::encode_cancel(invariant, variant, &signature),
                event_kind: WaitEvent::Cancelled,
                relayed: None,
            },
        };

        self.pipeline.submit(&gateway, submission).await
    }

    /// On-chain liquidity balance for this router and asset.
    pub async fn get_router_balance(
        &self,
        chain_id: u64,
        asset_id: Address,
    ) -> RouterResult<U256> {
        let gateway = self.chain_manager.get_gateway(chain_id)?;
        let transaction_manager = self.transaction_manager(chain_id)?;
        let router = self.router_contract.unwrap_or_else(|| self.wallet.address());

        let raw = gateway
            .read(TransactionRequestData {
                to: transaction_manager,
                data: encode::encode_router_balance(router, asset_id),
                value: U256::zero(),
            })
            .await?;
        Ok(encode::decode_uint(&raw))
    }

    /// Withdraw liquidity to a recipient address.
    pub async fn remove_liquidity(
        &self,
        chain_id: u64,
        amount: U256,
        asset_id: Address,
        recipient: Address,
    ) -> RouterResult<TransactionReceipt> {
        let gateway = self.chain_manager.get_gateway(chain_id)?;
        let transaction_manager = self.transaction_manager(chain_id)?;

        info!(
            chain_id,
            asset_id = ?asset_id,
            amount = %amount,
            "Removing liquidity"
        );
        gateway
            .submit_and_confirm(TransactionRequestData {
                to: transaction_manager,
                data: encode::encode_remove_liquidity(amount, asset_id, recipient),
                value: U256::zero(),
            })
            .await
    }

    /// Deposit liquidity for a router. ERC-20 assets are approved first
    /// when the standing allowance is insufficient; the native asset rides
    /// along as call value.
    pub async fn add_liquidity_for(
        &self,
        chain_id: u64,
        amount: U256,
        asset_id: Address,
        router: Address,
    ) -> RouterResult<TransactionReceipt> {
        let gateway = self.chain_manager.get_gateway(chain_id)?;
        let transaction_manager = self.transaction_manager(chain_id)?;

        let value = if asset_id == Address::zero() {
            amount
        } else {
            let allowance = gateway
                .read(TransactionRequestData {
                    to: asset_id,
                    data: encode::encode_erc20_allowance(
                        gateway.wallet_address(),
                        transaction_manager,
                    ),
                    value: U256::zero(),
                })
                .await?;
            if encode::decode_uint(&allowance) < amount {
                info!(chain_id, asset_id = ?asset_id, "Approving transaction manager");
                gateway
                    .submit_and_confirm(TransactionRequestData {
                        to: asset_id,
                        data: encode::encode_erc20_approve(transaction_manager, amount),
                        value: U256::zero(),
                    })
                    .await?;
            }
            U256::zero()
        };

        info!(
            chain_id,
            asset_id = ?asset_id,
            amount = %amount,
            router = ?router,
            "Adding liquidity"
        );
        gateway
            .submit_and_confirm(TransactionRequestData {
                to: transaction_manager,
                data: encode::encode_add_liquidity_for(amount, asset_id, router),
                value,
            })
            .await
    }

    /// Move this router's liquidity to another router address on the same
    /// chain: withdraw to the signer, then deposit for the new router.
    pub async fn migrate_liquidity(
        &self,
        chain_id: u64,
        asset_id: Address,
        amount: Option<U256>,
        new_router: Address,
    ) -> RouterResult<()> {
        let amount = match amount {
            Some(amount) => amount,
            None => self.get_router_balance(chain_id, asset_id).await?,
        };
        if amount.is_zero() {
            warn!(chain_id, asset_id = ?asset_id, "No liquidity to migrate");
            return Ok(());
        }

        let gateway = self.chain_manager.get_gateway(chain_id)?;
        self.remove_liquidity(chain_id, amount, asset_id, gateway.wallet_address())
            .await?;
        self.add_liquidity_for(chain_id, amount, asset_id, new_router)
            .await?;

        info!(
            chain_id,
            asset_id = ?asset_id,
            amount = %amount,
            new_router = ?new_router,
            "Liquidity migrated"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::messaging::MockMessaging;
    use crate::adapters::relay::MockRelayService;
    use crate::chain::gateway::MockChainGateway;
    use crate::chain::ChainGateway;
    use crate::events::ContractEventBus;

    fn settings() -> Settings {
        toml::from_str(
            r#"
            [router]

            [metrics]
            enabled = false
            port = 9090

            [relay]
            endpoint = "https://relay.example.com"
            relayer_fee = "100"

            [messaging]
            endpoint = "https://messaging.example.com"

            [chains.local]
            chain_id = 1338
            name = "local"
            providers = ["http://localhost:8545"]
            transaction_manager_address = "0x0000000000000000000000000000000000000009"
            subgraph = ["http://localhost:8000"]
            confirmations = 2
            "#,
        )
        .unwrap()
    }

    fn wallet() -> LocalWallet {
        "0000000000000000000000000000000000000000000000000000000000000001"
            .parse()
            .unwrap()
    }

    fn operations(gateway: MockChainGateway) -> ContractOperations {
        let event_bus = Arc::new(ContractEventBus::new());
        let gateway: Arc<dyn ChainGateway> = Arc::new(gateway);
        let chain_manager = Arc::new(ChainManager::from_gateways(
            vec![gateway],
            event_bus.clone(),
        ));
        let pipeline = SubmissionPipeline::new(
            Arc::new(MockRelayService::new()),
            Arc::new(MockMessaging::new()),
            event_bus,
        );
        ContractOperations::new(&settings(), chain_manager, pipeline, wallet()).unwrap()
    }

    #[tokio::test]
    async fn add_liquidity_native_asset_sends_value_without_approve() {
        let mut gateway = MockChainGateway::new();
        gateway.expect_chain_id().return_const(1338u64);
        gateway.expect_read().times(0);
        gateway
            .expect_submit_and_confirm()
            .times(1)
            .withf(|req| req.value == U256::from(500u64))
            .returning(|_| Ok(TransactionReceipt::default()));

        let ops = operations(gateway);
        ops.add_liquidity_for(
            1338,
            U256::from(500u64),
            Address::zero(),
            Address::from_low_u64_be(3),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn add_liquidity_erc20_approves_when_allowance_short() {
        let asset = Address::from_low_u64_be(0xaa);
        let mut gateway = MockChainGateway::new();
        gateway.expect_chain_id().return_const(1338u64);
        gateway
            .expect_wallet_address()
            .return_const(Address::from_low_u64_be(7));
        // allowance read returns zero
        gateway
            .expect_read()
            .times(1)
            .returning(|_| Ok(Bytes::from(vec![0u8; 32])));
        // one approve, then the deposit itself
        gateway
            .expect_submit_and_confirm()
            .times(2)
            .returning(|_| Ok(TransactionReceipt::default()));

        let ops = operations(gateway);
        ops.add_liquidity_for(1338, U256::from(500u64), asset, Address::from_low_u64_be(3))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn migrate_skips_when_balance_is_zero() {
        let mut gateway = MockChainGateway::new();
        gateway.expect_chain_id().return_const(1338u64);
        // routerBalances read returns zero
        gateway
            .expect_read()
            .times(1)
            .returning(|_| Ok(Bytes::from(vec![0u8; 32])));
        gateway.expect_submit_and_confirm().times(0);

        let ops = operations(gateway);
        ops.migrate_liquidity(1338, Address::zero(), None, Address::from_low_u64_be(3))
            .await
            .unwrap();
    }
}
