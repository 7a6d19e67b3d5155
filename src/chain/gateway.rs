//! Chain gateway with multi-RPC support and automatic failover
//!
//! Every on-chain interaction of the router goes through [`ChainGateway`].
//! The live implementation wraps a set of HTTP providers for one chain and
//! rotates to the next on failure; submission waits for the configured
//! confirmation depth before reporting success.

use crate::config::ChainConfig;
use crate::error::{RouterError, RouterResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

/// Parameters of one contract interaction, shared between submission and
/// read-only calls.
#[derive(Debug, Clone)]
pub struct TransactionRequestData {
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
}

/// Single-chain view of the node layer.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChainGateway: Send + Sync {
    fn chain_id(&self) -> u64;

    /// Address transactions are signed with.
    fn wallet_address(&self) -> Address;

    /// Sign, submit, and wait until the transaction is mined with at least
    /// the chain's configured confirmation depth. Reverts surface as
    /// [`RouterError::ContractRevert`].
    async fn submit_and_confirm(
        &self,
        request: TransactionRequestData,
    ) -> RouterResult<TransactionReceipt>;

    /// Read-only eth_call against current state.
    async fn read(&self, request: TransactionRequestData) -> RouterResult<Bytes>;

    /// Gas estimate for the request; a revert during estimation surfaces
    /// the revert reason.
    async fn estimate_gas(&self, request: TransactionRequestData) -> RouterResult<U256>;

    async fn get_gas_price(&self) -> RouterResult<U256>;

    async fn get_balance(&self, address: Address) -> RouterResult<U256>;

    async fn get_block_number(&self) -> RouterResult<u64>;

    /// Confirmation depth of a mined transaction; 0 when the receipt is not
    /// yet available.
    async fn get_confirmations(&self, tx_hash: H256) -> RouterResult<u64>;

    async fn get_logs(&self, filter: Filter) -> RouterResult<Vec<Log>>;
}

/// Multi-provider gateway over ethers HTTP providers.
pub struct EthGateway {
    config: ChainConfig,
    providers: Vec<Provider<Http>>,
    current_provider: AtomicUsize,
    wallet: LocalWallet,
}

const SEND_TIMEOUT: Duration = Duration::from_secs(30);
const CONFIRMATION_POLL: Duration = Duration::from_secs(2);
const CONFIRMATION_WAIT: Duration = Duration::from_secs(300);

impl EthGateway {
    pub fn new(config: ChainConfig, wallet: LocalWallet) -> RouterResult<Self> {
        let mut providers = Vec::new();
        for url in &config.providers {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if providers.is_empty() {
            return Err(RouterError::Gateway {
                chain_id: config.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        let wallet = wallet.with_chain_id(config.chain_id);

        Ok(Self {
            config,
            providers,
            current_provider: AtomicUsize::new(0),
            wallet,
        })
    }

    fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.providers[idx % self.providers.len()]
    }

    fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    fn gateway_error(&self, message: impl Into<String>) -> RouterError {
        RouterError::Gateway {
            chain_id: self.config.chain_id,
            message: message.into(),
        }
    }

    /// Classify a provider error: revert reasons become typed reverts so
    /// callers can inspect the reason string.
    fn classify_error(&self, message: String) -> RouterError {
        if message.contains("execution reverted") || message.contains("revert") {
            RouterError::ContractRevert {
                chain_id: self.config.chain_id,
                reason: message,
            }
        } else {
            self.gateway_error(message)
        }
    }

    async fn build_transaction(
        &self,
        request: &TransactionRequestData,
    ) -> RouterResult<TypedTransaction> {
        let nonce = self
            .http()
            .get_transaction_count(self.wallet.address(), Some(BlockNumber::Pending.into()))
            .await
            .map_err(|e| self.gateway_error(e.to_string()))?;

        let mut tx: TypedTransaction = TransactionRequest::new()
            .to(request.to)
            .data(request.data.clone())
            .value(request.value)
            .nonce(nonce)
            .from(self.wallet.address())
            .chain_id(self.config.chain_id)
            .into();

        let gas = self
            .http()
            .estimate_gas(&tx, None)
            .await
            .map_err(|e| self.classify_error(e.to_string()))?;
        tx.set_gas(gas);

        let gas_price = self
            .http()
            .get_gas_price()
            .await
            .map_err(|e| RouterError::GasEstimation(e.to_string()))?;
        tx.set_gas_price(gas_price);

        Ok(tx)
    }

    /// Poll for the receipt until it has the configured confirmation depth.
    async fn wait_for_confirmations(&self, tx_hash: H256) -> RouterResult<TransactionReceipt> {
        let wait = async {
            loop {
                let receipt = self
                    .http()
                    .get_transaction_receipt(tx_hash)
                    .await
                    .map_err(|e| self.gateway_error(e.to_string()))?;

                if let Some(receipt) = receipt {
                    if receipt.status == Some(0.into()) {
                        return Err(RouterError::ContractRevert {
                            chain_id: self.config.chain_id,
                            reason: format!("transaction {:?} reverted on chain", tx_hash),
                        });
                    }
                    if let Some(mined_in) = receipt.block_number {
                        let head = self
                            .http()
                            .get_block_number()
                            .await
                            .map_err(|e| self.gateway_error(e.to_string()))?;
                        let confirmations = head.as_u64().saturating_sub(mined_in.as_u64()) + 1;
                        if confirmations >= self.config.confirmations {
                            return Ok(receipt);
                        }
                        debug!(
                            chain_id = self.config.chain_id,
                            tx_hash = ?tx_hash,
                            confirmations,
                            required = self.config.confirmations,
                            "Waiting for confirmations"
                        );
                    }
                }
                tokio::time::sleep(CONFIRMATION_POLL).await;
            }
        };

        timeout(CONFIRMATION_WAIT, wait)
            .await
            .map_err(|_| RouterError::Timeout {
                operation: format!("confirmations for {:?}", tx_hash),
            })?
    }
}

#[async_trait]
impl ChainGateway for EthGateway {
    fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    fn wallet_address(&self) -> Address {
        self.wallet.address()
    }

    async fn submit_and_confirm(
        &self,
        request: TransactionRequestData,
    ) -> RouterResult<TransactionReceipt> {
        let tx = self.build_transaction(&request).await?;

        let signature = self
            .wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| RouterError::Wallet(e.to_string()))?;
        let signed = tx.rlp_signed(&signature);

        let mut last_error = None;
        for _ in 0..self.providers.len() {
            let result = timeout(SEND_TIMEOUT, self.http().send_raw_transaction(signed.clone())).await;
            match result {
                Ok(Ok(pending)) => {
                    let tx_hash = pending.tx_hash();
                    info!(
                        chain_id = self.config.chain_id,
                        tx_hash = ?tx_hash,
                        "Transaction sent"
                    );
                    return self.wait_for_confirmations(tx_hash).await;
                }
                Ok(Err(e)) => {
                    let error = self.classify_error(e.to_string());
                    // a revert is deterministic, retrying another provider
                    // cannot change the outcome
                    if matches!(error, RouterError::ContractRevert { .. }) {
                        return Err(error);
                    }
                    last_error = Some(error);
                    self.failover();
                }
                Err(_) => {
                    warn!(chain_id = self.config.chain_id, "Transaction send timeout");
                    last_error = Some(RouterError::Timeout {
                        operation: "send transaction".to_string(),
                    });
                    self.failover();
                }
            }
        }

        Err(last_error.unwrap_or_else(|| self.gateway_error("All providers failed")))
    }

    async fn read(&self, request: TransactionRequestData) -> RouterResult<Bytes> {
        let tx: TypedTransaction = TransactionRequest::new()
            .to(request.to)
            .data(request.data)
            .into();

        for _ in 0..self.providers.len() {
            match self.http().call(&tx, None).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    let message = e.to_string();
                    if message.contains("revert") {
                        return Err(self.classify_error(message));
                    }
                    warn!(
                        "Read call failed on chain {}: {}",
                        self.config.chain_id, message
                    );
                    self.failover();
                }
            }
        }

        Err(self.gateway_error("All providers failed to serve read call"))
    }

    async fn estimate_gas(&self, request: TransactionRequestData) -> RouterResult<U256> {
        let tx: TypedTransaction = TransactionRequest::new()
            .to(request.to)
            .data(request.data)
            .value(request.value)
            .from(self.wallet.address())
            .into();

        self.http()
            .estimate_gas(&tx, None)
            .await
            .map_err(|e| self.classify_error(e.to_string()))
    }

    async fn get_gas_price(&self) -> RouterResult<U256> {
        self.http()
            .get_gas_price()
            .await
            .map_err(|e| RouterError::GasEstimation(e.to_string()))
    }

    async fn get_balance(&self, address: Address) -> RouterResult<U256> {
        self.http()
            .get_balance(address, None)
            .await
            .map_err(|e| self.gateway_error(e.to_string()))
    }

    async fn get_block_number(&self) -> RouterResult<u64> {
        for _ in 0..self.providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!(
                        "Failed to get block number from chain {}: {}",
                        self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(self.gateway_error("All providers failed"))
    }

    async fn get_confirmations(&self, tx_hash: H256) -> RouterResult<u64> {
        let receipt = self
            .http()
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| self.gateway_error(e.to_string()))?;

        let mined_in = match receipt.and_then(|r| r.block_number) {
            Some(block) => block.as_u64(),
            None => return Ok(0),
        };
        let head = self.get_block_number().await?;
        Ok(head.saturating_sub(mined_in) + 1)
    }

    async fn get_logs(&self, filter: Filter) -> RouterResult<Vec<Log>> {
        for _ in 0..self.providers.len() {
            match self.http().get_logs(&filter).await {
                Ok(logs) => return Ok(logs),
                Err(e) => {
                    warn!(
                        "Failed to get logs from chain {}: {}",
                        self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(self.gateway_error("All providers failed to get logs"))
    }
}
