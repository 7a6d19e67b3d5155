//! Transaction-manager event listener
//!
//! Polls each chain's transaction-manager contract for logs, decodes them
//! into typed [`ContractEvent`]s, and publishes the ones addressed to this
//! router onto the event bus. Submission paths that hand a transaction to
//! an external relayer observe completion through these events.

use crate::config::ChainConfig;
use crate::error::{RouterError, RouterResult};
use crate::events::{ContractEvent, ContractEventBus};
use crate::types::{InvariantTransactionData, VariantData};

use super::ChainGateway;

use ethers::abi::{decode, ParamType, Token};
use ethers::prelude::*;
use ethers::utils::keccak256;
use lazy_static::lazy_static;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

/// Full transaction record as emitted in contract events: nine addresses,
/// two hashes, then the five numeric fields.
fn transaction_data_param() -> ParamType {
    ParamType::Tuple(vec![
        ParamType::Address, // receivingChainTxManagerAddress
        ParamType::Address, // user
        ParamType::Address, // router
        ParamType::Address, // initiator
        ParamType::Address, // sendingAssetId
        ParamType::Address, // receivingAssetId
        ParamType::Address, // sendingChainFallback
        ParamType::Address, // receivingAddress
        ParamType::Address, // callTo
        ParamType::FixedBytes(32), // callDataHash
        ParamType::FixedBytes(32), // transactionId
        ParamType::Uint(256), // sendingChainId
        ParamType::Uint(256), // receivingChainId
        ParamType::Uint(256), // amount
        ParamType::Uint(256), // expiry
        ParamType::Uint(256), // preparedBlockNumber
    ])
}

const TRANSACTION_DATA_SIG: &str = "(address,address,address,address,address,address,address,address,address,bytes32,bytes32,uint256,uint256,uint256,uint256,uint256)";

lazy_static! {
    static ref TRANSACTION_PREPARED: H256 = event_topic(&format!(
        "TransactionPrepared(address,address,bytes32,{},address,bytes,bytes,bytes)",
        TRANSACTION_DATA_SIG
    ));
    static ref TRANSACTION_FULFILLED: H256 = event_topic(&format!(
        "TransactionFulfilled(address,address,bytes32,{},uint256,bytes,bytes,address)",
        TRANSACTION_DATA_SIG
    ));
    static ref TRANSACTION_CANCELLED: H256 = event_topic(&format!(
        "TransactionCancelled(address,address,bytes32,{},address)",
        TRANSACTION_DATA_SIG
    ));
    static ref LIQUIDITY_REMOVED: H256 =
        event_topic("LiquidityRemoved(address,address,uint256,address)");
}

fn event_topic(signature: &str) -> H256 {
    H256::from(keccak256(signature.as_bytes()))
}

/// Listens for transaction-manager events on one chain.
pub struct ChainListener {
    config: ChainConfig,
    gateway: Arc<dyn ChainGateway>,
    event_bus: Arc<ContractEventBus>,
    last_processed_block: RwLock<u64>,
}

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const MAX_BLOCK_RANGE: u64 = 1000;

impl ChainListener {
    pub fn new(
        config: ChainConfig,
        gateway: Arc<dyn ChainGateway>,
        event_bus: Arc<ContractEventBus>,
    ) -> Self {
        Self {
            config,
            gateway,
            event_bus,
            last_processed_block: RwLock::new(0),
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    /// Main polling loop. Starts at the current head; historical state is
    /// recovered through the indexer, not by replaying logs.
    pub async fn listen(&self) -> RouterResult<()> {
        {
            let mut last = self.last_processed_block.write().await;
            if *last == 0 {
                *last = self.gateway.get_block_number().await?;
            }
        }

        loop {
            let current_block = match self.gateway.get_block_number().await {
                Ok(b) => b,
                Err(e) => {
                    warn!("Failed to get block number: {}", e);
                    tokio::time::sleep(POLL_INTERVAL).await;
                    continue;
                }
            };

            let last_block = *self.last_processed_block.read().await;
            if current_block <= last_block {
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }

            let from_block = last_block + 1;
            let to_block = std::cmp::min(current_block, from_block + MAX_BLOCK_RANGE);

            debug!(
                "Chain {}: Processing blocks {} to {}",
                self.config.chain_id, from_block, to_block
            );

            let filter = Filter::new()
                .address(self.config.transaction_manager_address)
                .from_block(from_block)
                .to_block(to_block);

            match self.gateway.get_logs(filter).await {
                Ok(logs) => {
                    for log in logs {
                        if let Err(e) = self.process_log(log) {
                            error!("Failed to process log: {}", e);
                        }
                    }
                    *self.last_processed_block.write().await = to_block;
                }
                Err(e) => {
                    warn!("Failed to get logs: {}", e);
                    // range is retried on the next iteration
                }
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn process_log(&self, log: Log) -> RouterResult<()> {
        let event = match parse_log(self.config.chain_id, &log)? {
            Some(event) => event,
            None => return Ok(()),
        };

        debug!("Chain {} event: {}", self.config.chain_id, event.name());
        crate::metrics::record_contract_event(self.config.chain_id, event.name());
        self.event_bus.publish(event);
        Ok(())
    }
}

/// Decode a transaction-manager log. Unrecognized topics yield `None`.
pub fn parse_log(chain_id: u64, log: &Log) -> RouterResult<Option<ContractEvent>> {
    let topic = match log.topics.first() {
        Some(topic) => *topic,
        None => return Ok(None),
    };
    let block_number = log.block_number.map(|b| b.as_u64()).unwrap_or(0);
    let tx_hash = log.transaction_hash.unwrap_or_default();

    if topic == *TRANSACTION_PREPARED {
        let tokens = decode_data(
            &[
                transaction_data_param(),
                ParamType::Address, // caller
                ParamType::Bytes,   // encryptedCallData
                ParamType::Bytes,   // encodedBid
                ParamType::Bytes,   // bidSignature
            ],
            log,
        )?;
        let (invariant, variant) = decode_transaction_data(&tokens[0])?;
        Ok(Some(ContractEvent::Prepared {
            chain_id,
            invariant,
            variant,
            tx_hash,
            block_number,
        }))
    } else if topic == *TRANSACTION_FULFILLED {
        let tokens = decode_data(
            &[
                transaction_data_param(),
                ParamType::Uint(256), // relayerFee
                ParamType::Bytes,     // signature
                ParamType::Bytes,     // callData
                ParamType::Address,   // caller
            ],
            log,
        )?;
        let (invariant, _) = decode_transaction_data(&tokens[0])?;
        let signature = tokens[2]
            .clone()
            .into_bytes()
            .map(Bytes::from)
            .unwrap_or_default();
        Ok(Some(ContractEvent::Fulfilled {
            chain_id,
            invariant,
            signature,
            tx_hash,
            block_number,
        }))
    } else if topic == *TRANSACTION_CANCELLED {
        let tokens = decode_data(&[transaction_data_param(), ParamType::Address], log)?;
        let (invariant, _) = decode_transaction_data(&tokens[0])?;
        Ok(Some(ContractEvent::Cancelled {
            chain_id,
            invariant,
            tx_hash,
            block_number,
        }))
    } else if topic == *LIQUIDITY_REMOVED {
        // router and assetId are indexed
        let router = log
            .topics
            .get(1)
            .map(|t| Address::from_slice(&t.0[12..32]))
            .unwrap_or_default();
        let asset_id = log
            .topics
            .get(2)
            .map(|t| Address::from_slice(&t.0[12..32]))
            .unwrap_or_default();
        let tokens = decode_data(&[ParamType::Uint(256), ParamType::Address], log)?;
        let amount = tokens[0].clone().into_uint().unwrap_or_default();
        let recipient = tokens[1].clone().into_address().unwrap_or_default();
        Ok(Some(ContractEvent::LiquidityRemoved {
            chain_id,
            router,
            asset_id,
            amount,
            recipient,
            tx_hash,
            block_number,
        }))
    } else {
        Ok(None)
    }
}

fn decode_data(params: &[ParamType], log: &Log) -> RouterResult<Vec<Token>> {
    decode(params, &log.data).map_err(|e| RouterError::Encoding(e.to_string()))
}

fn decode_transaction_data(token: &Token) -> RouterResult<(InvariantTransactionData, VariantData)> {
    let fields = match token {
        Token::Tuple(fields) if fields.len() == 16 => fields,
        _ => {
            return Err(RouterError::Encoding(
                "malformed transaction data tuple".to_string(),
            ))
        }
    };

    let address = |i: usize| -> RouterResult<Address> {
        fields[i]
            .clone()
            .into_address()
            .ok_or_else(|| RouterError::Encoding(format!("field {} is not an address", i)))
    };
    let hash = |i: usize| -> RouterResult<H256> {
        fields[i]
            .clone()
            .into_fixed_bytes()
            .filter(|b| b.len() == 32)
            .map(|b| H256::from_slice(&b))
            .ok_or_else(|| RouterError::Encoding(format!("field {} is not bytes32", i)))
    };
    let uint = |i: usize| -> RouterResult<U256> {
        fields[i]
            .clone()
            .into_uint()
            .ok_or_else(|| RouterError::Encoding(format!("field {} is not a uint", i)))
    };

    let invariant = InvariantTransactionData {
        receiving_chain_tx_manager_address: address(0)?,
        user: address(1)?,
        router: address(2)?,
        initiator: address(3)?,
        sending_asset_id: address(4)?,
        receiving_asset_id: address(5)?,
        sending_chain_fallback: address(6)?,
        receiving_address: address(7)?,
        call_to: address(8)?,
        call_data_hash: hash(9)?,
        transaction_id: hash(10)?,
        sending_chain_id: uint(11)?.as_u64(),
        receiving_chain_id: uint(12)?.as_u64(),
    };
    let variant = VariantData {
        amount: uint(13)?,
        expiry: uint(14)?.as_u64(),
        prepared_block_number: uint(15)?.as_u64(),
    };

    Ok((invariant, variant))
}
