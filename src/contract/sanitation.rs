//! Pre-submission sanitation check
//!
//! Before encoding a state-changing call, the stored variant hash for the
//! transfer is read from the on-chain transaction manager and compared
//! against what the requested operation assumes. Catches stale indexer
//! reads before gas is spent: a prepare against an already-prepared slot,
//! or a fulfill/cancel whose variant data no longer matches the chain.

use crate::chain::{ChainGateway, TransactionRequestData};
use crate::error::{RouterError, RouterResult};
use crate::types::{InvariantTransactionData, VariantData};

use super::encode;

use ethers::types::{Address, H256, U256};
use std::sync::Arc;

/// What the stored variant slot must hold for the operation to be valid.
#[derive(Debug, Clone)]
pub enum Expectation {
    /// Prepare: the slot must be empty.
    Unprepared,
    /// Fulfill/cancel: the slot must hold the hash of this variant data.
    Prepared(VariantData),
}

pub async fn sanitation_check(
    gateway: &Arc<dyn ChainGateway>,
    transaction_manager: Address,
    invariant: &InvariantTransactionData,
    expectation: Expectation,
) -> RouterResult<()> {
    let digest = encode::invariant_digest(invariant);
    let stored = gateway
        .read(TransactionRequestData {
            to: transaction_manager,
            data: encode::encode_variant_transaction_data(digest),
            value: U256::zero(),
        })
        .await?;
    let stored = encode::decode_hash(&stored);

    match expectation {
        Expectation::Unprepared => {
            if stored != H256::zero() {
                return Err(RouterError::SanitationFailed {
                    chain_id: gateway.chain_id(),
                    transaction_id: invariant.transaction_id,
                    message: "transfer already has variant data on chain".to_string(),
                });
            }
        }
        Expectation::Prepared(variant) => {
            let expected = encode::variant_hash(&variant);
            if stored == H256::zero() {
                return Err(RouterError::SanitationFailed {
                    chain_id: gateway.chain_id(),
                    transaction_id: invariant.transaction_id,
                    message: "transfer is not prepared on chain".to_string(),
                });
            }
            if stored != expected {
                return Err(RouterError::SanitationFailed {
                    chain_id: gateway.chain_id(),
                    transaction_id: invariant.transaction_id,
                    message: format!(
                        "variant data mismatch: chain holds {:?}, indexer implies {:?}",
                        stored, expected
                    ),
                });
            }
        }
    }

    Ok(())
}
