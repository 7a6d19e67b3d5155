//! Calldata encoding for the transaction manager and router contracts
//!
//! Calls are hand-encoded: a 4-byte selector over the canonical signature
//! followed by ABI-encoded arguments. The invariant digest computed here
//! must match the contract's storage key exactly or the sanitation check
//! reads the wrong slot.

use crate::types::{InvariantTransactionData, VariantData};

use ethers::abi::{encode, Token};
use ethers::types::{Address, Bytes, H256, U256};
use sha3::{Digest, Keccak256};

const INVARIANT_SIG: &str =
    "(address,address,address,address,address,address,address,address,address,bytes32,bytes32,uint256,uint256)";
const TRANSACTION_DATA_SIG: &str =
    "(address,address,address,address,address,address,address,address,address,bytes32,bytes32,uint256,uint256,uint256,uint256,uint256)";

/// First four bytes of keccak256 over the canonical signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let mut hasher = Keccak256::new();
    hasher.update(signature.as_bytes());
    let hash = hasher.finalize();
    [hash[0], hash[1], hash[2], hash[3]]
}

fn call(signature: &str, tokens: &[Token]) -> Bytes {
    let mut data = selector(signature).to_vec();
    data.extend_from_slice(&encode(tokens));
    Bytes::from(data)
}

/// Invariant fields in contract declaration order.
fn invariant_token(invariant: &InvariantTransactionData) -> Token {
    Token::Tuple(vec![
        Token::Address(invariant.receiving_chain_tx_manager_address),
        Token::Address(invariant.user),
        Token::Address(invariant.router),
        Token::Address(invariant.initiator),
        Token::Address(invariant.sending_asset_id),
        Token::Address(invariant.receiving_asset_id),
        Token::Address(invariant.sending_chain_fallback),
        Token::Address(invariant.receiving_address),
        Token::Address(invariant.call_to),
        Token::FixedBytes(invariant.call_data_hash.as_bytes().to_vec()),
        Token::FixedBytes(invariant.transaction_id.as_bytes().to_vec()),
        Token::Uint(U256::from(invariant.sending_chain_id)),
        Token::Uint(U256::from(invariant.receiving_chain_id)),
    ])
}

/// Invariant plus variant, the full record fulfill and cancel take.
fn transaction_data_token(invariant: &InvariantTransactionData, variant: &VariantData) -> Token {
    let mut fields = match invariant_token(invariant) {
        Token::Tuple(fields) => fields,
        _ => unreachable!(),
    };
    fields.push(Token::Uint(variant.amount));
    fields.push(Token::Uint(U256::from(variant.expiry)));
    fields.push(Token::Uint(U256::from(variant.prepared_block_number)));
    Token::Tuple(fields)
}

/// Storage key of a transfer's variant record: keccak over the ABI-encoded
/// invariant tuple.
pub fn invariant_digest(invariant: &InvariantTransactionData) -> H256 {
    let encoded = encode(&[invariant_token(invariant)]);
    let mut hasher = Keccak256::new();
    hasher.update(&encoded);
    H256::from_slice(&hasher.finalize())
}

/// Hash the contract stores for a prepared transfer's variant data.
pub fn variant_hash(variant: &VariantData) -> H256 {
    let encoded = encode(&[
        Token::Uint(variant.amount),
        Token::Uint(U256::from(variant.expiry)),
        Token::Uint(U256::from(variant.prepared_block_number)),
    ]);
    let mut hasher = Keccak256::new();
    hasher.update(&encoded);
    H256::from_slice(&hasher.finalize())
}

pub fn encode_prepare(
    invariant: &InvariantTransactionData,
    amount: U256,
    expiry: u64,
    encrypted_call_data: &Bytes,
    encoded_bid: &Bytes,
    bid_signature: &Bytes,
) -> Bytes {
    call(
        &format!("prepare(({},uint256,uint256,bytes,bytes,bytes))", INVARIANT_SIG),
        &[Token::Tuple(vec![
            invariant_token(invariant),
            Token::Uint(amount),
            Token::Uint(U256::from(expiry)),
            Token::Bytes(encrypted_call_data.to_vec()),
            Token::Bytes(encoded_bid.to_vec()),
            Token::Bytes(bid_signature.to_vec()),
        ])],
    )
}

pub fn encode_fulfill(
    invariant: &InvariantTransactionData,
    variant: &VariantData,
    relayer_fee: U256,
    signature: &Bytes,
    call_data: &Bytes,
) -> Bytes {
    call(
        &format!("fulfill(({},uint256,bytes,bytes))", TRANSACTION_DATA_SIG),
        &[Token::Tuple(vec![
            transaction_data_token(invariant, variant),
            Token::Uint(relayer_fee),
            Token::Bytes(signature.to_vec()),
            Token::Bytes(call_data.to_vec()),
        ])],
    )
}

pub fn encode_cancel(
    invariant: &InvariantTransactionData,
    variant: &VariantData,
    signature: &Bytes,
) -> Bytes {
    call(
        &format!("cancel(({},bytes))", TRANSACTION_DATA_SIG),
        &[Token::Tuple(vec![
            transaction_data_token(invariant, variant),
            Token::Bytes(signature.to_vec()),
        ])],
    )
}

pub fn encode_remove_liquidity(amount: U256, asset_id: Address, recipient: Address) -> Bytes {
    call(
        "removeLiquidity(uint256,address,address)",
        &[
            Token::Uint(amount),
            Token::Address(asset_id),
            Token::Address(recipient),
        ],
    )
}

pub fn encode_add_liquidity_for(amount: U256, asset_id: Address, router: Address) -> Bytes {
    call(
        "addLiquidityFor(uint256,address,address)",
        &[
            Token::Uint(amount),
            Token::Address(asset_id),
            Token::Address(router),
        ],
    )
}

/// Read of the on-chain liquidity balance for (router, asset).
pub fn encode_router_balance(router: Address, asset_id: Address) -> Bytes {
    call(
        "routerBalances(address,address)",
        &[Token::Address(router), Token::Address(asset_id)],
    )
}

/// Read of the stored variant hash for an invariant digest.
pub fn encode_variant_transaction_data(digest: H256) -> Bytes {
    call(
        "variantTransactionData(bytes32)",
        &[Token::FixedBytes(digest.as_bytes().to_vec())],
    )
}

pub fn encode_erc20_allowance(owner: Address, spender: Address) -> Bytes {
    call(
        "allowance(address,address)",
        &[Token::Address(owner), Token::Address(spender)],
    )
}

pub fn encode_erc20_approve(spender: Address, amount: U256) -> Bytes {
    call(
        "approve(address,uint256)",
        &[Token::Address(spender), Token::Uint(amount)],
    )
}

/// Router-contract wrappers: same arguments plus the relayer fee terms and
/// the router signature authorizing them, so a third party can submit.
pub fn encode_router_prepare(
    invariant: &InvariantTransactionData,
    amount: U256,
    expiry: u64,
    encrypted_call_data: &Bytes,
    encoded_bid: &Bytes,
    bid_signature: &Bytes,
    relayer_fee_asset: Address,
    relayer_fee: U256,
    fee_signature: &Bytes,
) -> Bytes {
    call(
        &format!(
            "prepare(({},uint256,uint256,bytes,bytes,bytes),address,uint256,bytes)",
            INVARIANT_SIG
        ),
        &[
            Token::Tuple(vec![
                invariant_token(invariant),
                Token::Uint(amount),
                Token::Uint(U256::from(expiry)),
                Token::Bytes(encrypted_call_data.to_vec()),
                Token::Bytes(encoded_bid.to_vec()),
                Token::Bytes(bid_signature.to_vec()),
            ]),
            Token::Address(relayer_fee_asset),
            Token::Uint(relayer_fee),
            Token::Bytes(fee_signature.to_vec()),
        ],
    )
}

pub fn encode_router_fulfill(
    invariant: &InvariantTransactionData,
    variant: &VariantData,
    relayer_fee: U256,
    signature: &Bytes,
    call_data: &Bytes,
    relayer_fee_asset: Address,
    router_relayer_fee: U256,
    fee_signature: &Bytes,
) -> Bytes {
    call(
        &format!(
            "fulfill(({},uint256,bytes,bytes),address,uint256,bytes)",
            TRANSACTION_DATA_SIG
        ),
        &[
            Token::Tuple(vec![
                transaction_data_token(invariant, variant),
                Token::Uint(relayer_fee),
                Token::Bytes(signature.to_vec()),
                Token::Bytes(call_data.to_vec()),
            ]),
            Token::Address(relayer_fee_asset),
            Token::Uint(router_relayer_fee),
            Token::Bytes(fee_signature.to_vec()),
        ],
    )
}

pub fn encode_router_cancel(
    invariant: &InvariantTransactionData,
    variant: &VariantData,
    signature: &Bytes,
    relayer_fee_asset: Address,
    router_relayer_fee: U256,
    fee_signature: &Bytes,
) -> Bytes {
    call(
        &format!(
            "cancel(({},bytes),address,uint256,bytes)",
            TRANSACTION_DATA_SIG
        ),
        &[
            Token::Tuple(vec![
                transaction_data_token(invariant, variant),
                Token::Bytes(signature.to_vec()),
            ]),
            Token::Address(relayer_fee_asset),
            Token::Uint(router_relayer_fee),
            Token::Bytes(fee_signature.to_vec()),
        ],
    )
}

/// Payload the router signs to authorize a third party paying itself a
/// relayer fee for submitting on the router's behalf.
pub fn fee_payload_hash(
    transaction_id: H256,
    relayer_fee_asset: Address,
    relayer_fee: U256,
    chain_id: u64,
) -> H256 {
    let encoded = encode(&[
        Token::FixedBytes(transaction_id.as_bytes().to_vec()),
        Token::Address(relayer_fee_asset),
        Token::Uint(relayer_fee),
        Token::Uint(U256::from(chain_id)),
    ]);
    let mut hasher = Keccak256::new();
    hasher.update(&encoded);
    H256::from_slice(&hasher.finalize())
}

/// Decode a single uint256 return value (balances, allowances).
pub fn decode_uint(data: &Bytes) -> U256 {
    if data.len() < 32 {
        return U256::zero();
    }
    U256::from_big_endian(&data[data.len() - 32..])
}

/// Decode a single bytes32 return value (variant hash reads).
pub fn decode_hash(data: &Bytes) -> H256 {
    if data.len() < 32 {
        return H256::zero();
    }
    H256::from_slice(&data[0..32])
}
