//! Transfer data model
//!
//! A crosschain transfer is identified by its invariant data (set once at
//! creation, identical on both chains) plus one variant record per side
//! that fills in as prepare events land. The joint state of both sides is
//! surfaced by the indexing layer as a status; each status carries exactly
//! the payload fields valid for it.

use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};

/// Immutable identity of a transfer. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvariantTransactionData {
    pub transaction_id: H256,
    pub user: Address,
    pub router: Address,
    pub initiator: Address,
    pub sending_asset_id: Address,
    pub receiving_asset_id: Address,
    pub sending_chain_fallback: Address,
    pub call_to: Address,
    pub receiving_address: Address,
    pub call_data_hash: H256,
    pub sending_chain_id: u64,
    pub receiving_chain_id: u64,
    pub receiving_chain_tx_manager_address: Address,
}

/// Per-side parameters that differ as the transfer progresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantData {
    pub amount: U256,
    pub expiry: u64,
    pub prepared_block_number: u64,
}

/// Full view of one transfer: invariant identity plus whichever sides have
/// been prepared so far. The receiving side is absent until the receiver
/// prepare is observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrosschainTransaction {
    pub invariant: InvariantTransactionData,
    pub sending: VariantData,
    pub receiving: Option<VariantData>,
}

/// Joint status of both sides, as derived by the indexing layer. Fieldless
/// so the dedup tracker can compare cheaply; the payload lives in
/// [`StatusPayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    SenderPrepared,
    ReceiverFulfilled,
    ReceiverExpired,
    SenderExpired,
    ReceiverCancelled,
    ReceiverNotConfigured,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::SenderPrepared => "SenderPrepared",
            Status::ReceiverFulfilled => "ReceiverFulfilled",
            Status::ReceiverExpired => "ReceiverExpired",
            Status::SenderExpired => "SenderExpired",
            Status::ReceiverCancelled => "ReceiverCancelled",
            Status::ReceiverNotConfigured => "ReceiverNotConfigured",
        }
    }
}

/// Event hashes observed on the sending chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendingHashes {
    pub prepare_hash: H256,
    pub cancel_hash: Option<H256>,
}

/// Event hashes observed on the receiving chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivingHashes {
    pub prepare_hash: Option<H256>,
    pub fulfill_hash: Option<H256>,
    pub cancel_hash: Option<H256>,
}

/// Per-side event hashes. A side being `None` means the indexer has not
/// yet observed the corresponding event; the state machine treats that as
/// a soft-skip, not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionHashes {
    pub sending: Option<SendingHashes>,
    pub receiving: Option<ReceivingHashes>,
}

/// Status plus exactly the payload fields valid for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusPayload {
    /// Sender side is locked; the router owes a receiver-side prepare.
    SenderPrepared {
        hashes: TransactionHashes,
        bid_signature: Bytes,
        encoded_bid: Bytes,
        encrypted_call_data: Bytes,
    },
    /// Receiver side released; the user's secret is on chain and the router
    /// can reclaim its sender-side funds.
    ReceiverFulfilled {
        hashes: TransactionHashes,
        signature: Bytes,
        call_data: Bytes,
        relayer_fee: U256,
    },
    /// Receiver lock passed its expiry without a fulfill.
    ReceiverExpired { hashes: TransactionHashes },
    /// Sender lock expired; the transfer will not complete.
    SenderExpired { hashes: TransactionHashes },
    /// Receiver side was cancelled; propagate to the sender side.
    ReceiverCancelled { hashes: TransactionHashes },
    /// The receiving chain is not serviced by this router; unwind sender.
    ReceiverNotConfigured { hashes: TransactionHashes },
}

impl StatusPayload {
    pub fn status(&self) -> Status {
        match self {
            StatusPayload::SenderPrepared { .. } => Status::SenderPrepared,
            StatusPayload::ReceiverFulfilled { .. } => Status::ReceiverFulfilled,
            StatusPayload::ReceiverExpired { .. } => Status::ReceiverExpired,
            StatusPayload::SenderExpired { .. } => Status::SenderExpired,
            StatusPayload::ReceiverCancelled { .. } => Status::ReceiverCancelled,
            StatusPayload::ReceiverNotConfigured { .. } => Status::ReceiverNotConfigured,
        }
    }

    pub fn hashes(&self) -> &TransactionHashes {
        match self {
            StatusPayload::SenderPrepared { hashes, .. }
            | StatusPayload::ReceiverFulfilled { hashes, .. }
            | StatusPayload::ReceiverExpired { hashes }
            | StatusPayload::SenderExpired { hashes }
            | StatusPayload::ReceiverCancelled { hashes }
            | StatusPayload::ReceiverNotConfigured { hashes } => hashes,
        }
    }
}

/// One transfer requiring router action, as produced fresh by the indexer
/// on every poll. Read-through view: never mutated in place, only acted on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveTransaction {
    pub crosschain: CrosschainTransaction,
    pub action: StatusPayload,
}

impl ActiveTransaction {
    pub fn transaction_id(&self) -> H256 {
        self.crosschain.invariant.transaction_id
    }

    pub fn status(&self) -> Status {
        self.action.status()
    }

    /// Chain on which the next on-chain interaction for this status must
    /// happen: the receiving chain when progressing means acting on the
    /// receiver side, otherwise the sending chain.
    pub fn action_chain_id(&self) -> u64 {
        match self.action.status() {
            Status::SenderPrepared | Status::SenderExpired => {
                self.crosschain.invariant.receiving_chain_id
            }
            _ => self.crosschain.invariant.sending_chain_id,
        }
    }
}

/// Which side of a transfer a cancel targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelSide {
    Sender,
    Receiver,
}

impl CancelSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelSide::Sender => "sender",
            CancelSide::Receiver => "receiver",
        }
    }
}

/// Why a transaction was paid for, for financial metrics attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionReason {
    PrepareReceiver,
    FulfillSender,
    CancelSender,
    CancelReceiver,
    Relay,
}

impl TransactionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionReason::PrepareReceiver => "PrepareReceiver",
            TransactionReason::FulfillSender => "FulfillSender",
            TransactionReason::CancelSender => "CancelSender",
            TransactionReason::CancelReceiver => "CancelReceiver",
            TransactionReason::Relay => "Relay",
        }
    }
}
