//! Dedup tracker for in-flight transfer handling
//!
//! The reconciliation loop produces the same transaction on every poll until
//! its status advances. The tracker is the sole concurrency-safety mechanism
//! preventing two overlapping attempts at the same logical action: an entry
//! is claimed with the `Processing` sentinel before any async work starts,
//! then either committed with the confirmed block to wait behind, or
//! discarded so the next poll can retry.

use crate::types::Status;

use dashmap::DashMap;
use ethers::types::H256;

/// Recorded handling state for one transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackedStatus {
    /// Claimed by an in-flight handling task.
    Processing,
    /// Handled; holds the status that was acted on.
    Completed(Status),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerEntry {
    pub status: TrackedStatus,
    pub chain_id: u64,
    pub block: u64,
}

/// Process-wide map of transaction id to handling state. Only the four
/// lifecycle operations are exposed; the raw map never escapes.
pub struct HandlingTracker {
    entries: DashMap<H256, TrackerEntry>,
}

impl HandlingTracker {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Claim a transaction for handling. Returns false when the id is
    /// already recorded with the same status or with the `Processing`
    /// sentinel; the caller must then skip dispatch entirely. The claim is
    /// written before returning so concurrent callers cannot both succeed.
    pub fn try_begin_processing(&self, transaction_id: H256, status: Status, chain_id: u64) -> bool {
        // entry() holds the shard lock across the check and the insert,
        // giving get-or-set atomicity.
        let mut claimed = false;
        self.entries
            .entry(transaction_id)
            .and_modify(|existing| match existing.status {
                TrackedStatus::Processing => {}
                TrackedStatus::Completed(s) if s == status => {}
                _ => {
                    *existing = TrackerEntry {
                        status: TrackedStatus::Processing,
                        chain_id,
                        block: 0,
                    };
                    claimed = true;
                }
            })
            .or_insert_with(|| {
                claimed = true;
                TrackerEntry {
                    status: TrackedStatus::Processing,
                    chain_id,
                    block: 0,
                }
            });
        claimed
    }

    /// Record a successful handling with the block number the receipt
    /// landed in. The entry now blocks re-dispatch for the same status
    /// until the indexer advances past it.
    pub fn commit(&self, transaction_id: H256, status: Status, chain_id: u64, block: u64) {
        self.entries.insert(
            transaction_id,
            TrackerEntry {
                status: TrackedStatus::Completed(status),
                chain_id,
                block,
            },
        );
    }

    /// Drop the entry: handling failed, or succeeded with nothing to wait
    /// on. The next poll cycle may retry.
    pub fn discard(&self, transaction_id: H256) {
        self.entries.remove(&transaction_id);
    }

    /// Remove entries whose recorded status is the terminal
    /// `ReceiverFulfilled` and whose block is at or below the indexer's
    /// synced head for the given chain. No subsequent poll will ever
    /// produce a different status for these, so nothing else would ever
    /// remove them.
    pub fn reap_terminal(&self, chain_id: u64, synced_block: u64) -> Vec<H256> {
        let reapable: Vec<H256> = self
            .entries
            .iter()
            .filter(|entry| {
                entry.chain_id == chain_id
                    && entry.block > 0
                    && entry.block <= synced_block
                    && entry.status == TrackedStatus::Completed(Status::ReceiverFulfilled)
            })
            .map(|entry| *entry.key())
            .collect();

        for id in &reapable {
            self.entries.remove(id);
        }
        reapable
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current entry for a transaction, if any.
    pub fn get(&self, transaction_id: H256) -> Option<TrackerEntry> {
        self.entries.get(&transaction_id).map(|e| *e.value())
    }
}

impl Default for HandlingTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> H256 {
        H256::from_low_u64_be(n)
    }

    #[test]
    fn claim_blocks_same_status_and_processing() {
        let tracker = HandlingTracker::new();

        assert!(tracker.try_begin_processing(id(1), Status::SenderPrepared, 1338));
        // second claim while Processing must fail
        assert!(!tracker.try_begin_processing(id(1), Status::SenderPrepared, 1338));
        // a different status is also blocked while Processing
        assert!(!tracker.try_begin_processing(id(1), Status::ReceiverFulfilled, 1337));
    }

    #[test]
    fn committed_status_blocks_same_but_not_next_status() {
        let tracker = HandlingTracker::new();

        assert!(tracker.try_begin_processing(id(1), Status::SenderPrepared, 1338));
        tracker.commit(id(1), Status::SenderPrepared, 1338, 42);

        // same status again: the indexer has not advanced, skip
        assert!(!tracker.try_begin_processing(id(1), Status::SenderPrepared, 1338));
        // status advanced: must dispatch
        assert!(tracker.try_begin_processing(id(1), Status::ReceiverFulfilled, 1337));
    }

    #[test]
    fn discard_allows_retry() {
        let tracker = HandlingTracker::new();

        assert!(tracker.try_begin_processing(id(1), Status::ReceiverExpired, 1337));
        tracker.discard(id(1));
        assert!(tracker.try_begin_processing(id(1), Status::ReceiverExpired, 1337));
    }

    #[test]
    fn reap_removes_only_synced_terminal_entries() {
        let tracker = HandlingTracker::new();

        tracker.commit(id(1), Status::ReceiverFulfilled, 1337, 100);
        tracker.commit(id(2), Status::ReceiverFulfilled, 1337, 200);
        tracker.commit(id(3), Status::SenderPrepared, 1337, 50);
        tracker.commit(id(4), Status::ReceiverFulfilled, 1338, 50);

        let reaped = tracker.reap_terminal(1337, 150);
        assert_eq!(reaped, vec![id(1)]);
        assert_eq!(tracker.len(), 3);

        // entry 2 becomes reapable once the head catches up
        let reaped = tracker.reap_terminal(1337, 200);
        assert_eq!(reaped, vec![id(2)]);
        // non-terminal and other-chain entries stay
        assert!(tracker.get(id(3)).is_some());
        assert!(tracker.get(id(4)).is_some());
    }

    #[test]
    fn processing_entries_are_never_reaped() {
        let tracker = HandlingTracker::new();
        assert!(tracker.try_begin_processing(id(1), Status::ReceiverFulfilled, 1337));
        assert!(tracker.reap_terminal(1337, u64::MAX).is_empty());
    }
}
