//! Liquidity reservation cache
//!
//! Tracks in-flight auction bids per (chain, asset) so outstanding liquidity
//! is not double-counted while a prepare is underway. A bid is added when
//! the router responds to an auction, confirmed (window extended) right
//! before the receiver-side prepare is submitted, and removed once the
//! prepare attempt completes on any path. Every confirm must be paired with
//! exactly one eventual remove.

use dashmap::DashMap;
use ethers::types::{Address, H256, U256};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Bids expire from quoting after this long unless confirmed.
const BID_TTL: Duration = Duration::from_secs(60 * 5);
/// A confirmed bid stays reserved long enough to cover the prepare
/// submission, including the relay event-wait timeout.
const CONFIRMED_BID_TTL: Duration = Duration::from_secs(60 * 10);

#[derive(Debug, Clone)]
struct Reservation {
    amount: U256,
    expires_at: Instant,
    confirmed: bool,
}

/// Per-(chain, asset) outstanding-liquidity accounting keyed by
/// transaction id.
pub struct AuctionCache {
    reservations: DashMap<(u64, Address), HashMap<H256, Reservation>>,
}

impl AuctionCache {
    pub fn new() -> Self {
        Self {
            reservations: DashMap::new(),
        }
    }

    /// Record an auction bid. Called by the quoting layer when a bid is
    /// sent; the amount counts against available liquidity until removed
    /// or expired.
    pub fn add_bid(&self, chain_id: u64, asset_id: Address, transaction_id: H256, amount: U256) {
        self.reservations
            .entry((chain_id, asset_id))
            .or_default()
            .insert(
                transaction_id,
                Reservation {
                    amount,
                    expires_at: Instant::now() + BID_TTL,
                    confirmed: false,
                },
            );
    }

    /// Mark a bid as going ahead with the on-chain prepare, extending its
    /// reservation window past the submission timeout. Returns false when
    /// no live bid exists for the transaction; callers log and proceed,
    /// since the worst outcome is a transient overstatement of available
    /// liquidity in quoting.
    pub fn confirm_bid(&self, chain_id: u64, asset_id: Address, transaction_id: H256) -> bool {
        let mut entry = match self.reservations.get_mut(&(chain_id, asset_id)) {
            Some(entry) => entry,
            None => return false,
        };
        match entry.get_mut(&transaction_id) {
            Some(reservation) if reservation.expires_at > Instant::now() => {
                reservation.confirmed = true;
                reservation.expires_at = Instant::now() + CONFIRMED_BID_TTL;
                true
            }
            _ => false,
        }
    }

    /// Release the reservation once the prepare attempt has completed,
    /// successfully or not. On success the liquidity moves from outstanding
    /// to locked in the transfer and the balance reflects that on chain.
    pub fn remove_bid(&self, chain_id: u64, asset_id: Address, transaction_id: H256) {
        if let Some(mut entry) = self.reservations.get_mut(&(chain_id, asset_id)) {
            if entry.remove(&transaction_id).is_some() {
                debug!(
                    chain_id,
                    asset_id = ?asset_id,
                    transaction_id = ?transaction_id,
                    "Released liquidity reservation"
                );
            }
        }
    }

    /// Sum of unexpired reservations for a (chain, asset) pair. Consulted
    /// by the quoting layer when computing available liquidity.
    pub fn outstanding_liquidity(&self, chain_id: u64, asset_id: Address) -> U256 {
        let now = Instant::now();
        self.reservations
            .get(&(chain_id, asset_id))
            .map(|entry| {
                entry
                    .values()
                    .filter(|r| r.expires_at > now)
                    .fold(U256::zero(), |acc, r| acc.saturating_add(r.amount))
            })
            .unwrap_or_default()
    }

    /// Drop reservations past their deadline. Called periodically by the
    /// reconciliation loop; a confirmed bid whose handler never reached
    /// `remove_bid` lapses once its extended window passes.
    pub fn prune(&self) {
        self.prune_at(Instant::now());
    }

    fn prune_at(&self, now: Instant) {
        for mut entry in self.reservations.iter_mut() {
            entry.retain(|_, r| r.expires_at > now);
        }
    }
}

impl Default for AuctionCache {
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
    fn confirm_requires_live_bid() {
        let cache = AuctionCache::new();
        let asset = Address::from_low_u64_be(1);

        assert!(!cache.confirm_bid(1338, asset, id(1)));

        cache.add_bid(1338, asset, id(1), U256::from(500u64));
        assert!(cache.confirm_bid(1338, asset, id(1)));
    }

    #[test]
    fn outstanding_sums_per_chain_asset() {
        let cache = AuctionCache::new();
        let asset = Address::from_low_u64_be(1);
        let other = Address::from_low_u64_be(2);

        cache.add_bid(1338, asset, id(1), U256::from(500u64));
        cache.add_bid(1338, asset, id(2), U256::from(250u64));
        cache.add_bid(1338, other, id(3), U256::from(100u64));

        assert_eq!(
            cache.outstanding_liquidity(1338, asset),
            U256::from(750u64)
        );
        assert_eq!(
            cache.outstanding_liquidity(1338, other),
            U256::from(100u64)
        );
        assert_eq!(cache.outstanding_liquidity(1337, asset), U256::zero());
    }

    #[test]
    fn remove_releases_reservation() {
        let cache = AuctionCache::new();
        let asset = Address::from_low_u64_be(1);

        cache.add_bid(1338, asset, id(1), U256::from(500u64));
        assert!(cache.confirm_bid(1338, asset, id(1)));
        cache.remove_bid(1338, asset, id(1));

        assert_eq!(cache.outstanding_liquidity(1338, asset), U256::zero());
        // removing again is a no-op, and the bid can no longer be confirmed
        cache.remove_bid(1338, asset, id(1));
        assert!(!cache.confirm_bid(1338, asset, id(1)));
    }

    #[test]
    fn prune_keeps_confirmed_reservations_within_window() {
        let cache = AuctionCache::new();
        let asset = Address::from_low_u64_be(1);

        cache.add_bid(1338, asset, id(1), U256::from(500u64));
        cache.confirm_bid(1338, asset, id(1));
        cache.prune();
        assert_eq!(
            cache.outstanding_liquidity(1338, asset),
            U256::from(500u64)
        );
    }

    #[test]
    fn prune_drops_confirmed_reservation_after_extended_window() {
        let cache = AuctionCache::new();
        let asset = Address::from_low_u64_be(1);

        // confirmed but never released, as when a handler dies between
        // confirm_bid and remove_bid
        cache.add_bid(1338, asset, id(1), U256::from(500u64));
        assert!(cache.confirm_bid(1338, asset, id(1)));

        cache.prune_at(Instant::now() + CONFIRMED_BID_TTL + Duration::from_secs(1));

        assert_eq!(cache.outstanding_liquidity(1338, asset), U256::zero());
        assert!(!cache.confirm_bid(1338, asset, id(1)));
    }
}
