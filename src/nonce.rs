//! Local monotonic sequence (nonce) allocation.
//!
//! The funding account dispatches many transfers concurrently, so its nonce is the one piece
//! of shared mutable state in the pipeline. [`SequenceCounter`] seeds each address from the
//! node's pending transaction count the first time it is used, then hands out strictly
//! increasing values from a per-address mutex.
//!
//! A value is only ever given back through [`SequenceCounter::release`], and only when the
//! node definitely rejected the transaction that carried it. Released values are handed out
//! again, lowest first, so a rejected transfer in the middle of a batch leaves no gap.
//! [`SequenceCounter::resync`] is the one path that consults the node again after seeding,
//! and it never moves below a value that is already handed out.

use alloy::primitives::Address;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::chain::{ChainClient, ChainError};

#[derive(Debug, Default)]
struct Slot {
    /// Highest value handed out; `None` until seeded from the node.
    last: Option<u64>,
    /// Values returned after a definite rejection.
    recycled: BTreeSet<u64>,
}

#[derive(Clone, Debug, Default)]
pub struct SequenceCounter {
    sequences: Arc<DashMap<Address, Arc<Mutex<Slot>>>>,
}

impl SequenceCounter {
    fn slot(&self, address: Address) -> Arc<Mutex<Slot>> {
        // Clone the Arc out so the dashmap shard lock is not held across an await.
        let entry = self.sequences.entry(address).or_default();
        Arc::clone(entry.value())
    }

    /// Allocates the next sequence number for `address`.
    pub async fn next<C: ChainClient + ?Sized>(
        &self,
        chain: &C,
        address: Address,
    ) -> Result<u64, ChainError> {
        let slot = self.slot(address);
        let mut slot = slot.lock().await;
        if let Some(reused) = slot.recycled.pop_first() {
            tracing::debug!(%address, nonce = reused, "reusing released sequence");
            return Ok(reused);
        }
        let allocated = match slot.last {
            Some(last) => last + 1,
            None => {
                let pending = chain.get_transaction_count(address).await?;
                tracing::info!(%address, nonce = pending, "seeded sequence from pending count");
                pending
            }
        };
        slot.last = Some(allocated);
        tracing::debug!(%address, nonce = allocated, "allocated sequence");
        Ok(allocated)
    }

    /// Returns `nonce` for reuse. Only call this when no transaction carrying it can be in
    /// the mempool.
    pub async fn release(&self, address: Address, nonce: u64) {
        let Some(slot) = self.sequences.get(&address).map(|entry| Arc::clone(entry.value())) else {
            return;
        };
        let mut slot = slot.lock().await;
        if slot.last.is_some_and(|last| nonce <= last) {
            slot.recycled.insert(nonce);
            tracing::debug!(%address, nonce, "released sequence");
        }
    }

    /// Allocates a replacement for a sequence the node reported as already used.
    ///
    /// Re-reads the pending count, drops released values the node has moved past, and never
    /// returns a value at or below one still held by another task.
    pub async fn resync<C: ChainClient + ?Sized>(
        &self,
        chain: &C,
        address: Address,
    ) -> Result<u64, ChainError> {
        let slot = self.slot(address);
        let mut slot = slot.lock().await;
        let pending = chain.get_transaction_count(address).await?;
        slot.recycled.retain(|nonce| *nonce >= pending);
        if let Some(reused) = slot.recycled.pop_first() {
            tracing::info!(%address, nonce = reused, pending, "resynced onto released sequence");
            return Ok(reused);
        }
        let allocated = slot.last.map_or(pending, |last| (last + 1).max(pending));
        slot.last = Some(allocated);
        tracing::info!(%address, nonce = allocated, pending, "resynced sequence");
        Ok(allocated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockChain;
    use alloy::primitives::address;
    use std::collections::HashSet;

    #[tokio::test]
    async fn test_seeds_from_pending_count_then_increments() {
        let chain = MockChain::new();
        let funder = address!("0x0000000000000000000000000000000000000001");
        chain.set_nonce(funder, 7);
        let counter = SequenceCounter::default();

        assert_eq!(counter.next(&chain, funder).await.unwrap(), 7);
        assert_eq!(counter.next(&chain, funder).await.unwrap(), 8);
        assert_eq!(counter.next(&chain, funder).await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_released_sequence_is_reused_first() {
        let chain = MockChain::new();
        let funder = address!("0x0000000000000000000000000000000000000002");
        chain.set_nonce(funder, 50);
        let counter = SequenceCounter::default();

        assert_eq!(counter.next(&chain, funder).await.unwrap(), 50);
        assert_eq!(counter.next(&chain, funder).await.unwrap(), 51);
        assert_eq!(counter.next(&chain, funder).await.unwrap(), 52);

        counter.release(funder, 51).await;
        assert_eq!(counter.next(&chain, funder).await.unwrap(), 51);
        assert_eq!(counter.next(&chain, funder).await.unwrap(), 53);
    }

    #[tokio::test]
    async fn test_release_ignores_values_never_handed_out() {
        let chain = MockChain::new();
        let funder = address!("0x0000000000000000000000000000000000000004");
        let counter = SequenceCounter::default();

        counter.release(funder, 0).await;
        assert!(!counter.sequences.contains_key(&funder));

        assert_eq!(counter.next(&chain, funder).await.unwrap(), 0);
        counter.release(funder, 9).await;
        assert_eq!(counter.next(&chain, funder).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_resync_never_moves_below_held_sequences() {
        let chain = MockChain::new();
        let funder = address!("0x0000000000000000000000000000000000000005");
        let counter = SequenceCounter::default();

        for expected in 0..4 {
            assert_eq!(counter.next(&chain, funder).await.unwrap(), expected);
        }
        // Only nonce 0 is known to the node; 1..=3 are still held by in-flight tasks.
        chain.set_nonce(funder, 1);
        assert_eq!(counter.resync(&chain, funder).await.unwrap(), 4);
        assert_eq!(counter.next(&chain, funder).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_resync_jumps_to_pending_count_and_drops_consumed_releases() {
        let chain = MockChain::new();
        let funder = address!("0x0000000000000000000000000000000000000006");
        let counter = SequenceCounter::default();

        for _ in 0..3 {
            counter.next(&chain, funder).await.unwrap();
        }
        counter.release(funder, 1).await;
        // Another process used the account up to nonce 9.
        chain.set_nonce(funder, 10);
        assert_eq!(counter.resync(&chain, funder).await.unwrap(), 10);
        assert_eq!(counter.next(&chain, funder).await.unwrap(), 11);
    }

    #[tokio::test]
    async fn test_addresses_are_independent() {
        let chain = MockChain::new();
        let a = address!("0x0000000000000000000000000000000000000001");
        let b = address!("0x0000000000000000000000000000000000000002");
        chain.set_nonce(a, 10);
        chain.set_nonce(b, 20);
        let counter = SequenceCounter::default();

        assert_eq!(counter.next(&chain, a).await.unwrap(), 10);
        assert_eq!(counter.next(&chain, b).await.unwrap(), 20);
        counter.release(a, 10).await;
        assert_eq!(counter.next(&chain, b).await.unwrap(), 21);
        assert_eq!(counter.next(&chain, a).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_concurrent_allocations_never_collide() {
        let chain = Arc::new(MockChain::new());
        let funder = address!("0x0000000000000000000000000000000000000003");
        chain.set_nonce(funder, 100);
        let counter = SequenceCounter::default();

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let chain = Arc::clone(&chain);
                let counter = counter.clone();
                tokio::spawn(async move { counter.next(chain.as_ref(), funder).await.unwrap() })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            assert!(seen.insert(handle.await.unwrap()));
        }
        assert_eq!(seen, (100..132).collect::<HashSet<u64>>());
    }
}
