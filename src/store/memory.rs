//! In-process [`StatusStore`] used by tests and dry runs.

use alloy::primitives::Address;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Mutex, MutexGuard};

use super::{AggregateStats, StatusStore, StoreError};
use crate::types::{ManagedWallet, TransactionRecord, WalletStatus};

#[derive(Debug, Default)]
struct Inner {
    wallets: HashMap<Address, ManagedWallet>,
    transactions: Vec<TransactionRecord>,
    cursors: HashMap<String, u64>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies the full contents of another store.
    ///
    /// Dry runs operate on a snapshot so the real store is never written.
    pub fn snapshot_of(source: &dyn StatusStore) -> Result<Self, StoreError> {
        let store = Self::new();
        {
            let mut inner = store.lock()?;
            for wallet in source.all_wallets()? {
                let records = source.transactions_for(wallet.address)?;
                inner.transactions.extend(records);
                inner.wallets.insert(wallet.address, wallet);
            }
            inner.transactions.sort_by_key(|r| r.timestamp);
        }
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn sorted(mut wallets: Vec<ManagedWallet>) -> Vec<ManagedWallet> {
    wallets.sort_by(|a, b| (a.created_at, a.address).cmp(&(b.created_at, b.address)));
    wallets
}

impl StatusStore for MemoryStore {
    fn upsert_wallet(
        &self,
        address: Address,
        status: WalletStatus,
        created_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        match inner.wallets.entry(address) {
            Entry::Occupied(mut existing) => {
                let existing = existing.get_mut();
                if existing.status.advances_to(status) {
                    existing.status = status;
                }
                Ok(false)
            }
            Entry::Vacant(slot) => {
                slot.insert(ManagedWallet {
                    address,
                    status,
                    created_at,
                });
                Ok(true)
            }
        }
    }

    fn advance_status(&self, address: Address, status: WalletStatus) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        let wallet = inner
            .wallets
            .get_mut(&address)
            .ok_or(StoreError::UnknownWallet(address))?;
        if !wallet.status.advances_to(status) {
            return Ok(false);
        }
        wallet.status = status;
        Ok(true)
    }

    fn append_transaction(&self, record: &TransactionRecord) -> Result<(), StoreError> {
        self.lock()?.transactions.push(record.clone());
        Ok(())
    }

    fn wallets_by_status(&self, status: WalletStatus) -> Result<Vec<ManagedWallet>, StoreError> {
        let inner = self.lock()?;
        Ok(sorted(
            inner
                .wallets
                .values()
                .filter(|w| w.status == status)
                .cloned()
                .collect(),
        ))
    }

    fn all_wallets(&self) -> Result<Vec<ManagedWallet>, StoreError> {
        Ok(sorted(self.lock()?.wallets.values().cloned().collect()))
    }

    fn get_wallet(&self, address: Address) -> Result<Option<ManagedWallet>, StoreError> {
        Ok(self.lock()?.wallets.get(&address).cloned())
    }

    fn transactions_for(&self, address: Address) -> Result<Vec<TransactionRecord>, StoreError> {
        Ok(self
            .lock()?
            .transactions
            .iter()
            .filter(|r| r.wallet_address == address)
            .cloned()
            .collect())
    }

    fn aggregate_stats(&self) -> Result<AggregateStats, StoreError> {
        let inner = self.lock()?;
        let mut stats = AggregateStats::default();
        for wallet in inner.wallets.values() {
            *stats.wallets.entry(wallet.status).or_default() += 1;
        }
        for record in &inner.transactions {
            *stats
                .transactions
                .entry((record.kind, record.status))
                .or_default() += 1;
        }
        Ok(stats)
    }

    fn load_cursor(&self, name: &str) -> Result<Option<u64>, StoreError> {
        Ok(self.lock()?.cursors.get(name).copied())
    }

    fn save_cursor(&self, name: &str, block: u64) -> Result<(), StoreError> {
        self.lock()?.cursors.insert(name.to_string(), block);
        Ok(())
    }
}
