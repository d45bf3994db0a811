//! Persistent wallet status and append-only transaction audit log.
//!
//! Every phase reads the wallet set through [`StatusStore`] and writes results back through
//! it. Status changes are monotonic: [`StatusStore::advance_status`] never moves a wallet
//! backwards, which is what makes re-running a phase safe.

pub mod memory;
pub mod sqlite;

use alloy::primitives::Address;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use crate::types::{ManagedWallet, RecordKind, RecordStatus, TransactionRecord, WalletStatus};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("wallet {0} is not in the store")]
    UnknownWallet(Address),
    #[error("store lock poisoned")]
    Poisoned,
}

/// Counts by wallet status and by transaction kind/outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateStats {
    pub wallets: BTreeMap<WalletStatus, u64>,
    pub transactions: BTreeMap<(RecordKind, RecordStatus), u64>,
}

impl AggregateStats {
    pub fn wallet_count(&self, status: WalletStatus) -> u64 {
        self.wallets.get(&status).copied().unwrap_or_default()
    }

    pub fn total_wallets(&self) -> u64 {
        self.wallets.values().sum()
    }

    pub fn transaction_count(&self, kind: RecordKind, status: RecordStatus) -> u64 {
        self.transactions
            .get(&(kind, status))
            .copied()
            .unwrap_or_default()
    }
}

impl Display for AggregateStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Wallets ({} total):", self.total_wallets())?;
        for status in WalletStatus::ALL {
            writeln!(f, "  {:<14} {}", status.as_str(), self.wallet_count(status))?;
        }
        writeln!(f, "Transactions:")?;
        writeln!(f, "  {:<16} {:>8} {:>8} {:>8}", "kind", "pending", "success", "failed")?;
        for kind in RecordKind::ALL {
            writeln!(
                f,
                "  {:<16} {:>8} {:>8} {:>8}",
                kind.as_str(),
                self.transaction_count(kind, RecordStatus::Pending),
                self.transaction_count(kind, RecordStatus::Success),
                self.transaction_count(kind, RecordStatus::Failed),
            )?;
        }
        Ok(())
    }
}

pub trait StatusStore: Send + Sync {
    /// Inserts the wallet if it is new, otherwise advances its status if `status` is later.
    ///
    /// Returns `true` when the wallet was inserted.
    fn upsert_wallet(
        &self,
        address: Address,
        status: WalletStatus,
        created_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Moves the wallet forward to `status`.
    ///
    /// Returns `false` (and changes nothing) if the wallet is already at or beyond `status`.
    fn advance_status(&self, address: Address, status: WalletStatus) -> Result<bool, StoreError>;

    fn append_transaction(&self, record: &TransactionRecord) -> Result<(), StoreError>;

    /// Wallets currently in `status`, oldest first.
    fn wallets_by_status(&self, status: WalletStatus) -> Result<Vec<ManagedWallet>, StoreError>;

    /// All wallets, oldest first.
    fn all_wallets(&self) -> Result<Vec<ManagedWallet>, StoreError>;

    fn get_wallet(&self, address: Address) -> Result<Option<ManagedWallet>, StoreError>;

    /// Audit log entries for `address` in append order.
    fn transactions_for(&self, address: Address) -> Result<Vec<TransactionRecord>, StoreError>;

    fn aggregate_stats(&self) -> Result<AggregateStats, StoreError>;

    /// Last block fully processed by the named scanner.
    fn load_cursor(&self, name: &str) -> Result<Option<u64>, StoreError>;

    fn save_cursor(&self, name: &str, block: u64) -> Result<(), StoreError>;

    /// Wallets in any of `statuses`, oldest first.
    fn wallets_in(&self, statuses: &[WalletStatus]) -> Result<Vec<ManagedWallet>, StoreError> {
        let mut wallets = Vec::new();
        for status in statuses {
            wallets.extend(self.wallets_by_status(*status)?);
        }
        wallets.sort_by(|a, b| (a.created_at, a.address).cmp(&(b.created_at, b.address)));
        Ok(wallets)
    }
}

#[cfg(test)]
pub(crate) mod contract_tests {
    //! Behaviour every [`StatusStore`] implementation must share.

    use super::*;
    use crate::chain::ErrorClass;
    use alloy::primitives::{U256, address, b256};
    use chrono::Duration;

    const A: Address = address!("0x00000000000000000000000000000000000000a1");
    const B: Address = address!("0x00000000000000000000000000000000000000b2");

    pub fn upsert_is_idempotent(store: &dyn StatusStore) {
        let now = Utc::now();
        assert!(store.upsert_wallet(A, WalletStatus::Generated, now).unwrap());
        assert!(!store.upsert_wallet(A, WalletStatus::Generated, now).unwrap());
        assert_eq!(store.all_wallets().unwrap().len(), 1);
    }

    pub fn advance_is_monotonic(store: &dyn StatusStore) {
        store
            .upsert_wallet(A, WalletStatus::Generated, Utc::now())
            .unwrap();
        assert!(store.advance_status(A, WalletStatus::Consolidated).unwrap());
        assert!(!store.advance_status(A, WalletStatus::Actioned).unwrap());
        assert!(!store.advance_status(A, WalletStatus::Consolidated).unwrap());
        assert_eq!(
            store.get_wallet(A).unwrap().unwrap().status,
            WalletStatus::Consolidated
        );
        assert!(matches!(
            store.advance_status(B, WalletStatus::Funded),
            Err(StoreError::UnknownWallet(_))
        ));
    }

    pub fn wallets_ordered_oldest_first(store: &dyn StatusStore) {
        let now = Utc::now();
        store
            .upsert_wallet(B, WalletStatus::Funded, now - Duration::seconds(10))
            .unwrap();
        store.upsert_wallet(A, WalletStatus::Funded, now).unwrap();
        let funded: Vec<Address> = store
            .wallets_by_status(WalletStatus::Funded)
            .unwrap()
            .into_iter()
            .map(|w| w.address)
            .collect();
        assert_eq!(funded, vec![B, A]);
        assert!(store
            .wallets_by_status(WalletStatus::Generated)
            .unwrap()
            .is_empty());
    }

    pub fn records_round_trip_and_aggregate(store: &dyn StatusStore) {
        store
            .upsert_wallet(A, WalletStatus::Generated, Utc::now())
            .unwrap();
        store
            .upsert_wallet(B, WalletStatus::Generated, Utc::now())
            .unwrap();
        store.advance_status(B, WalletStatus::Funded).unwrap();

        let hash = b256!("0x1111111111111111111111111111111111111111111111111111111111111111");
        let success = TransactionRecord::new(A, RecordKind::Fund, RecordStatus::Success)
            .with_hash(hash)
            .with_amount(U256::from(10_000_000_000_000_000u64))
            .with_block(Some(42));
        let failed = TransactionRecord::new(A, RecordKind::Action, RecordStatus::Failed)
            .with_error(ErrorClass::Reverted);
        store.append_transaction(&success).unwrap();
        store.append_transaction(&failed).unwrap();

        let records = store.transactions_for(A).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].tx_hash, Some(hash));
        assert_eq!(records[0].amount, success.amount);
        assert_eq!(records[0].block_number, Some(42));
        assert_eq!(records[1].error_class, Some(ErrorClass::Reverted));
        assert_eq!(records[1].tx_hash, None);
        assert!(store.transactions_for(B).unwrap().is_empty());

        let stats = store.aggregate_stats().unwrap();
        assert_eq!(stats.total_wallets(), 2);
        assert_eq!(stats.wallet_count(WalletStatus::Generated), 1);
        assert_eq!(stats.wallet_count(WalletStatus::Funded), 1);
        assert_eq!(stats.transaction_count(RecordKind::Fund, RecordStatus::Success), 1);
        assert_eq!(stats.transaction_count(RecordKind::Action, RecordStatus::Failed), 1);
        assert_eq!(stats.transaction_count(RecordKind::Refund, RecordStatus::Success), 0);
    }

    pub fn cursors_persist(store: &dyn StatusStore) {
        assert_eq!(store.load_cursor("watch").unwrap(), None);
        store.save_cursor("watch", 100).unwrap();
        store.save_cursor("watch", 250).unwrap();
        assert_eq!(store.load_cursor("watch").unwrap(), Some(250));
        assert_eq!(store.load_cursor("other").unwrap(), None);
    }
}
