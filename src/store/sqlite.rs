//! SQLite-backed [`StatusStore`].

use alloy::primitives::{Address, TxHash, U256};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use super::{AggregateStats, StatusStore, StoreError};
use crate::types::{ManagedWallet, RecordKind, RecordStatus, TransactionRecord, WalletStatus};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS wallets (
    address     TEXT PRIMARY KEY NOT NULL,
    status      TEXT NOT NULL,
    status_rank INTEGER NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_wallets_status ON wallets(status);

CREATE TABLE IF NOT EXISTS transactions (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    wallet_address      TEXT NOT NULL,
    kind                TEXT NOT NULL,
    tx_hash             TEXT,
    status              TEXT NOT NULL,
    amount              TEXT NOT NULL,
    block_number        INTEGER,
    gas_used            INTEGER,
    effective_gas_price TEXT,
    error_class         TEXT,
    timestamp           TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_transactions_wallet ON transactions(wallet_address);

CREATE TABLE IF NOT EXISTS cursors (
    name  TEXT PRIMARY KEY NOT NULL,
    block INTEGER NOT NULL
);
";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path` in WAL mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).ok();
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        tracing::debug!(path = %path.display(), "opened status store");
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn rank(status: WalletStatus) -> i64 {
    status as i64
}

fn parse_text<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let text: String = row.get(idx)?;
    text.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn parse_optional<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let text: Option<String> = row.get(idx)?;
    text.map(|text| {
        text.parse::<T>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
    })
    .transpose()
}

/// Fixed-width UTC text so that lexical order is chronological order.
fn timestamp_text(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn wallet_from_row(row: &Row<'_>) -> rusqlite::Result<ManagedWallet> {
    Ok(ManagedWallet {
        address: parse_text(row, 0)?,
        status: parse_text(row, 1)?,
        created_at: parse_timestamp(row, 2)?,
    })
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<TransactionRecord> {
    Ok(TransactionRecord {
        wallet_address: parse_text(row, 0)?,
        kind: parse_text(row, 1)?,
        tx_hash: parse_optional::<TxHash>(row, 2)?,
        status: parse_text(row, 3)?,
        amount: parse_text::<U256>(row, 4)?,
        block_number: row.get::<_, Option<i64>>(5)?.map(|b| b as u64),
        gas_used: row.get::<_, Option<i64>>(6)?.map(|g| g as u64),
        effective_gas_price: parse_optional::<u128>(row, 7)?,
        error_class: parse_optional(row, 8)?,
        timestamp: parse_timestamp(row, 9)?,
    })
}

const WALLET_COLUMNS: &str = "address, status, created_at";

impl StatusStore for SqliteStore {
    fn upsert_wallet(
        &self,
        address: Address,
        status: WalletStatus,
        created_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO wallets (address, status, status_rank, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                address.to_string(),
                status.as_str(),
                rank(status),
                timestamp_text(&created_at)
            ],
        )?;
        if inserted == 0 {
            conn.execute(
                "UPDATE wallets SET status = ?2, status_rank = ?3
                 WHERE address = ?1 AND status_rank < ?3",
                params![address.to_string(), status.as_str(), rank(status)],
            )?;
        }
        Ok(inserted > 0)
    }

    fn advance_status(&self, address: Address, status: WalletStatus) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE wallets SET status = ?2, status_rank = ?3
             WHERE address = ?1 AND status_rank < ?3",
            params![address.to_string(), status.as_str(), rank(status)],
        )?;
        if updated > 0 {
            return Ok(true);
        }
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM wallets WHERE address = ?1",
                params![address.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match exists {
            Some(_) => Ok(false),
            None => Err(StoreError::UnknownWallet(address)),
        }
    }

    fn append_transaction(&self, record: &TransactionRecord) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT INTO transactions (
                wallet_address, kind, tx_hash, status, amount, block_number,
                gas_used, effective_gas_price, error_class, timestamp
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.wallet_address.to_string(),
                record.kind.as_str(),
                record.tx_hash.map(|h| h.to_string()),
                record.status.as_str(),
                record.amount.to_string(),
                record.block_number.map(|b| b as i64),
                record.gas_used.map(|g| g as i64),
                record.effective_gas_price.map(|p| p.to_string()),
                record.error_class.map(|c| c.as_str()),
                timestamp_text(&record.timestamp),
            ],
        )?;
        Ok(())
    }

    fn wallets_by_status(&self, status: WalletStatus) -> Result<Vec<ManagedWallet>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {WALLET_COLUMNS} FROM wallets WHERE status = ?1 ORDER BY created_at, address"
        ))?;
        let wallets = stmt
            .query_map(params![status.as_str()], wallet_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(wallets)
    }

    fn all_wallets(&self) -> Result<Vec<ManagedWallet>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {WALLET_COLUMNS} FROM wallets ORDER BY created_at, address"
        ))?;
        let wallets = stmt
            .query_map([], wallet_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(wallets)
    }

    fn get_wallet(&self, address: Address) -> Result<Option<ManagedWallet>, StoreError> {
        let conn = self.conn()?;
        let wallet = conn
            .query_row(
                &format!("SELECT {WALLET_COLUMNS} FROM wallets WHERE address = ?1"),
                params![address.to_string()],
                wallet_from_row,
            )
            .optional()?;
        Ok(wallet)
    }

    fn transactions_for(&self, address: Address) -> Result<Vec<TransactionRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT wallet_address, kind, tx_hash, status, amount, block_number,
                    gas_used, effective_gas_price, error_class, timestamp
             FROM transactions WHERE wallet_address = ?1 ORDER BY id",
        )?;
        let records = stmt
            .query_map(params![address.to_string()], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn aggregate_stats(&self) -> Result<AggregateStats, StoreError> {
        let conn = self.conn()?;
        let mut stats = AggregateStats::default();

        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM wallets GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((parse_text::<WalletStatus>(row, 0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            stats.wallets.insert(status, count as u64);
        }

        let mut stmt =
            conn.prepare("SELECT kind, status, COUNT(*) FROM transactions GROUP BY kind, status")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                parse_text::<RecordKind>(row, 0)?,
                parse_text::<RecordStatus>(row, 1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        for row in rows {
            let (kind, status, count) = row?;
            stats.transactions.insert((kind, status), count as u64);
        }
        Ok(stats)
    }

    fn load_cursor(&self, name: &str) -> Result<Option<u64>, StoreError> {
        let block: Option<i64> = self
            .conn()?
            .query_row(
                "SELECT block FROM cursors WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(block.map(|b| b as u64))
    }

    fn save_cursor(&self, name: &str, block: u64) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT INTO cursors (name, block) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET block = excluded.block",
            params![name, block as i64],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract_tests;
    use alloy::primitives::address;

    fn store() -> SqliteStore {
        SqliteStore::in_memory().unwrap()
    }

    #[test]
    fn test_upsert_is_idempotent() {
        contract_tests::upsert_is_idempotent(&store());
    }

    #[test]
    fn test_advance_is_monotonic() {
        contract_tests::advance_is_monotonic(&store());
    }

    #[test]
    fn test_wallets_ordered_oldest_first() {
        contract_tests::wallets_ordered_oldest_first(&store());
    }

    #[test]
    fn test_records_round_trip_and_aggregate() {
        contract_tests::records_round_trip_and_aggregate(&store());
    }

    #[test]
    fn test_cursors_persist() {
        contract_tests::cursors_persist(&store());
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("fleet.db");
        let wallet = address!("0x00000000000000000000000000000000000000c3");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .upsert_wallet(wallet, WalletStatus::Generated, Utc::now())
                .unwrap();
            store.advance_status(wallet, WalletStatus::Funded).unwrap();
            store.save_cursor("watch", 77).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(
            store.get_wallet(wallet).unwrap().unwrap().status,
            WalletStatus::Funded
        );
        assert_eq!(store.load_cursor("watch").unwrap(), Some(77));
    }
}
