//! Wallet and audit-log types shared by every phase.
//!
//! A [`ManagedWallet`] carries only public data: the signing secret lives behind a
//! [`crate::credentials::CredentialProvider`] and never reaches the status store.
//! [`TransactionRecord`]s form an append-only audit log; one wallet has many records.

use alloy::primitives::{Address, TxHash, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::chain::{ErrorClass, TxReceipt};

/// Lifecycle position of a managed wallet.
///
/// Ordering is meaningful: a status only ever advances to a greater variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WalletStatus {
    Generated,
    Funded,
    Actioned,
    Consolidated,
    Refunded,
}

impl WalletStatus {
    pub const ALL: [WalletStatus; 5] = [
        WalletStatus::Generated,
        WalletStatus::Funded,
        WalletStatus::Actioned,
        WalletStatus::Consolidated,
        WalletStatus::Refunded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WalletStatus::Generated => "generated",
            WalletStatus::Funded => "funded",
            WalletStatus::Actioned => "actioned",
            WalletStatus::Consolidated => "consolidated",
            WalletStatus::Refunded => "refunded",
        }
    }

    /// Whether moving from `self` to `next` is a forward step.
    pub fn advances_to(&self, next: WalletStatus) -> bool {
        next > *self
    }
}

impl Display for WalletStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown status or record discriminator.
#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseTagError {
    kind: &'static str,
    value: String,
}

impl FromStr for WalletStatus {
    type Err = ParseTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WalletStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseTagError {
                kind: "wallet status",
                value: s.to_string(),
            })
    }
}

/// A wallet operated on by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedWallet {
    pub address: Address,
    pub status: WalletStatus,
    pub created_at: DateTime<Utc>,
}

/// What a [`TransactionRecord`] is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecordKind {
    Fund,
    Action,
    Consolidate,
    Refund,
    EventDetected,
}

impl RecordKind {
    pub const ALL: [RecordKind; 5] = [
        RecordKind::Fund,
        RecordKind::Action,
        RecordKind::Consolidate,
        RecordKind::Refund,
        RecordKind::EventDetected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Fund => "fund",
            RecordKind::Action => "action",
            RecordKind::Consolidate => "consolidate",
            RecordKind::Refund => "refund",
            RecordKind::EventDetected => "event-detected",
        }
    }
}

impl Display for RecordKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = ParseTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecordKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ParseTagError {
                kind: "record kind",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecordStatus {
    Pending,
    Success,
    Failed,
}

impl RecordStatus {
    pub const ALL: [RecordStatus; 3] = [
        RecordStatus::Pending,
        RecordStatus::Success,
        RecordStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Success => "success",
            RecordStatus::Failed => "failed",
        }
    }
}

impl Display for RecordStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = ParseTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecordStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseTagError {
                kind: "record status",
                value: s.to_string(),
            })
    }
}

/// One audit-log entry: a submission attempt, its outcome, or an observed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub wallet_address: Address,
    pub kind: RecordKind,
    /// Absent until the transaction has been broadcast.
    pub tx_hash: Option<TxHash>,
    pub status: RecordStatus,
    pub amount: U256,
    pub block_number: Option<u64>,
    pub gas_used: Option<u64>,
    pub effective_gas_price: Option<u128>,
    pub error_class: Option<ErrorClass>,
    pub timestamp: DateTime<Utc>,
}

impl TransactionRecord {
    pub fn new(wallet_address: Address, kind: RecordKind, status: RecordStatus) -> Self {
        Self {
            wallet_address,
            kind,
            tx_hash: None,
            status,
            amount: U256::ZERO,
            block_number: None,
            gas_used: None,
            effective_gas_price: None,
            error_class: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_hash(mut self, tx_hash: TxHash) -> Self {
        self.tx_hash = Some(tx_hash);
        self
    }

    pub fn with_amount(mut self, amount: U256) -> Self {
        self.amount = amount;
        self
    }

    pub fn with_block(mut self, block_number: Option<u64>) -> Self {
        self.block_number = block_number;
        self
    }

    pub fn with_error(mut self, class: ErrorClass) -> Self {
        self.error_class = Some(class);
        self
    }

    /// Copies hash, block and gas accounting from a mined receipt.
    pub fn with_receipt(mut self, receipt: &TxReceipt) -> Self {
        self.tx_hash = Some(receipt.tx_hash);
        self.block_number = receipt.block_number;
        self.gas_used = Some(receipt.gas_used);
        self.effective_gas_price = Some(receipt.effective_gas_price);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_ordering_is_lifecycle_order() {
        assert!(WalletStatus::Generated < WalletStatus::Funded);
        assert!(WalletStatus::Funded < WalletStatus::Actioned);
        assert!(WalletStatus::Actioned < WalletStatus::Consolidated);
        assert!(WalletStatus::Consolidated < WalletStatus::Refunded);
        assert!(WalletStatus::Funded.advances_to(WalletStatus::Actioned));
        assert!(!WalletStatus::Consolidated.advances_to(WalletStatus::Actioned));
        assert!(!WalletStatus::Funded.advances_to(WalletStatus::Funded));
    }

    #[test]
    fn test_tags_parse_back() {
        for status in WalletStatus::ALL {
            assert_eq!(status.as_str().parse::<WalletStatus>().unwrap(), status);
        }
        for kind in RecordKind::ALL {
            assert_eq!(kind.as_str().parse::<RecordKind>().unwrap(), kind);
        }
        assert!("event_detected".parse::<RecordKind>().is_err());
        assert!("done".parse::<RecordStatus>().is_err());
    }
}
