//! Classification of RPC and transaction failures.
//!
//! Node and provider error strings are not standardized, so classification is done on the
//! lowercased message text. The class, not the concrete error type, decides retry policy.

use alloy::primitives::TxHash;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Failure taxonomy driving retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Rate limited by the RPC provider.
    Throttle,
    /// Fee too low for current network conditions.
    Underpriced,
    /// The sequence number (nonce) was already consumed.
    StaleSequence,
    /// On-chain logic rejected the call.
    Reverted,
    /// Sender balance cannot cover value plus gas.
    InsufficientFunds,
    /// A broadcast superseded by a same-nonce replacement.
    Replaced,
    Unknown,
}

impl ErrorClass {
    pub const ALL: [ErrorClass; 7] = [
        ErrorClass::Throttle,
        ErrorClass::Underpriced,
        ErrorClass::StaleSequence,
        ErrorClass::Reverted,
        ErrorClass::InsufficientFunds,
        ErrorClass::Replaced,
        ErrorClass::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Throttle => "throttle",
            ErrorClass::Underpriced => "underpriced",
            ErrorClass::StaleSequence => "stale-sequence",
            ErrorClass::Reverted => "reverted",
            ErrorClass::InsufficientFunds => "insufficient-funds",
            ErrorClass::Replaced => "replaced",
            ErrorClass::Unknown => "unknown",
        }
    }

    /// Terminal classes are never retried.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ErrorClass::Reverted | ErrorClass::InsufficientFunds | ErrorClass::Replaced
        )
    }

    /// Classify a raw node/provider error message.
    pub fn from_message(message: &str) -> Self {
        let msg = message.to_lowercase();

        if msg.contains("429")
            || msg.contains("rate limit")
            || msg.contains("too many requests")
            || msg.contains("exceeded its compute units")
            || msg.contains("request limit")
        {
            ErrorClass::Throttle
        } else if msg.contains("underpriced")
            || msg.contains("fee too low")
            || msg.contains("max fee per gas less than block base fee")
            || msg.contains("feecap")
            || msg.contains("gas price too low")
        {
            ErrorClass::Underpriced
        } else if msg.contains("nonce too low")
            || msg.contains("nonce has already been used")
            || msg.contains("invalid nonce")
        {
            ErrorClass::StaleSequence
        } else if msg.contains("insufficient funds") || msg.contains("insufficient balance") {
            ErrorClass::InsufficientFunds
        } else if msg.contains("revert") {
            ErrorClass::Reverted
        } else {
            ErrorClass::Unknown
        }
    }
}

/// The node already holds this exact signed transaction in its mempool.
pub fn is_already_known(message: &str) -> bool {
    let msg = message.to_lowercase();
    msg.contains("already known") || msg.contains("known transaction")
}

impl Display for ErrorClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorClass::ALL
            .into_iter()
            .find(|class| class.as_str() == s)
            .ok_or_else(|| format!("unknown error class '{s}'"))
    }
}

/// A failed chain interaction together with its classification.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{class}: {message}")]
pub struct ChainError {
    pub class: ErrorClass,
    pub message: String,
    /// Hash of the signed transaction when the failure came from broadcasting it.
    pub tx_hash: Option<TxHash>,
}

impl ChainError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            tx_hash: None,
        }
    }

    pub fn with_tx_hash(mut self, tx_hash: TxHash) -> Self {
        self.tx_hash = Some(tx_hash);
        self
    }

    /// Wrap a transport/RPC error, classifying it by message.
    pub fn classify(e: impl Display, context: &str) -> Self {
        let message = format!("{context}: {e}");
        let class = ErrorClass::from_message(&message);
        match class {
            ErrorClass::Unknown => tracing::warn!(%message, "unclassified chain error"),
            _ => tracing::debug!(%class, %message, "classified chain error"),
        }
        Self {
            class,
            message,
            tx_hash: None,
        }
    }
}
