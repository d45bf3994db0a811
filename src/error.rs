use alloy::primitives::U256;
use alloy::primitives::utils::format_ether;

use crate::calldata::CalldataError;
use crate::chain::ChainError;
use crate::config::ConfigError;
use crate::credentials::CredentialError;
use crate::from_env::EnvError;
use crate::store::StoreError;

/// Errors that abort a phase as a whole. Per-wallet failures never surface here.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Calldata(#[from] CalldataError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Env(#[from] EnvError),
    #[error(
        "insufficient funder balance: required {} ETH, available {} ETH",
        format_ether(*required),
        format_ether(*available)
    )]
    InsufficientBudget { required: U256, available: U256 },
    #[error("{0} is required for this phase")]
    Missing(&'static str),
    #[error("event filter error: {0}")]
    EventFilter(String),
}
