//! Secrets and endpoints read from the process environment.
//!
//! Nothing secret is ever read from the config file. `.env` is loaded by `main` through
//! `dotenvy` before anything here runs.

use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::config::DEFAULT_CONFIG_FILE;

pub const ENV_RPC_URL: &str = "RPC_URL";
pub const ENV_FUNDER_PRIVATE_KEY: &str = "FUNDER_PRIVATE_KEY";
/// Used instead of a private key when the node signs for the funder (dev chains).
pub const ENV_FUNDER_ADDRESS: &str = "FUNDER_ADDRESS";
pub const ENV_KEYSTORE_PASSWORD: &str = "KEYSTORE_PASSWORD";
pub const ENV_TELEGRAM_BOT_TOKEN: &str = "TELEGRAM_BOT_TOKEN";
pub const ENV_TELEGRAM_CHAT_ID: &str = "TELEGRAM_CHAT_ID";
pub const ENV_CONFIG_FILE: &str = "WALLETFLEET_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    #[error("environment variable {0} is not set")]
    Missing(&'static str),
    #[error("environment variable {name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

fn required(name: &'static str) -> Result<String, EnvError> {
    env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(EnvError::Missing(name))
}

pub fn rpc_url() -> Result<String, EnvError> {
    required(ENV_RPC_URL)
}

pub fn keystore_password() -> Result<String, EnvError> {
    required(ENV_KEYSTORE_PASSWORD)
}

/// `--config` if given, else `WALLETFLEET_CONFIG`, else `walletfleet.toml`.
pub fn config_path(cli: Option<PathBuf>) -> PathBuf {
    cli.or_else(|| env::var(ENV_CONFIG_FILE).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// The account that funds managed wallets and receives sweeps.
#[derive(Debug, Clone)]
pub enum FunderAccount {
    /// Signs locally with a private key.
    Local(PrivateKeySigner),
    /// Address only; signing is left to the node.
    NodeManaged(Address),
}

impl FunderAccount {
    pub fn from_env() -> Result<Self, EnvError> {
        if let Ok(key) = required(ENV_FUNDER_PRIVATE_KEY) {
            let signer = PrivateKeySigner::from_str(key.trim()).map_err(|e| EnvError::Invalid {
                name: ENV_FUNDER_PRIVATE_KEY,
                reason: e.to_string(),
            })?;
            return Ok(FunderAccount::Local(signer));
        }
        match required(ENV_FUNDER_ADDRESS) {
            Ok(address) => {
                let address = Address::from_str(address.trim()).map_err(|e| EnvError::Invalid {
                    name: ENV_FUNDER_ADDRESS,
                    reason: e.to_string(),
                })?;
                Ok(FunderAccount::NodeManaged(address))
            }
            Err(_) => Err(EnvError::Missing(ENV_FUNDER_PRIVATE_KEY)),
        }
    }

    pub fn address(&self) -> Address {
        match self {
            FunderAccount::Local(signer) => signer.address(),
            FunderAccount::NodeManaged(address) => *address,
        }
    }

    pub fn signer(&self) -> Option<&PrivateKeySigner> {
        match self {
            FunderAccount::Local(signer) => Some(signer),
            FunderAccount::NodeManaged(_) => None,
        }
    }
}

/// Bot token and chat id for the Telegram notifier.
#[derive(Clone)]
pub struct TelegramCredentials {
    pub bot_token: String,
    pub chat_id: String,
}

impl TelegramCredentials {
    pub fn from_env() -> Result<Self, EnvError> {
        Ok(Self {
            bot_token: required(ENV_TELEGRAM_BOT_TOKEN)?,
            chat_id: required(ENV_TELEGRAM_CHAT_ID)?,
        })
    }
}

impl std::fmt::Debug for TelegramCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramCredentials")
            .field("bot_token", &"<redacted>")
            .field("chat_id", &self.chat_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_config_path_wins() {
        let path = config_path(Some(PathBuf::from("custom.toml")));
        assert_eq!(path, PathBuf::from("custom.toml"));
    }

    #[test]
    fn test_credentials_debug_hides_token() {
        let creds = TelegramCredentials {
            bot_token: "123:secret".into(),
            chat_id: "42".into(),
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("42"));
    }

    #[test]
    fn test_funder_variants_expose_address() {
        let signer = PrivateKeySigner::random();
        let local = FunderAccount::Local(signer.clone());
        assert_eq!(local.address(), signer.address());
        assert!(local.signer().is_some());

        let node = FunderAccount::NodeManaged(Address::repeat_byte(7));
        assert_eq!(node.address(), Address::repeat_byte(7));
        assert!(node.signer().is_none());
    }
}
