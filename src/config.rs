//! Pipeline configuration.
//!
//! Settings come from an optional TOML file merged with `WALLETFLEET__SECTION__FIELD`
//! environment overrides. Every section has explicit defaults, so an empty file (or no file)
//! yields a usable configuration for the read-only phases. Secrets are never read from here;
//! see [`crate::from_env`].
//!
//! Native amounts are written in ether and fees in gwei, either as strings (`"0.01"`) or as
//! TOML numbers.

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::phases::PhaseId;
use crate::retry::RetryPolicy;

/// Config file used when neither `--config` nor `WALLETFLEET_CONFIG` is given.
pub const DEFAULT_CONFIG_FILE: &str = "walletfleet.toml";
pub const ENV_PREFIX: &str = "WALLETFLEET";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Target size of the managed wallet set.
    pub wallet_count: u32,
    /// Native amount sent to each wallet by the funder.
    #[serde(with = "ether_serde")]
    pub prefund_amount: U256,
    /// Contract called by the action phase.
    pub target_contract: Option<Address>,
    /// Solidity signature, e.g. `mint(address,uint256)`.
    pub action_function: String,
    /// Arguments coerced to the signature's parameter types. `{wallet}` is the acting wallet.
    pub action_args: Vec<String>,
    /// Native value attached to each action call.
    #[serde(with = "ether_serde")]
    pub action_value: U256,
    /// Maximum fee per gas ever offered, in wei (configured in gwei).
    #[serde(rename = "gas_ceiling_gwei", with = "gwei_serde")]
    pub gas_ceiling: Option<u128>,
    /// Fixed priority fee, in wei (configured in gwei).
    #[serde(rename = "priority_fee_gwei", with = "gwei_serde")]
    pub priority_fee: Option<u128>,
    pub eip1559: bool,
    pub confirmations: u64,
    /// Width of the per-phase worker pool.
    pub concurrency: usize,
    pub retry_policy: RetryPolicy,
    pub gas_bump: GasBumpConfig,
    pub funding: FundingConfig,
    pub refund: RefundConfig,
    pub consolidation: ConsolidationConfig,
    pub event_filter: EventFilterConfig,
    pub rpc: RpcConfig,
    pub store: StoreConfig,
    pub keystore: KeystoreConfig,
    pub notifier: NotifierConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            wallet_count: 10,
            prefund_amount: U256::from(10_000_000_000_000_000u64), // 0.01 ether
            target_contract: None,
            action_function: "mint()".to_string(),
            action_args: Vec::new(),
            action_value: U256::ZERO,
            gas_ceiling: None,
            priority_fee: None,
            eip1559: true,
            confirmations: 1,
            concurrency: 10,
            retry_policy: RetryPolicy::default(),
            gas_bump: GasBumpConfig::default(),
            funding: FundingConfig::default(),
            refund: RefundConfig::default(),
            consolidation: ConsolidationConfig::default(),
            event_filter: EventFilterConfig::default(),
            rpc: RpcConfig::default(),
            store: StoreConfig::default(),
            keystore: KeystoreConfig::default(),
            notifier: NotifierConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Loads `path` (defaults if it does not exist) and applies environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut builder = config::Config::builder();
        if path.exists() {
            builder = builder.add_source(config::File::from(path));
        } else {
            tracing::info!("Config file not found at {:?}, using defaults", path);
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("action_args"),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Checks the settings `phase` depends on. Runs before anything is dispatched.
    pub fn validate(&self, phase: PhaseId) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be greater than zero".into()));
        }
        match phase {
            PhaseId::Fund if self.prefund_amount.is_zero() => {
                return Err(ConfigError::Invalid("prefund_amount must be greater than zero".into()));
            }
            PhaseId::Action => {
                if self.target_contract.is_none() {
                    return Err(ConfigError::Invalid("action requires target_contract".into()));
                }
                if self.gas_bump.bump_percent < 10 {
                    return Err(ConfigError::Invalid(format!(
                        "gas_bump.bump_percent must be at least 10 (got {})",
                        self.gas_bump.bump_percent
                    )));
                }
            }
            PhaseId::Watch => {
                if self.event_filter.address.or(self.target_contract).is_none() {
                    return Err(ConfigError::Invalid(
                        "watch requires event_filter.address or target_contract".into(),
                    ));
                }
                if self.event_filter.scan_batch_blocks == 0 {
                    return Err(ConfigError::Invalid(
                        "event_filter.scan_batch_blocks must be greater than zero".into(),
                    ));
                }
            }
            PhaseId::Consolidate if self.consolidation.token.is_none() => {
                return Err(ConfigError::Invalid("consolidate requires consolidation.token".into()));
            }
            _ => {}
        }
        Ok(())
    }
}

/// Stuck-transaction replacement.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GasBumpConfig {
    /// How long a broadcast may stay unconfirmed before it is replaced.
    pub wait_secs: u64,
    /// Fee increase per replacement. Nodes reject replacements below 10%.
    pub bump_percent: u32,
    pub max_bumps: u32,
}

impl Default for GasBumpConfig {
    fn default() -> Self {
        Self {
            wait_secs: 60,
            bump_percent: 20,
            max_bumps: 3,
        }
    }
}

impl GasBumpConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FundingConfig {
    /// Gas limit of a plain native transfer.
    pub transfer_gas_limit: u64,
    #[serde(with = "ether_serde")]
    pub safety_margin: U256,
}

impl Default for FundingConfig {
    fn default() -> Self {
        Self {
            transfer_gas_limit: 21_000,
            safety_margin: U256::from(1_000_000_000_000_000u64), // 0.001 ether
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RefundConfig {
    /// Native balance deliberately left behind in each wallet.
    #[serde(with = "ether_serde")]
    pub dust_floor: U256,
    #[serde(with = "ether_serde")]
    pub safety_buffer: U256,
}

impl Default for RefundConfig {
    fn default() -> Self {
        Self {
            dust_floor: U256::from(100_000_000_000_000u64),   // 0.0001 ether
            safety_buffer: U256::from(50_000_000_000_000u64), // 0.00005 ether
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// ERC-20 token swept back to the funding account.
    pub token: Option<Address>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EventFilterConfig {
    /// Emitting contract. Falls back to `target_contract`.
    pub address: Option<Address>,
    /// Human-readable event signature, with `indexed` markers.
    pub event_signature: String,
    /// Furthest the startup scan reaches behind the head, cursor or not.
    pub lookback_blocks: u64,
    /// Blocks per `eth_getLogs` request.
    pub scan_batch_blocks: u64,
    /// Delay between head polls once caught up.
    pub poll_interval_ms: u64,
    /// Preferred name of the recipient parameter.
    pub recipient_field: String,
    /// Topic holding the recipient when the signature does not match the log.
    pub recipient_topic_index: usize,
    /// Capacity of the recently-seen event set.
    pub dedup_capacity: usize,
}

impl Default for EventFilterConfig {
    fn default() -> Self {
        Self {
            address: None,
            event_signature: "event Transfer(address indexed from, address indexed to, uint256 value)"
                .to_string(),
            lookback_blocks: 5_000,
            scan_batch_blocks: 100,
            poll_interval_ms: 2_000,
            recipient_field: "to".to_string(),
            recipient_topic_index: 2,
            dedup_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RpcConfig {
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Upper bound on a single confirmation wait.
    pub receipt_timeout_secs: u64,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout_secs: u64,
    /// Allow `eth_sendTransaction` for accounts unlocked on the node (dev chains).
    pub allow_node_accounts: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
            receipt_timeout_secs: 120,
            pool_max_idle_per_host: 100,
            pool_idle_timeout_secs: 90,
            allow_node_accounts: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("walletfleet.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KeystoreConfig {
    pub dir: PathBuf,
}

impl Default for KeystoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("keystore"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Requires `TELEGRAM_BOT_TOKEN` and `TELEGRAM_CHAT_ID` when enabled.
    pub enabled: bool,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_secs: 10,
            max_retries: 3,
        }
    }
}

/// Amount written as a string or a number.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawAmount {
    Text(String),
    Integer(u64),
    Float(f64),
}

impl RawAmount {
    fn into_text(self) -> String {
        match self {
            RawAmount::Text(s) => s.trim().to_string(),
            RawAmount::Integer(i) => i.to_string(),
            RawAmount::Float(f) => f.to_string(),
        }
    }
}

/// Native amounts in ether, stored as wei.
mod ether_serde {
    use super::RawAmount;
    use alloy::primitives::U256;
    use alloy::primitives::utils::{format_ether, parse_ether};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &U256, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_ether(*value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<U256, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = RawAmount::deserialize(deserializer)?.into_text();
        parse_ether(&text).map_err(serde::de::Error::custom)
    }
}

/// Optional fee values in gwei, stored as wei.
mod gwei_serde {
    use super::RawAmount;
    use alloy::primitives::U256;
    use alloy::primitives::utils::{format_units, parse_units};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<u128>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(wei) => {
                let gwei = format_units(U256::from(*wei), "gwei").map_err(serde::ser::Error::custom)?;
                serializer.serialize_some(&gwei)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<u128>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let Some(raw) = Option::<RawAmount>::deserialize(deserializer)? else {
            return Ok(None);
        };
        let wei: U256 = parse_units(&raw.into_text(), "gwei")
            .map_err(serde::de::Error::custom)?
            .into();
        u128::try_from(wei)
            .map(Some)
            .map_err(|_| serde::de::Error::custom("gas value out of range"))
    }
}
