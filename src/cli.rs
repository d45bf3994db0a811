use clap::Parser;
use std::path::PathBuf;

use crate::phases::{PhaseId, RunOptions};

/// Multi-wallet EVM batch pipeline
#[derive(Parser, Debug, Clone)]
#[command(name = "walletfleet", version)]
#[command(about = "Generate, fund, act from, reconcile and drain a fleet of EVM wallets")]
pub struct Cli {
    /// Configuration file (TOML). Defaults to $WALLETFLEET_CONFIG, then walletfleet.toml
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Compute and log everything, send no transactions and persist nothing
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Process at most N wallets
    #[arg(long, global = true, value_name = "N")]
    pub max_wallets: Option<usize>,

    #[command(subcommand)]
    pub phase: PhaseId,
}

impl Cli {
    pub fn options(&self) -> RunOptions {
        RunOptions {
            dry_run: self.dry_run,
            max_wallets: self.max_wallets,
        }
    }
}
