//! walletfleet command-line entrypoint.
//!
//! Runs one pipeline phase per invocation:
//! - `generate` – create keystores up to `wallet_count`
//! - `fund` – prefund generated wallets from the funding account
//! - `action` – simulate and submit the configured call from funded wallets
//! - `watch` – reconcile on-chain events until interrupted
//! - `consolidate` – sweep the configured ERC-20 back to the funder
//! - `refund` – return leftover native balance to the funder
//! - `status` – print wallet and transaction counts
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `RPC_URL`, `FUNDER_PRIVATE_KEY` (or `FUNDER_ADDRESS`), `KEYSTORE_PASSWORD`
//! - `TELEGRAM_BOT_TOKEN`, `TELEGRAM_CHAT_ID` when notifications are enabled
//! - `WALLETFLEET__*` overrides for any configuration field

use alloy::network::EthereumWallet;
use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use fleet_notify::{NoopNotifier, Notifier, TelegramNotifier};
use std::sync::Arc;
use std::time::Duration;

use walletfleet::chain::evm::EvmClient;
use walletfleet::cli::Cli;
use walletfleet::config::PipelineConfig;
use walletfleet::credentials::{CredentialProvider, KeystoreCredentials};
use walletfleet::from_env::{self, FunderAccount, TelegramCredentials};
use walletfleet::phases::{PhaseContext, PhaseId, RunOptions, run_phase};
use walletfleet::sig_down::SigDown;
use walletfleet::store::StatusStore;
use walletfleet::store::memory::MemoryStore;
use walletfleet::store::sqlite::SqliteStore;
use walletfleet::telemetry::Telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let _telemetry = Telemetry::new()
        .with_name(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .register();

    let cli = Cli::parse();
    let phase = cli.phase;
    let config_path = from_env::config_path(cli.config.clone());
    let config = PipelineConfig::load(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;
    config.validate(phase)?;
    tracing::info!(%phase, config = %config_path.display(), "Configuration loaded successfully");

    let ctx = build_context(phase, config, cli.options()).await?;
    run_phase(phase, &ctx).await?;
    Ok(())
}

/// Opens the store and keystore, and connects to the chain when the phase needs it.
async fn build_context(phase: PhaseId, config: PipelineConfig, options: RunOptions) -> Result<PhaseContext> {
    let sqlite = SqliteStore::open(&config.store.path)
        .with_context(|| format!("opening status store {}", config.store.path.display()))?;
    let store: Arc<dyn StatusStore> = if options.dry_run {
        // Dry runs work on a throwaway copy so nothing is persisted.
        Arc::new(MemoryStore::snapshot_of(&sqlite)?)
    } else {
        Arc::new(sqlite)
    };

    let needs_keys = phase == PhaseId::Generate || !phase.signing_statuses().is_empty();
    let password = if needs_keys {
        from_env::keystore_password()?
    } else {
        String::new()
    };
    let credentials = Arc::new(KeystoreCredentials::new(&config.keystore.dir, password));

    let notifier: Arc<dyn Notifier> = if config.notifier.enabled {
        let telegram = TelegramCredentials::from_env()?;
        Arc::new(TelegramNotifier::new(
            telegram.bot_token,
            telegram.chat_id,
            Duration::from_secs(config.notifier.timeout_secs),
            config.notifier.max_retries + 1,
        )?)
    } else {
        Arc::new(NoopNotifier)
    };

    let sig_down = SigDown::try_new()?;
    let ctx = PhaseContext::new(config, store, credentials.clone())
        .with_notifier(notifier)
        .with_options(options)
        .with_shutdown(sig_down.cancellation_token());
    if !phase.needs_chain() {
        return Ok(ctx);
    }

    let mut wallet = EthereumWallet::default();
    let mut funder_address = None;
    if phase.needs_funder() {
        let funder = FunderAccount::from_env()?;
        if let Some(signer) = funder.signer() {
            wallet.register_signer(signer.clone());
        }
        funder_address = Some(funder.address());
    }

    let signing = ctx.eligible(phase.signing_statuses())?;
    if !signing.is_empty() {
        tracing::info!(wallets = signing.len(), "Unlocking wallet keystores");
    }
    for managed in &signing {
        wallet.register_signer(credentials.signer(managed.address)?);
    }

    let rpc_url = from_env::rpc_url()?;
    let client = EvmClient::connect(&rpc_url, wallet, ctx.config.eip1559, &ctx.config.rpc).await?;
    let ctx = ctx.with_chain(Arc::new(client));
    Ok(match funder_address {
        Some(funder) => ctx.with_funder(funder),
        None => ctx,
    })
}
