//! Pipeline phases and their shared execution context.

pub mod action;
pub mod consolidate;
pub mod fund;
pub mod generate;
pub mod refund;
pub mod sender;
pub mod status;
pub mod watch;

use alloy::primitives::Address;
use fleet_notify::{NoopNotifier, Notifier};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::chain::ChainClient;
use crate::config::PipelineConfig;
use crate::credentials::CredentialProvider;
use crate::error::PipelineError;
use crate::gas::GasPricer;
use crate::nonce::SequenceCounter;
use crate::report::PhaseReport;
use crate::store::StatusStore;
use crate::types::{ManagedWallet, WalletStatus};

#[derive(clap::Subcommand, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseId {
    /// Create keystores until the wallet set reaches `wallet_count`
    Generate,
    /// Send the prefund amount from the funder to every generated wallet
    Fund,
    /// Simulate and submit the configured contract call from every funded wallet
    Action,
    /// Follow contract events and mark wallets whose action landed on-chain
    Watch,
    /// Sweep the configured ERC-20 balance back to the funder
    Consolidate,
    /// Return leftover native balance to the funder
    Refund,
    /// Print wallet and transaction counts
    Status,
}

impl PhaseId {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseId::Generate => "generate",
            PhaseId::Fund => "fund",
            PhaseId::Action => "action",
            PhaseId::Watch => "watch",
            PhaseId::Consolidate => "consolidate",
            PhaseId::Refund => "refund",
            PhaseId::Status => "status",
        }
    }

    /// Whether the phase talks to the chain at all.
    pub fn needs_chain(&self) -> bool {
        !matches!(self, PhaseId::Generate | PhaseId::Status)
    }

    /// Whether the phase sends transactions to the funding account or from it.
    pub fn needs_funder(&self) -> bool {
        matches!(self, PhaseId::Fund | PhaseId::Consolidate | PhaseId::Refund)
    }

    /// Wallet statuses the phase acts on. Their keys must be loaded before connecting.
    pub fn signing_statuses(&self) -> &'static [WalletStatus] {
        match self {
            PhaseId::Action => action::ELIGIBLE,
            PhaseId::Consolidate => consolidate::ELIGIBLE,
            PhaseId::Refund => refund::ELIGIBLE,
            PhaseId::Generate | PhaseId::Fund | PhaseId::Watch | PhaseId::Status => &[],
        }
    }
}

impl std::fmt::Display for PhaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Compute and log everything, send nothing.
    pub dry_run: bool,
    /// Process at most this many wallets.
    pub max_wallets: Option<usize>,
}

/// Everything a phase needs, built once by the binary.
pub struct PhaseContext {
    pub config: PipelineConfig,
    pub store: Arc<dyn StatusStore>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub notifier: Arc<dyn Notifier>,
    pub options: RunOptions,
    pub sequences: SequenceCounter,
    pub shutdown: CancellationToken,
    chain: Option<Arc<dyn ChainClient>>,
    funder: Option<Address>,
}

impl PhaseContext {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn StatusStore>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            config,
            store,
            credentials,
            notifier: Arc::new(NoopNotifier),
            options: RunOptions::default(),
            sequences: SequenceCounter::default(),
            shutdown: CancellationToken::new(),
            chain: None,
            funder: None,
        }
    }

    pub fn with_chain(mut self, chain: Arc<dyn ChainClient>) -> Self {
        self.chain = Some(chain);
        self
    }

    pub fn with_funder(mut self, funder: Address) -> Self {
        self.funder = Some(funder);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn chain(&self) -> Result<&dyn ChainClient, PipelineError> {
        self.chain.as_deref().ok_or(PipelineError::Missing("RPC connection"))
    }

    pub fn funder(&self) -> Result<Address, PipelineError> {
        self.funder.ok_or(PipelineError::Missing("funding account"))
    }

    pub fn pricer(&self) -> GasPricer {
        GasPricer {
            ceiling: self.config.gas_ceiling,
            priority_fee: self.config.priority_fee,
            eip1559: self.config.eip1559,
        }
    }

    /// Wallets in `statuses`, oldest first, truncated to `--max-wallets`.
    pub fn eligible(&self, statuses: &[WalletStatus]) -> Result<Vec<ManagedWallet>, PipelineError> {
        let mut wallets = self.store.wallets_in(statuses)?;
        if let Some(limit) = self.options.max_wallets {
            wallets.truncate(limit);
        }
        Ok(wallets)
    }

    fn report(&self, phase: PhaseId) -> PhaseReport {
        let mut report = PhaseReport::new(phase.as_str());
        report.dry_run = self.options.dry_run;
        report
    }
}

/// Runs `phase`, prints its summary and sends one completion notification.
///
/// `status` prints its own table and returns `None`.
pub async fn run_phase(phase: PhaseId, ctx: &PhaseContext) -> Result<Option<PhaseReport>, PipelineError> {
    tracing::info!(%phase, dry_run = ctx.options.dry_run, "starting phase");
    let result = match phase {
        PhaseId::Generate => generate::run(ctx, ctx.report(phase)).await,
        PhaseId::Fund => fund::run(ctx, ctx.report(phase)).await,
        PhaseId::Action => action::run(ctx, ctx.report(phase)).await,
        PhaseId::Watch => watch::run(ctx, ctx.report(phase)).await,
        PhaseId::Consolidate => consolidate::run(ctx, ctx.report(phase)).await,
        PhaseId::Refund => refund::run(ctx, ctx.report(phase)).await,
        PhaseId::Status => {
            status::run(ctx)?;
            return Ok(None);
        }
    };

    match result {
        Ok(report) => {
            report.print();
            ctx.notifier.send(&report.to_message()).await;
            Ok(Some(report))
        }
        Err(e) => {
            tracing::error!(%phase, error = %e, "phase aborted");
            ctx.notifier
                .send(&format!("walletfleet {phase} aborted: {e}"))
                .await;
            Err(e)
        }
    }
}
