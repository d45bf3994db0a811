//! Funder: prefunds every generated wallet from the funding account.

use alloy::network::TransactionBuilder;
use alloy::primitives::utils::format_ether;
use alloy::primitives::{Address, U256};
use alloy::rpc::types::TransactionRequest;
use futures::StreamExt;

use super::PhaseContext;
use super::sender::{PriorSend, SendRequest, TxSender};
use crate::error::PipelineError;
use crate::gas::GasQuote;
use crate::report::{PhaseReport, WalletOutcome};
use crate::types::{RecordKind, WalletStatus};

pub const ELIGIBLE: &[WalletStatus] = &[WalletStatus::Generated];

/// Worst-case cost of funding a batch of wallets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FundingPlan {
    pub wallets: usize,
    pub prefund_amount: U256,
    pub gas_cost_per_tx: U256,
    pub safety_margin: U256,
}

impl FundingPlan {
    pub fn new(
        wallets: usize,
        prefund_amount: U256,
        transfer_gas_limit: u64,
        quote: &GasQuote,
        safety_margin: U256,
    ) -> Self {
        Self {
            wallets,
            prefund_amount,
            gas_cost_per_tx: quote.cost(transfer_gas_limit),
            safety_margin,
        }
    }

    /// `N × prefund + N × gas_cost_per_tx + safety_margin`.
    pub fn budget(&self) -> U256 {
        let n = U256::from(self.wallets);
        n * self.prefund_amount + n * self.gas_cost_per_tx + self.safety_margin
    }

    /// Refuses when `balance` is strictly below the budget.
    pub fn check(&self, balance: U256) -> Result<(), PipelineError> {
        let required = self.budget();
        if balance < required {
            return Err(PipelineError::InsufficientBudget {
                required,
                available: balance,
            });
        }
        Ok(())
    }
}

pub async fn run(ctx: &PhaseContext, mut report: PhaseReport) -> Result<PhaseReport, PipelineError> {
    let chain = ctx.chain()?;
    let funder = ctx.funder()?;
    let wallets = ctx.eligible(ELIGIBLE)?;
    if wallets.is_empty() {
        tracing::info!("no generated wallets to fund");
        return Ok(report);
    }

    let quote = ctx.pricer().fetch(chain).await?;
    let plan = FundingPlan::new(
        wallets.len(),
        ctx.config.prefund_amount,
        ctx.config.funding.transfer_gas_limit,
        &quote,
        ctx.config.funding.safety_margin,
    );
    let balance = chain.get_balance(funder).await?;
    tracing::info!(
        %funder,
        wallets = wallets.len(),
        budget = %format_ether(plan.budget()),
        balance = %format_ether(balance),
        "funding budget"
    );
    report.note("Funder", funder);
    report.note("Budget", format!("{} ETH", format_ether(plan.budget())));
    report.note("Funder balance", format!("{} ETH", format_ether(balance)));
    plan.check(balance)?;

    let sender = TxSender::new(ctx)?;
    let sender = &sender;
    let outcomes: Vec<_> = futures::stream::iter(wallets)
        .map(|wallet| async move { fund_wallet(ctx, sender, funder, quote, wallet.address).await })
        .buffer_unordered(ctx.config.concurrency)
        .collect()
        .await;

    let mut funded = 0u64;
    for outcome in outcomes {
        let outcome = outcome?;
        if outcome == WalletOutcome::Success {
            funded += 1;
        }
        report.record(&outcome);
    }
    let total = U256::from(funded) * ctx.config.prefund_amount;
    report.note("Total funded", format!("{} ETH", format_ether(total)));
    Ok(report)
}

#[tracing::instrument(skip_all, fields(%wallet))]
async fn fund_wallet(
    ctx: &PhaseContext,
    sender: &TxSender<'_>,
    funder: Address,
    quote: GasQuote,
    wallet: Address,
) -> Result<WalletOutcome, PipelineError> {
    let chain = ctx.chain()?;
    let prefund = ctx.config.prefund_amount;

    match sender.resolve_pending(wallet, RecordKind::Fund).await? {
        PriorSend::Clear => {}
        PriorSend::Landed(receipt) => {
            tracing::info!(hash = %receipt.tx_hash, "earlier transfer landed");
            ctx.store.advance_status(wallet, WalletStatus::Funded)?;
            return Ok(WalletOutcome::Success);
        }
        PriorSend::Unresolved(_) => return Ok(WalletOutcome::Skipped("previous send pending")),
    }

    // A broadcast from an earlier run may have landed after that run gave up on it.
    match chain.get_balance(wallet).await {
        Ok(balance) if balance >= prefund => {
            tracing::info!(balance = %format_ether(balance), "already funded");
            ctx.store.advance_status(wallet, WalletStatus::Funded)?;
            return Ok(WalletOutcome::Skipped("already funded"));
        }
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(error = %e, "balance lookup failed");
            return Ok(WalletOutcome::Failed(e.class));
        }
    }

    if ctx.options.dry_run {
        tracing::info!(amount = %format_ether(prefund), "dry run, would fund");
        return Ok(WalletOutcome::Skipped("dry run"));
    }

    let request = SendRequest {
        kind: RecordKind::Fund,
        wallet,
        from: funder,
        tx: TransactionRequest::default()
            .with_to(wallet)
            .with_value(prefund)
            .with_gas_limit(ctx.config.funding.transfer_gas_limit),
        amount: prefund,
        quote: Some(quote),
        replace_stuck: false,
    };
    let submission = sender.send(request).await?;
    if submission.outcome.is_confirmed() {
        ctx.store.advance_status(wallet, WalletStatus::Funded)?;
    }
    Ok(submission.outcome.wallet_outcome())
}
