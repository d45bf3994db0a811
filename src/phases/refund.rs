//! Refunder: returns leftover native balance to the funding account.

use alloy::network::TransactionBuilder;
use alloy::primitives::utils::format_ether;
use alloy::primitives::{Address, U256};
use alloy::rpc::types::TransactionRequest;
use futures::StreamExt;

use super::PhaseContext;
use super::sender::{PriorSend, SendRequest, TxSender};
use crate::error::PipelineError;
use crate::report::{PhaseReport, WalletOutcome};
use crate::types::{RecordKind, WalletStatus};

pub const ELIGIBLE: &[WalletStatus] = &[
    WalletStatus::Funded,
    WalletStatus::Actioned,
    WalletStatus::Consolidated,
];

/// Amounts held back from each refund.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefundPlan {
    /// Worst-case fee of the refund transfer itself.
    pub gas_reserve: U256,
    pub dust_floor: U256,
    pub safety_buffer: U256,
}

impl RefundPlan {
    /// Amount to send back, or `None` when nothing worthwhile is left.
    pub fn amount(&self, balance: U256) -> Option<U256> {
        if balance <= self.gas_reserve + self.dust_floor {
            return None;
        }
        balance
            .checked_sub(self.gas_reserve + self.dust_floor + self.safety_buffer)
            .filter(|refund| !refund.is_zero())
    }
}

pub async fn run(ctx: &PhaseContext, mut report: PhaseReport) -> Result<PhaseReport, PipelineError> {
    let funder = ctx.funder()?;
    let wallets = ctx.eligible(ELIGIBLE)?;
    if wallets.is_empty() {
        tracing::info!("no wallets to refund");
        return Ok(report);
    }

    let sender = TxSender::new(ctx)?;
    let sender = &sender;
    let outcomes: Vec<_> = futures::stream::iter(wallets)
        .map(|wallet| async move { refund(ctx, sender, funder, wallet.address).await })
        .buffer_unordered(ctx.config.concurrency)
        .collect()
        .await;

    let mut refunded = U256::ZERO;
    for outcome in outcomes {
        let (outcome, amount) = outcome?;
        refunded += amount;
        report.record(&outcome);
    }
    report.note("Total refunded", format!("{} ETH", format_ether(refunded)));
    Ok(report)
}

#[tracing::instrument(skip_all, fields(%wallet))]
async fn refund(
    ctx: &PhaseContext,
    sender: &TxSender<'_>,
    funder: Address,
    wallet: Address,
) -> Result<(WalletOutcome, U256), PipelineError> {
    let chain = ctx.chain()?;
    match sender.resolve_pending(wallet, RecordKind::Refund).await? {
        PriorSend::Clear => {}
        PriorSend::Landed(receipt) => {
            tracing::info!(hash = %receipt.tx_hash, "earlier refund landed");
            ctx.store.advance_status(wallet, WalletStatus::Refunded)?;
            return Ok((WalletOutcome::Success, U256::ZERO));
        }
        PriorSend::Unresolved(_) => {
            return Ok((WalletOutcome::Skipped("previous send pending"), U256::ZERO));
        }
    }

    let (balance, quote) = match (chain.get_balance(wallet).await, ctx.pricer().fetch(chain).await) {
        (Ok(balance), Ok(quote)) => (balance, quote),
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!(error = %e, "could not read balance or fees");
            return Ok((WalletOutcome::Failed(e.class), U256::ZERO));
        }
    };

    let gas_limit = ctx.config.funding.transfer_gas_limit;
    let plan = RefundPlan {
        gas_reserve: quote.cost(gas_limit),
        dust_floor: ctx.config.refund.dust_floor,
        safety_buffer: ctx.config.refund.safety_buffer,
    };
    let Some(amount) = plan.amount(balance) else {
        tracing::info!(balance = %format_ether(balance), "balance within reserve, skipping");
        return Ok((WalletOutcome::Skipped("balance within reserve"), U256::ZERO));
    };
    if ctx.options.dry_run {
        tracing::info!(amount = %format_ether(amount), "dry run, would refund");
        return Ok((WalletOutcome::Skipped("dry run"), U256::ZERO));
    }

    let submission = sender
        .send(SendRequest {
            kind: RecordKind::Refund,
            wallet,
            from: wallet,
            tx: TransactionRequest::default()
                .with_to(funder)
                .with_value(amount)
                .with_gas_limit(gas_limit),
            amount,
            quote: Some(quote),
            replace_stuck: false,
        })
        .await?;
    if !submission.outcome.is_confirmed() {
        return Ok((submission.outcome.wallet_outcome(), U256::ZERO));
    }
    ctx.store.advance_status(wallet, WalletStatus::Refunded)?;
    tracing::info!(amount = %format_ether(amount), "refunded");
    Ok((WalletOutcome::Success, amount))
}
