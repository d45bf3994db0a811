//! Consolidator: sweeps the configured ERC-20 balance of each actioned wallet to the funder.

use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, U256};
use alloy::rpc::types::TransactionRequest;
use futures::StreamExt;

use super::PhaseContext;
use super::sender::{PriorSend, SendRequest, TxSender};
use crate::chain::{erc20_balance, erc20_transfer_calldata};
use crate::error::PipelineError;
use crate::report::{PhaseReport, WalletOutcome};
use crate::types::{RecordKind, RecordStatus, TransactionRecord, WalletStatus};

pub const ELIGIBLE: &[WalletStatus] = &[WalletStatus::Actioned];

const GAS_HEADROOM_PERCENT: u64 = 20;

pub async fn run(ctx: &PhaseContext, mut report: PhaseReport) -> Result<PhaseReport, PipelineError> {
    let funder = ctx.funder()?;
    let token = ctx
        .config
        .consolidation
        .token
        .ok_or(PipelineError::Missing("consolidation.token"))?;
    report.note("Token", token);

    let wallets = ctx.eligible(ELIGIBLE)?;
    if wallets.is_empty() {
        tracing::info!("no actioned wallets to consolidate");
        return Ok(report);
    }

    let sender = TxSender::new(ctx)?;
    let sender = &sender;
    let outcomes: Vec<_> = futures::stream::iter(wallets)
        .map(|wallet| async move { sweep(ctx, sender, token, funder, wallet.address).await })
        .buffer_unordered(ctx.config.concurrency)
        .collect()
        .await;

    let mut swept = U256::ZERO;
    for outcome in outcomes {
        let (outcome, amount) = outcome?;
        swept += amount;
        report.record(&outcome);
    }
    report.note("Total swept (token units)", swept);
    Ok(report)
}

/// Returns the outcome and the amount actually swept.
#[tracing::instrument(skip_all, fields(%wallet))]
async fn sweep(
    ctx: &PhaseContext,
    sender: &TxSender<'_>,
    token: Address,
    funder: Address,
    wallet: Address,
) -> Result<(WalletOutcome, U256), PipelineError> {
    let chain = ctx.chain()?;
    match sender.resolve_pending(wallet, RecordKind::Consolidate).await? {
        PriorSend::Clear => {}
        PriorSend::Landed(receipt) => {
            tracing::info!(hash = %receipt.tx_hash, "earlier sweep landed");
            ctx.store.advance_status(wallet, WalletStatus::Consolidated)?;
            return Ok((WalletOutcome::Success, U256::ZERO));
        }
        PriorSend::Unresolved(_) => {
            return Ok((WalletOutcome::Skipped("previous send pending"), U256::ZERO));
        }
    }

    let balance = match erc20_balance(chain, token, wallet).await {
        Ok(balance) => balance,
        Err(e) => {
            tracing::warn!(error = %e, "token balance lookup failed");
            return Ok((WalletOutcome::Failed(e.class), U256::ZERO));
        }
    };
    if balance.is_zero() {
        tracing::info!("zero token balance, skipping");
        return Ok((WalletOutcome::Skipped("zero token balance"), U256::ZERO));
    }
    if ctx.options.dry_run {
        tracing::info!(%balance, "dry run, would sweep");
        return Ok((WalletOutcome::Skipped("dry run"), U256::ZERO));
    }

    let tx = TransactionRequest::default()
        .with_from(wallet)
        .with_to(token)
        .with_input(erc20_transfer_calldata(funder, balance));
    let gas_limit = match chain.estimate_gas(&tx).await {
        Ok(estimate) => estimate + estimate * GAS_HEADROOM_PERCENT / 100,
        Err(e) => {
            tracing::warn!(class = %e.class, error = %e, "gas estimation failed");
            ctx.store.append_transaction(
                &TransactionRecord::new(wallet, RecordKind::Consolidate, RecordStatus::Failed)
                    .with_amount(balance)
                    .with_error(e.class),
            )?;
            return Ok((WalletOutcome::Failed(e.class), U256::ZERO));
        }
    };

    let submission = sender
        .send(SendRequest {
            kind: RecordKind::Consolidate,
            wallet,
            from: wallet,
            tx: tx.with_gas_limit(gas_limit),
            amount: balance,
            quote: None,
            replace_stuck: false,
        })
        .await?;
    if !submission.outcome.is_confirmed() {
        return Ok((submission.outcome.wallet_outcome(), U256::ZERO));
    }
    ctx.store.advance_status(wallet, WalletStatus::Consolidated)?;
    tracing::info!(%balance, "swept");
    Ok((WalletOutcome::Success, balance))
}
