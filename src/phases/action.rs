//! Action worker: simulates, then submits the configured contract call from each funded wallet.

use alloy::network::TransactionBuilder;
use alloy::primitives::Address;
use alloy::primitives::utils::format_ether;
use alloy::rpc::types::TransactionRequest;
use futures::StreamExt;

use super::PhaseContext;
use super::sender::{PriorSend, SendEvent, SendObserver, SendOutcome, SendRequest, TxSender};
use crate::calldata::ActionCall;
use crate::chain::{ChainClient, ChainError, ErrorClass};
use crate::error::PipelineError;
use crate::report::{PhaseReport, WalletOutcome};
use crate::retry::RetryDecision;
use crate::types::{RecordKind, RecordStatus, TransactionRecord, WalletStatus};

pub const ELIGIBLE: &[WalletStatus] = &[WalletStatus::Funded];

/// Added on top of the node's gas estimate.
const GAS_HEADROOM_PERCENT: u64 = 20;

/// Lifecycle of one wallet's action attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Pending,
    Simulating,
    SimulationFailed,
    Submitted,
    /// Every broadcast was rejected, or the sequence was spent elsewhere.
    SubmissionFailed,
    ConfirmedSuccess,
    ConfirmedFailed,
    Replaced,
}

impl AttemptState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptState::Pending => "pending",
            AttemptState::Simulating => "simulating",
            AttemptState::SimulationFailed => "simulation-failed",
            AttemptState::Submitted => "submitted",
            AttemptState::SubmissionFailed => "submission-failed",
            AttemptState::ConfirmedSuccess => "confirmed-success",
            AttemptState::ConfirmedFailed => "confirmed-failed",
            AttemptState::Replaced => "replaced",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptState::SimulationFailed
                | AttemptState::SubmissionFailed
                | AttemptState::ConfirmedSuccess
                | AttemptState::ConfirmedFailed
        )
    }

    pub fn can_transition_to(&self, next: AttemptState) -> bool {
        use AttemptState::*;
        matches!(
            (self, next),
            (Pending, Simulating)
                | (Simulating, SimulationFailed)
                | (Simulating, Submitted)
                | (Simulating, SubmissionFailed)
                | (Submitted, SubmissionFailed)
                | (Submitted, ConfirmedSuccess)
                | (Submitted, ConfirmedFailed)
                | (Submitted, Replaced)
                | (Replaced, Submitted)
        )
    }
}

struct Attempt {
    wallet: Address,
    state: AttemptState,
}

impl Attempt {
    fn new(wallet: Address) -> Self {
        Self {
            wallet,
            state: AttemptState::Pending,
        }
    }

    fn advance(&mut self, next: AttemptState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {} -> {}",
            self.state.as_str(),
            next.as_str()
        );
        tracing::debug!(
            wallet = %self.wallet,
            from = self.state.as_str(),
            to = next.as_str(),
            "action attempt"
        );
        self.state = next;
    }
}

impl SendObserver for Attempt {
    fn on_event(&mut self, event: SendEvent) {
        match event {
            SendEvent::Broadcast(_) if self.state == AttemptState::Submitted => {}
            SendEvent::Broadcast(_) => self.advance(AttemptState::Submitted),
            SendEvent::Superseded { .. } => {
                self.advance(AttemptState::Replaced);
                self.advance(AttemptState::Submitted);
            }
        }
    }
}

pub async fn run(ctx: &PhaseContext, mut report: PhaseReport) -> Result<PhaseReport, PipelineError> {
    let target = ctx
        .config
        .target_contract
        .ok_or(PipelineError::Missing("target_contract"))?;
    let call = ActionCall::parse(&ctx.config.action_function, &ctx.config.action_args)?;
    report.note("Call", format!("{} on {}", call.signature(), target));

    let wallets = ctx.eligible(ELIGIBLE)?;
    if wallets.is_empty() {
        tracing::info!("no funded wallets to act from");
        return Ok(report);
    }

    let sender = TxSender::new(ctx)?;
    let sender = &sender;
    let call = &call;
    let outcomes: Vec<_> = futures::stream::iter(wallets)
        .map(|wallet| async move { act(ctx, sender, call, target, wallet.address).await })
        .buffer_unordered(ctx.config.concurrency)
        .collect()
        .await;

    for outcome in outcomes {
        report.record(&outcome?);
    }
    if !ctx.config.action_value.is_zero() {
        report.note(
            "Value per call",
            format!("{} ETH", format_ether(ctx.config.action_value)),
        );
    }
    Ok(report)
}

#[tracing::instrument(skip_all, fields(%wallet))]
async fn act(
    ctx: &PhaseContext,
    sender: &TxSender<'_>,
    call: &ActionCall,
    target: Address,
    wallet: Address,
) -> Result<WalletOutcome, PipelineError> {
    let chain = ctx.chain()?;
    let value = ctx.config.action_value;

    match sender.resolve_pending(wallet, RecordKind::Action).await? {
        PriorSend::Clear => {}
        PriorSend::Landed(receipt) => {
            tracing::info!(hash = %receipt.tx_hash, "earlier action landed");
            ctx.store.advance_status(wallet, WalletStatus::Actioned)?;
            return Ok(WalletOutcome::Success);
        }
        PriorSend::Unresolved(_) => return Ok(WalletOutcome::Skipped("previous send pending")),
    }

    let mut attempt = Attempt::new(wallet);
    attempt.advance(AttemptState::Simulating);

    let rejected = |class: ErrorClass| -> Result<WalletOutcome, PipelineError> {
        ctx.store.append_transaction(
            &TransactionRecord::new(wallet, RecordKind::Action, RecordStatus::Failed)
                .with_amount(value)
                .with_error(class),
        )?;
        Ok(WalletOutcome::Failed(class))
    };

    let data = match call.encode_for(wallet) {
        Ok(data) => data,
        Err(e) => {
            tracing::warn!(error = %e, "could not encode calldata");
            attempt.advance(AttemptState::SimulationFailed);
            return rejected(ErrorClass::Unknown);
        }
    };
    let tx = TransactionRequest::default()
        .with_from(wallet)
        .with_to(target)
        .with_input(data)
        .with_value(value);

    if let Err(e) = simulate(ctx, chain, &tx).await {
        tracing::warn!(class = %e.class, error = %e, "simulation failed, not broadcasting");
        attempt.advance(AttemptState::SimulationFailed);
        return rejected(e.class);
    }
    if ctx.options.dry_run {
        tracing::info!("dry run, simulation passed");
        return Ok(WalletOutcome::Skipped("dry run"));
    }

    let gas_limit = match chain.estimate_gas(&tx).await {
        Ok(estimate) => estimate + estimate * GAS_HEADROOM_PERCENT / 100,
        Err(e) => {
            tracing::warn!(class = %e.class, error = %e, "gas estimation failed");
            attempt.advance(AttemptState::SimulationFailed);
            return rejected(e.class);
        }
    };

    let request = SendRequest {
        kind: RecordKind::Action,
        wallet,
        from: wallet,
        tx: tx.with_gas_limit(gas_limit),
        amount: value,
        quote: None,
        replace_stuck: true,
    };
    let submission = sender.send_observed(request, &mut attempt).await?;

    match &submission.outcome {
        SendOutcome::Confirmed(_) => {
            attempt.advance(AttemptState::ConfirmedSuccess);
            ctx.store.advance_status(wallet, WalletStatus::Actioned)?;
        }
        SendOutcome::Reverted(_) => attempt.advance(AttemptState::ConfirmedFailed),
        SendOutcome::Failed(_) => attempt.advance(AttemptState::SubmissionFailed),
        SendOutcome::Pending(hash) => {
            tracing::warn!(%hash, "action still unconfirmed, the watcher will reconcile it");
        }
    }
    Ok(submission.outcome.wallet_outcome())
}

/// `eth_call` with the attached value, retried on transient errors.
async fn simulate(
    ctx: &PhaseContext,
    chain: &dyn ChainClient,
    tx: &TransactionRequest,
) -> Result<(), ChainError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match chain.call(tx).await {
            Ok(_) => return Ok(()),
            Err(e) => match ctx.config.retry_policy.decide(attempt, e.class, true) {
                RetryDecision::GiveUp => return Err(e),
                RetryDecision::Retry { delay, .. } => tokio::time::sleep(delay).await,
            },
        }
    }
}
