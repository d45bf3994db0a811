//! Submission lifecycle shared by every sending phase.
//!
//! One call to [`TxSender::send`] covers fee quoting, sequence allocation, retries of
//! rejected broadcasts, the confirmation wait and, when enabled, fee-bumped replacement of a
//! broadcast that stays unconfirmed. Each broadcast attempt leaves exactly one record in the
//! audit log.

use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, TxHash, U256};
use alloy::rpc::types::TransactionRequest;

use super::PhaseContext;
use crate::chain::{ChainClient, ChainError, ErrorClass, TxReceipt};
use crate::config::GasBumpConfig;
use crate::error::PipelineError;
use crate::gas::{GasPricer, GasQuote};
use crate::nonce::SequenceCounter;
use crate::report::WalletOutcome;
use crate::retry::{Refresh, RetryDecision, RetryPolicy};
use crate::store::{StatusStore, StoreError};
use crate::types::{RecordKind, RecordStatus, TransactionRecord};

#[derive(Debug, Clone)]
pub struct SendRequest {
    pub kind: RecordKind,
    /// Wallet the audit records belong to.
    pub wallet: Address,
    /// Signing account.
    pub from: Address,
    /// Destination, value, calldata and gas limit. Fees and nonce are filled in here.
    pub tx: TransactionRequest,
    pub amount: U256,
    /// Quote for the first attempt; fetched live when absent.
    pub quote: Option<GasQuote>,
    /// Replace the broadcast with higher fees while it stays unconfirmed.
    pub replace_stuck: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Confirmed(TxReceipt),
    /// Mined, but execution reverted.
    Reverted(TxReceipt),
    /// Never made it into a block.
    Failed(ErrorClass),
    /// Broadcast, but no receipt within the wait.
    Pending(TxHash),
}

impl SendOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, SendOutcome::Confirmed(_))
    }

    pub fn wallet_outcome(&self) -> WalletOutcome {
        match self {
            SendOutcome::Confirmed(_) => WalletOutcome::Success,
            SendOutcome::Reverted(_) => WalletOutcome::Failed(ErrorClass::Reverted),
            SendOutcome::Failed(class) => WalletOutcome::Failed(*class),
            SendOutcome::Pending(_) => WalletOutcome::Failed(ErrorClass::Unknown),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub outcome: SendOutcome,
    /// Fee-bumped replacements broadcast for the final attempt.
    pub replacements: u32,
}

/// Progress reported while a submission is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendEvent {
    /// The node accepted (or may have accepted) a broadcast.
    Broadcast(TxHash),
    /// A fee-bumped replacement took over the sequence number.
    Superseded { by: TxHash },
}

pub trait SendObserver {
    fn on_event(&mut self, event: SendEvent);
}

impl SendObserver for () {
    fn on_event(&mut self, _event: SendEvent) {}
}

/// What became of an earlier run's unconfirmed broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriorSend {
    /// Nothing left pending; safe to send.
    Clear,
    /// Mined successfully since the last run. The success record has been appended.
    Landed(TxReceipt),
    /// Still without a receipt.
    Unresolved(TxHash),
}

pub struct TxSender<'a> {
    chain: &'a dyn ChainClient,
    store: &'a dyn StatusStore,
    sequences: &'a SequenceCounter,
    retry: &'a RetryPolicy,
    bump: &'a GasBumpConfig,
    pricer: GasPricer,
    confirmations: u64,
}

impl<'a> TxSender<'a> {
    pub fn new(ctx: &'a PhaseContext) -> Result<Self, PipelineError> {
        Ok(Self {
            chain: ctx.chain()?,
            store: ctx.store.as_ref(),
            sequences: &ctx.sequences,
            retry: &ctx.config.retry_policy,
            bump: &ctx.config.gas_bump,
            pricer: ctx.pricer(),
            confirmations: ctx.config.confirmations,
        })
    }

    pub async fn send(&self, request: SendRequest) -> Result<Submission, StoreError> {
        self.send_observed(request, &mut ()).await
    }

    /// Like [`TxSender::send`], reporting broadcasts and replacements to `observer` as they happen.
    ///
    /// The sequence number allocated for the first attempt is kept across retries. A broadcast
    /// whose response was lost may already be in the mempool, and reusing its nonce means a
    /// duplicate can only come back as "nonce too low" or "already known".
    #[tracing::instrument(skip_all, fields(kind = %request.kind, wallet = %request.wallet))]
    pub async fn send_observed(
        &self,
        request: SendRequest,
        observer: &mut (dyn SendObserver + Send),
    ) -> Result<Submission, StoreError> {
        let mut quote = request.quote;
        let mut nonce: Option<u64> = None;
        let mut resync = false;
        // Hashes of broadcasts that failed ambiguously and may still land.
        let mut in_doubt: Vec<TxHash> = Vec::new();
        // Set once the nonce may be held by a transaction in the mempool.
        let mut exposed = false;
        let mut stale_retried = false;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match self.prepare(&request, &mut quote, &mut nonce, &mut resync).await {
                Ok((sequence, current)) => {
                    let tx = current.apply(request.tx.clone().with_from(request.from).with_nonce(sequence));
                    match self.chain.send_transaction(tx).await {
                        Ok(hash) => {
                            tracing::info!(%hash, nonce = sequence, fee_per_gas = current.fee_per_gas(), "broadcast");
                            observer.on_event(SendEvent::Broadcast(hash));
                            in_doubt.push(hash);
                            return self.confirm(&request, in_doubt, sequence, current, observer).await;
                        }
                        Err(e) => {
                            if e.class == ErrorClass::Unknown {
                                exposed = true;
                                if let Some(hash) = e.tx_hash {
                                    tracing::warn!(%hash, nonce = sequence, error = %e, "broadcast outcome unknown");
                                    observer.on_event(SendEvent::Broadcast(hash));
                                    in_doubt.push(hash);
                                }
                            }
                            e
                        }
                    }
                }
                Err(e) => e,
            };

            // An ambiguous broadcast is recorded once its fate is known.
            let deferred = error.class == ErrorClass::Unknown && error.tx_hash.is_some();
            if !deferred {
                self.record_rejected(&request, &error)?;
            }

            if error.class == ErrorClass::StaleSequence && !in_doubt.is_empty() {
                // Our own earlier broadcast may be what consumed the nonce.
                if let Some(receipt) = self.find_mined(&in_doubt).await {
                    tracing::info!(hash = %receipt.tx_hash, "earlier broadcast landed");
                    return self.finish(&request, &in_doubt, receipt, 0);
                }
                for hash in in_doubt.drain(..) {
                    self.store.append_transaction(
                        &TransactionRecord::new(request.wallet, request.kind, RecordStatus::Failed)
                            .with_amount(request.amount)
                            .with_hash(hash)
                            .with_error(ErrorClass::Unknown),
                    )?;
                }
            }

            match self.retry.decide(attempt, error.class, stale_retried) {
                RetryDecision::GiveUp => {
                    tracing::warn!(attempt, class = %error.class, error = %error, "giving up");
                    if !in_doubt.is_empty() {
                        return self.leave_pending(&request, &in_doubt, Some(error.class), 0);
                    }
                    if let Some(sequence) = nonce {
                        if !exposed && error.class != ErrorClass::StaleSequence {
                            self.sequences.release(request.from, sequence).await;
                        }
                    }
                    return Ok(Submission {
                        outcome: SendOutcome::Failed(error.class),
                        replacements: 0,
                    });
                }
                RetryDecision::Retry { delay, refresh } => {
                    tracing::info!(
                        attempt,
                        class = %error.class,
                        delay_ms = delay.as_millis() as u64,
                        "broadcast failed, retrying"
                    );
                    match refresh {
                        Refresh::FeeQuote => quote = None,
                        Refresh::Sequence => {
                            stale_retried = true;
                            resync = true;
                        }
                        Refresh::None => {}
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Resolves an unconfirmed broadcast left by an earlier run for `wallet`.
    ///
    /// Looks at the latest `kind` record and, when it is pending, at every same-nonce broadcast
    /// it replaced. A reverted receipt is recorded and reported as [`PriorSend::Clear`].
    pub async fn resolve_pending(&self, wallet: Address, kind: RecordKind) -> Result<PriorSend, StoreError> {
        let records: Vec<_> = self
            .store
            .transactions_for(wallet)?
            .into_iter()
            .filter(|record| record.kind == kind)
            .collect();
        let Some(latest) = records.last() else {
            return Ok(PriorSend::Clear);
        };
        let (RecordStatus::Pending, Some(pending)) = (latest.status, latest.tx_hash) else {
            return Ok(PriorSend::Clear);
        };
        let mut candidates = vec![pending];
        candidates.extend(
            records
                .iter()
                .rev()
                .skip(1)
                .take_while(|record| record.error_class == Some(ErrorClass::Replaced))
                .filter_map(|record| record.tx_hash),
        );

        let Some(receipt) = self.find_mined(&candidates).await else {
            tracing::warn!(hash = %pending, "previous broadcast still unconfirmed");
            return Ok(PriorSend::Unresolved(pending));
        };
        let mut record = TransactionRecord::new(wallet, kind, RecordStatus::Success)
            .with_amount(latest.amount)
            .with_receipt(&receipt);
        if !receipt.success {
            record.status = RecordStatus::Failed;
            record = record.with_error(ErrorClass::Reverted);
        }
        self.store.append_transaction(&record)?;
        tracing::info!(hash = %receipt.tx_hash, success = receipt.success, "previous broadcast resolved");
        Ok(if receipt.success {
            PriorSend::Landed(receipt)
        } else {
            PriorSend::Clear
        })
    }

    async fn prepare(
        &self,
        request: &SendRequest,
        quote: &mut Option<GasQuote>,
        nonce: &mut Option<u64>,
        resync: &mut bool,
    ) -> Result<(u64, GasQuote), ChainError> {
        let current = match *quote {
            Some(current) => current,
            None => {
                let fetched = self.pricer.fetch(self.chain).await?;
                *quote = Some(fetched);
                fetched
            }
        };
        let sequence = match *nonce {
            Some(held) if !*resync => held,
            _ if *resync => {
                let fresh = self.sequences.resync(self.chain, request.from).await?;
                *resync = false;
                fresh
            }
            _ => self.sequences.next(self.chain, request.from).await?,
        };
        *nonce = Some(sequence);
        Ok((sequence, current))
    }

    fn record_rejected(&self, request: &SendRequest, error: &ChainError) -> Result<(), StoreError> {
        let mut record = TransactionRecord::new(request.wallet, request.kind, RecordStatus::Failed)
            .with_amount(request.amount)
            .with_error(error.class);
        if let Some(hash) = error.tx_hash {
            record = record.with_hash(hash);
        }
        self.store.append_transaction(&record)
    }

    async fn confirm(
        &self,
        request: &SendRequest,
        mut broadcasts: Vec<TxHash>,
        nonce: u64,
        mut quote: GasQuote,
        observer: &mut (dyn SendObserver + Send),
    ) -> Result<Submission, StoreError> {
        let mut replacing = request.replace_stuck;
        let mut replacements = 0;
        loop {
            let current = broadcasts[broadcasts.len() - 1];
            let may_replace = replacing && replacements < self.bump.max_bumps;
            let wait = may_replace.then(|| self.bump.wait());

            let receipt = match self.chain.wait_for_receipt(current, self.confirmations, wait).await {
                Ok(Some(receipt)) => Some(receipt),
                Ok(None) => self.find_mined(&broadcasts).await,
                Err(e) => {
                    tracing::warn!(hash = %current, error = %e, "receipt lookup failed");
                    return self.leave_pending(request, &broadcasts, Some(e.class), replacements);
                }
            };
            if let Some(receipt) = receipt {
                return self.finish(request, &broadcasts, receipt, replacements);
            }
            if !may_replace {
                tracing::warn!(hash = %current, "no receipt, leaving transaction pending");
                return self.leave_pending(request, &broadcasts, None, replacements);
            }

            let bumped = quote.bumped(self.bump.bump_percent, self.pricer.ceiling);
            if bumped.fee_per_gas() <= quote.fee_per_gas() {
                tracing::warn!(hash = %current, "fee already at ceiling, waiting without replacement");
                replacing = false;
                continue;
            }
            let tx = bumped.apply(request.tx.clone().with_from(request.from).with_nonce(nonce));
            match self.chain.send_transaction(tx).await {
                Ok(hash) => {
                    replacements += 1;
                    tracing::info!(
                        replaced = %current,
                        %hash,
                        nonce,
                        fee_per_gas = bumped.fee_per_gas(),
                        replacements,
                        "broadcast fee-bumped replacement"
                    );
                    observer.on_event(SendEvent::Superseded { by: hash });
                    broadcasts.push(hash);
                    quote = bumped;
                }
                Err(e) => {
                    tracing::warn!(hash = %current, class = %e.class, error = %e, "replacement rejected");
                    self.record_rejected(request, &e)?;
                    replacing = false;
                    // The nonce is spent, so one of our broadcasts landed in the meantime.
                    if e.class == ErrorClass::StaleSequence {
                        if let Some(receipt) = self.find_mined(&broadcasts).await {
                            return self.finish(request, &broadcasts, receipt, replacements);
                        }
                    }
                }
            }
        }
    }

    /// Receipt of whichever broadcast was mined, if any.
    async fn find_mined(&self, broadcasts: &[TxHash]) -> Option<TxReceipt> {
        for hash in broadcasts {
            match self.chain.get_receipt(*hash).await {
                Ok(Some(receipt)) => return Some(receipt),
                Ok(None) => {}
                Err(e) => tracing::debug!(%hash, error = %e, "receipt lookup failed"),
            }
        }
        None
    }

    fn finish(
        &self,
        request: &SendRequest,
        broadcasts: &[TxHash],
        receipt: TxReceipt,
        replacements: u32,
    ) -> Result<Submission, StoreError> {
        self.record_superseded(request, broadcasts, receipt.tx_hash)?;
        let (status, outcome) = if receipt.success {
            (RecordStatus::Success, SendOutcome::Confirmed(receipt.clone()))
        } else {
            (RecordStatus::Failed, SendOutcome::Reverted(receipt.clone()))
        };
        let mut record = TransactionRecord::new(request.wallet, request.kind, status)
            .with_amount(request.amount)
            .with_receipt(&receipt);
        if !receipt.success {
            record = record.with_error(ErrorClass::Reverted);
        }
        self.store.append_transaction(&record)?;
        tracing::info!(
            hash = %receipt.tx_hash,
            block = receipt.block_number,
            gas_used = receipt.gas_used,
            success = receipt.success,
            "confirmed"
        );
        Ok(Submission {
            outcome,
            replacements,
        })
    }

    fn leave_pending(
        &self,
        request: &SendRequest,
        broadcasts: &[TxHash],
        class: Option<ErrorClass>,
        replacements: u32,
    ) -> Result<Submission, StoreError> {
        let current = broadcasts[broadcasts.len() - 1];
        self.record_superseded(request, broadcasts, current)?;
        let mut record = TransactionRecord::new(request.wallet, request.kind, RecordStatus::Pending)
            .with_amount(request.amount)
            .with_hash(current);
        if let Some(class) = class {
            record = record.with_error(class);
        }
        self.store.append_transaction(&record)?;
        Ok(Submission {
            outcome: SendOutcome::Pending(current),
            replacements,
        })
    }

    fn record_superseded(
        &self,
        request: &SendRequest,
        broadcasts: &[TxHash],
        survivor: TxHash,
    ) -> Result<(), StoreError> {
        for hash in broadcasts.iter().filter(|hash| **hash != survivor) {
            self.store.append_transaction(
                &TransactionRecord::new(request.wallet, request.kind, RecordStatus::Failed)
                    .with_amount(request.amount)
                    .with_hash(*hash)
                    .with_error(ErrorClass::Replaced),
            )?;
        }
        Ok(())
    }
}
