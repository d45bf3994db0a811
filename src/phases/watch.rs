//! Event reconciler.
//!
//! Scans a bounded window of history, then polls new blocks until interrupted. A log is
//! relevant when its recipient is one of our wallets; the wallet is then marked `actioned`
//! (later statuses are never regressed) and an `event-detected` record is appended.
//!
//! Logs are keyed by `(tx_hash, log_index)` in a bounded recently-seen set so a log delivered
//! twice (a reorged range re-queried, a node repeating itself) is processed once.

use alloy::dyn_abi::{DynSolType, Specifier};
use alloy::json_abi::{Event, EventParam};
use alloy::primitives::{Address, B256, TxHash};
use alloy::rpc::types::{Filter, Log};
use futures::StreamExt;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use super::PhaseContext;
use crate::chain::ChainClient;
use crate::error::PipelineError;
use crate::report::{PhaseReport, WalletOutcome};
use crate::retry::RetryDecision;
use crate::types::{RecordKind, RecordStatus, TransactionRecord, WalletStatus};

/// Tried after the configured recipient field.
const RECIPIENT_NAMES: [&str; 5] = ["to", "recipient", "account", "owner", "minter"];

/// Extracts the recipient address from logs of one event.
#[derive(Debug, Clone)]
pub struct EventMatcher {
    event: Event,
    selector: B256,
    /// Where the recipient lives when the log matches the signature.
    location: Option<Location>,
    /// Raw topic used otherwise.
    topic_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Topic(usize),
    /// 32-byte head slot of the non-indexed data.
    DataWord(usize),
}

impl EventMatcher {
    pub fn parse(signature: &str, recipient_field: &str, topic_index: usize) -> Result<Self, PipelineError> {
        let event = Event::parse(signature.trim())
            .map_err(|e| PipelineError::EventFilter(format!("invalid event '{signature}': {e}")))?;
        let mut names = vec![recipient_field];
        names.extend(RECIPIENT_NAMES.iter().filter(|name| **name != recipient_field));
        let location = names.iter().find_map(|name| locate(&event, name));
        if location.is_none() {
            tracing::warn!(
                event = %event.signature(),
                topic_index,
                "no address parameter named like a recipient, using raw topic"
            );
        }
        Ok(Self {
            selector: event.selector(),
            event,
            location,
            topic_index,
        })
    }

    /// Signature hash logged as topic 0.
    pub fn selector(&self) -> B256 {
        self.selector
    }

    pub fn signature(&self) -> String {
        self.event.signature()
    }

    pub fn recipient(&self, log: &Log) -> Option<Address> {
        let topics = log.inner.data.topics();
        let data = log.inner.data.data.as_ref();
        if topics.first() == Some(&self.selector) {
            let named = match self.location {
                Some(Location::Topic(index)) => topics.get(index).and_then(|t| word_to_address(t.as_slice())),
                Some(Location::DataWord(slot)) => data.get(slot * 32..slot * 32 + 32).and_then(word_to_address),
                None => None,
            };
            if named.is_some() {
                return named;
            }
        }
        topics
            .get(self.topic_index)
            .and_then(|t| word_to_address(t.as_slice()))
    }
}

/// Position of the address parameter `name`, if the event has one.
fn locate(event: &Event, name: &str) -> Option<Location> {
    // Anonymous events do not log their selector, so topic positions shift.
    let first_topic = if event.anonymous { 0 } else { 1 };
    let mut topic = first_topic;
    let mut word = 0;
    for param in &event.inputs {
        if param.indexed {
            if param.name == name && param.ty == "address" {
                return Some(Location::Topic(topic));
            }
            topic += 1;
        } else {
            if param.name == name && param.ty == "address" {
                return Some(Location::DataWord(word));
            }
            word += head_words(param)?;
        }
    }
    None
}

/// Head slots a non-indexed parameter occupies in the log data.
fn head_words(param: &EventParam) -> Option<usize> {
    let ty: DynSolType = param.resolve().ok()?;
    Some(if ty.is_dynamic() { 1 } else { static_words(&ty) })
}

fn static_words(ty: &DynSolType) -> usize {
    match ty {
        DynSolType::Tuple(inner) => inner.iter().map(static_words).sum(),
        DynSolType::FixedArray(inner, len) => len * static_words(inner),
        _ => 1,
    }
}

/// Address in a left-padded 32-byte word.
fn word_to_address(word: &[u8]) -> Option<Address> {
    if word.len() != 32 || word[..12].iter().any(|b| *b != 0) {
        return None;
    }
    Some(Address::from_slice(&word[12..]))
}

/// Bounded set of recently processed logs.
#[derive(Debug)]
pub struct SeenSet {
    capacity: usize,
    order: VecDeque<(TxHash, u64)>,
    keys: HashSet<(TxHash, u64)>,
}

impl SeenSet {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            keys: HashSet::with_capacity(capacity),
        }
    }

    /// Returns `false` if `key` was already seen.
    pub fn insert(&mut self, key: (TxHash, u64)) -> bool {
        if !self.keys.insert(key) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.keys.remove(&evicted);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WatchStats {
    pub scanned: u64,
    pub relevant: u64,
    pub advanced: u64,
    pub duplicates: u64,
    pub irrelevant: u64,
    pub undecodable: u64,
}

struct Reconciler<'a> {
    ctx: &'a PhaseContext,
    matcher: EventMatcher,
    managed: HashSet<Address>,
    seen: SeenSet,
    stats: WatchStats,
    report: PhaseReport,
}

impl Reconciler<'_> {
    fn process(&mut self, log: &Log) -> Result<(), PipelineError> {
        self.stats.scanned += 1;
        if let (Some(tx_hash), Some(log_index)) = (log.transaction_hash, log.log_index) {
            if !self.seen.insert((tx_hash, log_index)) {
                self.stats.duplicates += 1;
                return Ok(());
            }
        }

        let Some(recipient) = self.matcher.recipient(log) else {
            self.stats.undecodable += 1;
            self.report.record(&WalletOutcome::Skipped("no recipient"));
            return Ok(());
        };
        if !self.managed.contains(&recipient) {
            self.stats.irrelevant += 1;
            return Ok(());
        }

        self.stats.relevant += 1;
        let advanced = self.ctx.store.advance_status(recipient, WalletStatus::Actioned)?;
        if advanced {
            self.stats.advanced += 1;
        }
        let mut record = TransactionRecord::new(recipient, RecordKind::EventDetected, RecordStatus::Success)
            .with_block(log.block_number);
        if let Some(tx_hash) = log.transaction_hash {
            record = record.with_hash(tx_hash);
        }
        self.ctx.store.append_transaction(&record)?;
        tracing::info!(
            wallet = %recipient,
            block = log.block_number,
            tx = ?log.transaction_hash,
            advanced,
            "action landed on-chain"
        );
        self.report.record(&WalletOutcome::Success);
        Ok(())
    }

    fn finish(mut self) -> PhaseReport {
        let stats = self.stats;
        self.report.note("Logs scanned", stats.scanned);
        self.report.note("Relevant events", stats.relevant);
        self.report.note("Wallets advanced", stats.advanced);
        self.report.note("Duplicates", stats.duplicates);
        self.report.note("Other recipients", stats.irrelevant);
        self.report
    }
}

pub async fn run(ctx: &PhaseContext, report: PhaseReport) -> Result<PhaseReport, PipelineError> {
    let chain = ctx.chain()?;
    let settings = &ctx.config.event_filter;
    let contract = settings
        .address
        .or(ctx.config.target_contract)
        .ok_or(PipelineError::Missing("event_filter.address"))?;
    let matcher = EventMatcher::parse(
        &settings.event_signature,
        &settings.recipient_field,
        settings.recipient_topic_index,
    )?;
    let filter = Filter::new().address(contract).event_signature(matcher.selector());
    let cursor_name = format!("watch:{contract}");
    let managed: HashSet<Address> = ctx.store.all_wallets()?.into_iter().map(|w| w.address).collect();
    tracing::info!(
        %contract,
        event = %matcher.signature(),
        wallets = managed.len(),
        "watching"
    );

    let mut reconciler = Reconciler {
        ctx,
        matcher,
        managed,
        seen: SeenSet::new(settings.dedup_capacity),
        stats: WatchStats::default(),
        report,
    };

    let head = chain.block_number().await?;
    let floor = head.saturating_sub(settings.lookback_blocks);
    let start = match ctx.store.load_cursor(&cursor_name)? {
        Some(cursor) if cursor + 1 < floor => {
            tracing::warn!(
                cursor,
                skipped_from = cursor + 1,
                skipped_to = floor - 1,
                "cursor is older than the lookback window, skipping blocks"
            );
            floor
        }
        Some(cursor) => cursor + 1,
        None => floor,
    };
    let batch = settings.scan_batch_blocks.max(1);
    let mut from = start;
    while from <= head {
        if ctx.shutdown.is_cancelled() {
            tracing::info!(block = from, "interrupted during historical scan");
            return Ok(reconciler.finish());
        }
        let to = (from + batch - 1).min(head);
        let logs = query_with_retry(ctx, chain, &filter, from, to).await?;
        tracing::debug!(from, to, logs = logs.len(), "scanned block range");
        for log in &logs {
            reconciler.process(log)?;
        }
        ctx.store.save_cursor(&cursor_name, to)?;
        from = to + 1;
    }
    tracing::info!(from = start, to = head, "historical scan complete, following new blocks");

    // Picks up exactly where the scan stopped.
    let poll_interval = Duration::from_millis(settings.poll_interval_ms);
    let mut batches = chain.subscribe_logs(filter, from, batch, poll_interval);
    loop {
        tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => {
                tracing::info!("shutdown requested, stopping watcher");
                break;
            }
            next = batches.next() => {
                match next {
                    Some(Ok(batch)) => {
                        tracing::debug!(
                            from = batch.from_block,
                            to = batch.to_block,
                            logs = batch.logs.len(),
                            "followed block range"
                        );
                        for log in &batch.logs {
                            reconciler.process(log)?;
                        }
                        ctx.store.save_cursor(&cursor_name, batch.to_block)?;
                    }
                    Some(Err(e)) => tracing::warn!(error = %e, "log poll failed, retrying"),
                    None => {
                        tracing::warn!("log stream ended");
                        break;
                    }
                }
            }
        }
    }
    Ok(reconciler.finish())
}

async fn query_with_retry(
    ctx: &PhaseContext,
    chain: &dyn ChainClient,
    filter: &Filter,
    from: u64,
    to: u64,
) -> Result<Vec<Log>, PipelineError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match chain.query_logs(filter, from, to).await {
            Ok(logs) => return Ok(logs),
            Err(e) => match ctx.config.retry_policy.decide(attempt, e.class, true) {
                RetryDecision::GiveUp => return Err(e.into()),
                RetryDecision::Retry { delay, .. } => {
                    tracing::warn!(from, to, attempt, error = %e, "log query failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::phases::test_support::*;
    use crate::testing::{MockChain, log_at};
    use alloy::dyn_abi::DynSolValue;
    use alloy::primitives::{Bytes, U256, address, keccak256};
    use std::sync::Arc;

    const TOKEN: Address = address!("0x0000000000000000000000000000000000070ce7");
    const TRANSFER: &str = "event Transfer(address indexed from, address indexed to, uint256 value)";

    fn transfer_log(to: Address, block: u64, tx_seed: u64) -> Log {
        let topics = vec![
            keccak256("Transfer(address,address,uint256)"),
            Address::ZERO.into_word(),
            to.into_word(),
        ];
        let data = Bytes::from(U256::from(1).to_be_bytes::<32>().to_vec());
        log_at(TOKEN, topics, data, block, tx_seed, 0)
    }

    fn watch_config() -> PipelineConfig {
        let mut config = fast_config();
        config.event_filter.address = Some(TOKEN);
        config.event_filter.lookback_blocks = 50;
        config.event_filter.scan_batch_blocks = 10;
        config.event_filter.poll_interval_ms = 1;
        config
    }

    #[test]
    fn test_indexed_recipient_by_name() {
        let matcher = EventMatcher::parse(TRANSFER, "to", 2).unwrap();
        let wallet = Address::repeat_byte(0x11);
        assert_eq!(matcher.recipient(&transfer_log(wallet, 1, 1)), Some(wallet));
    }

    #[test]
    fn test_unindexed_recipient_falls_back_to_common_name() {
        let matcher = EventMatcher::parse("event Minted(uint256 id, address minter)", "to", 2).unwrap();
        let wallet = Address::repeat_byte(0x22);
        let data = DynSolValue::Tuple(vec![
            DynSolValue::Uint(U256::from(7), 256),
            DynSolValue::Address(wallet),
        ])
        .abi_encode_params();
        let log = log_at(TOKEN, vec![matcher.selector()], data.into(), 1, 1, 0);
        assert_eq!(matcher.recipient(&log), Some(wallet));
    }

    #[test]
    fn test_topic_index_used_for_foreign_signature() {
        let matcher = EventMatcher::parse(TRANSFER, "to", 1).unwrap();
        let wallet = Address::repeat_byte(0x33);
        let log = log_at(
            TOKEN,
            vec![keccak256("Other(address)"), wallet.into_word()],
            Bytes::new(),
            1,
            1,
            0,
        );
        assert_eq!(matcher.recipient(&log), Some(wallet));
    }

    #[test]
    fn test_non_address_word_is_rejected() {
        let matcher = EventMatcher::parse(TRANSFER, "to", 2).unwrap();
        let log = log_at(
            TOKEN,
            vec![matcher.selector(), B256::ZERO, B256::repeat_byte(0xff)],
            Bytes::new(),
            1,
            1,
            0,
        );
        assert_eq!(matcher.recipient(&log), None);
    }

    #[test]
    fn test_invalid_signature() {
        assert!(matches!(
            EventMatcher::parse("event Broken(address", "to", 2),
            Err(PipelineError::EventFilter(_))
        ));
    }

    #[test]
    fn test_seen_set_is_bounded() {
        let mut seen = SeenSet::new(2);
        let key = |n: u8| (B256::repeat_byte(n), 0u64);
        assert!(seen.insert(key(1)));
        assert!(!seen.insert(key(1)));
        assert!(seen.insert(key(2)));
        assert!(seen.insert(key(3)));
        assert_eq!(seen.len(), 2);
        // The oldest key was evicted.
        assert!(seen.insert(key(1)));
    }

    /// Runs the watcher while `during` mutates the chain, then stops it.
    async fn watch_while<F: std::future::Future<Output = ()>>(ctx: &PhaseContext, during: F) -> PhaseReport {
        let (report, ()) = tokio::join!(run(ctx, PhaseReport::new("watch")), async {
            during.await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            ctx.shutdown.cancel();
        });
        report.unwrap()
    }

    fn cursor(ctx: &PhaseContext) -> Option<u64> {
        ctx.store.load_cursor(&format!("watch:{TOKEN}")).unwrap()
    }

    #[tokio::test]
    async fn test_reconciles_managed_recipients_only() {
        let chain = Arc::new(MockChain::new());
        chain.set_block(1_000);
        let ctx = context(watch_config(), chain.clone());
        let wallets = seed_wallets(&ctx, 2, WalletStatus::Funded);
        let consolidated = seed_wallets(&ctx, 1, WalletStatus::Consolidated)[0];

        chain.push_log(transfer_log(wallets[0], 960, 1));
        // Same log reported twice by the node.
        chain.push_log(transfer_log(wallets[0], 960, 1));
        chain.push_log(transfer_log(Address::repeat_byte(0x99), 970, 2));
        chain.push_log(transfer_log(consolidated, 980, 3));
        // Outside the lookback window.
        chain.push_log(transfer_log(wallets[1], 900, 4));

        let report = watch_while(&ctx, async {}).await;

        assert_eq!(report.success, 2);
        let status = |w: Address| ctx.store.get_wallet(w).unwrap().unwrap().status;
        assert_eq!(status(wallets[0]), WalletStatus::Actioned);
        assert_eq!(status(wallets[1]), WalletStatus::Funded);
        assert_eq!(status(consolidated), WalletStatus::Consolidated);

        let records = ctx.store.transactions_for(wallets[0]).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, RecordKind::EventDetected);
        assert_eq!(records[0].block_number, Some(960));
        assert_eq!(ctx.store.transactions_for(consolidated).unwrap().len(), 1);
        assert_eq!(cursor(&ctx), Some(1_000));
    }

    #[tokio::test]
    async fn test_resumes_from_cursor() {
        let chain = Arc::new(MockChain::new());
        chain.set_block(1_000);
        let ctx = context(watch_config(), chain.clone());
        let wallets = seed_wallets(&ctx, 2, WalletStatus::Funded);
        ctx.store.save_cursor(&format!("watch:{TOKEN}"), 990).unwrap();
        chain.push_log(transfer_log(wallets[0], 985, 1));
        chain.push_log(transfer_log(wallets[1], 995, 2));

        watch_while(&ctx, async {}).await;

        let status = |w: Address| ctx.store.get_wallet(w).unwrap().unwrap().status;
        assert_eq!(status(wallets[0]), WalletStatus::Funded);
        assert_eq!(status(wallets[1]), WalletStatus::Actioned);
    }

    #[tokio::test]
    async fn test_stale_cursor_is_bounded_by_lookback() {
        let chain = Arc::new(MockChain::new());
        chain.set_block(1_000);
        let ctx = context(watch_config(), chain.clone());
        let wallets = seed_wallets(&ctx, 2, WalletStatus::Funded);
        ctx.store.save_cursor(&format!("watch:{TOKEN}"), 100).unwrap();
        chain.push_log(transfer_log(wallets[0], 500, 1));
        chain.push_log(transfer_log(wallets[1], 960, 2));

        let report = watch_while(&ctx, async {}).await;

        assert_eq!(report.success, 1);
        let status = |w: Address| ctx.store.get_wallet(w).unwrap().unwrap().status;
        assert_eq!(status(wallets[0]), WalletStatus::Funded);
        assert_eq!(status(wallets[1]), WalletStatus::Actioned);
        assert_eq!(cursor(&ctx), Some(1_000));
    }

    #[tokio::test]
    async fn test_blocks_mined_after_the_scan_are_followed() {
        let chain = Arc::new(MockChain::new());
        chain.set_block(1_000);
        let ctx = context(watch_config(), chain.clone());
        let wallets = seed_wallets(&ctx, 2, WalletStatus::Funded);
        // Mined right after the historical scan read the head.
        chain.push_log(transfer_log(wallets[0], 1_001, 1));
        chain.push_log(transfer_log(Address::repeat_byte(0x99), 1_005, 2));

        let report = watch_while(&ctx, async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            chain.set_block(1_005);
        })
        .await;

        assert_eq!(report.success, 1);
        let status = |w: Address| ctx.store.get_wallet(w).unwrap().unwrap().status;
        assert_eq!(status(wallets[0]), WalletStatus::Actioned);
        assert_eq!(status(wallets[1]), WalletStatus::Funded);
        assert_eq!(cursor(&ctx), Some(1_005));
    }

    #[tokio::test]
    async fn test_stops_on_shutdown() {
        let chain = Arc::new(MockChain::new());
        let ctx = context(watch_config(), chain.clone());
        let wallets = seed_wallets(&ctx, 1, WalletStatus::Funded);
        chain.push_log(transfer_log(wallets[0], 1_001, 1));
        chain.set_block(1_001);
        ctx.shutdown.cancel();

        let report = run(&ctx, PhaseReport::new("watch")).await.unwrap();

        assert_eq!(report.success, 0);
        let stored = ctx.store.get_wallet(wallets[0]).unwrap().unwrap();
        assert_eq!(stored.status, WalletStatus::Funded);
    }
}
