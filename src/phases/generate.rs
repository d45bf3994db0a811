//! Wallet set generation.

use alloy::primitives::Address;
use chrono::Utc;
use std::collections::HashSet;

use super::PhaseContext;
use crate::error::PipelineError;
use crate::report::{PhaseReport, WalletOutcome};
use crate::types::WalletStatus;

/// Tops the wallet set up to `wallet_count`. Existing wallets are never re-created.
pub async fn run(ctx: &PhaseContext, mut report: PhaseReport) -> Result<PhaseReport, PipelineError> {
    let mut known: HashSet<Address> = ctx.store.all_wallets()?.into_iter().map(|w| w.address).collect();

    // Keys written by a run that stopped before registering them.
    let mut recovered = 0;
    for address in ctx.credentials.addresses()? {
        if known.contains(&address) {
            continue;
        }
        if !ctx.options.dry_run {
            ctx.store.upsert_wallet(address, WalletStatus::Generated, Utc::now())?;
        }
        tracing::info!(%address, "registered keystore missing from the status store");
        known.insert(address);
        recovered += 1;
    }

    let target = ctx.config.wallet_count as usize;
    let mut missing = target.saturating_sub(known.len());
    if let Some(limit) = ctx.options.max_wallets {
        missing = missing.min(limit);
    }
    report.note("Target", target);
    report.note("Existing", known.len());
    if recovered > 0 {
        report.note("Recovered from keystore", recovered);
    }

    if ctx.options.dry_run {
        tracing::info!(missing, "dry run, no wallets created");
        for _ in 0..missing {
            report.record(&WalletOutcome::Skipped("dry run"));
        }
        return Ok(report);
    }

    for _ in 0..missing {
        let address = ctx.credentials.create()?;
        ctx.store.upsert_wallet(address, WalletStatus::Generated, Utc::now())?;
        tracing::info!(%address, "generated wallet");
        report.record(&WalletOutcome::Success);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phases::RunOptions;
    use crate::phases::test_support::*;
    use crate::testing::MockChain;
    use std::sync::Arc;

    fn config(count: u32) -> crate::config::PipelineConfig {
        let mut config = fast_config();
        config.wallet_count = count;
        config
    }

    #[tokio::test]
    async fn test_generates_up_to_target() {
        let ctx = context(config(3), Arc::new(MockChain::new()));

        let report = run(&ctx, PhaseReport::new("generate")).await.unwrap();

        assert_eq!(report.success, 3);
        let wallets = ctx.store.all_wallets().unwrap();
        assert_eq!(wallets.len(), 3);
        assert!(wallets.iter().all(|w| w.status == WalletStatus::Generated));
        assert_eq!(ctx.credentials.addresses().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_rerun_tops_up_without_recreating() {
        let mut ctx = context(config(2), Arc::new(MockChain::new()));
        run(&ctx, PhaseReport::new("generate")).await.unwrap();
        let first: Vec<_> = ctx.store.all_wallets().unwrap().iter().map(|w| w.address).collect();

        let again = run(&ctx, PhaseReport::new("generate")).await.unwrap();
        assert_eq!(again.total(), 0);

        ctx.config.wallet_count = 4;
        let topped = run(&ctx, PhaseReport::new("generate")).await.unwrap();
        assert_eq!(topped.success, 2);
        let all: Vec<_> = ctx.store.all_wallets().unwrap().iter().map(|w| w.address).collect();
        assert_eq!(all.len(), 4);
        assert!(first.iter().all(|a| all.contains(a)));
    }

    #[tokio::test]
    async fn test_max_wallets_limits_creation() {
        let ctx = context(config(5), Arc::new(MockChain::new())).with_options(RunOptions {
            dry_run: false,
            max_wallets: Some(2),
        });
        let report = run(&ctx, PhaseReport::new("generate")).await.unwrap();
        assert_eq!(report.success, 2);
    }

    #[tokio::test]
    async fn test_unregistered_keystore_is_recovered() {
        let ctx = context(config(2), Arc::new(MockChain::new()));
        let orphan = ctx.credentials.create().unwrap();

        let report = run(&ctx, PhaseReport::new("generate")).await.unwrap();

        assert_eq!(report.success, 1);
        assert!(ctx.store.get_wallet(orphan).unwrap().is_some());
        assert_eq!(ctx.store.all_wallets().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_dry_run_creates_nothing() {
        let ctx = context(config(3), Arc::new(MockChain::new())).with_options(RunOptions {
            dry_run: true,
            max_wallets: None,
        });
        let report = run(&ctx, PhaseReport::new("generate")).await.unwrap();
        assert_eq!(report.skipped, 3);
        assert!(ctx.store.all_wallets().unwrap().is_empty());
        assert!(ctx.credentials.addresses().unwrap().is_empty());
    }
}
