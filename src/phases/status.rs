use super::PhaseContext;
use crate::error::PipelineError;
use crate::types::WalletStatus;

/// Prints wallet and transaction counts from the status store.
pub fn run(ctx: &PhaseContext) -> Result<(), PipelineError> {
    let stats = ctx.store.aggregate_stats()?;
    println!("{stats}");

    let pending = ctx.store.wallets_in(&[WalletStatus::Generated, WalletStatus::Funded])?;
    if let Some(oldest) = pending.first() {
        println!(
            "Oldest unfinished wallet: {} ({}, created {})",
            oldest.address,
            oldest.status,
            oldest.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    Ok(())
}
