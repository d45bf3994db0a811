//! Multi-wallet EVM batch pipeline.
//!
//! A fleet of wallets moves through independent, re-runnable phases: generation, funding
//! from a single funding account, a configured contract action, on-chain reconciliation of
//! that action, an ERC-20 sweep and a final native-balance refund. Each phase reads and
//! advances per-wallet status in a shared [`store::StatusStore`], and every submission
//! attempt is appended to an audit log in the same store.

pub mod calldata;
pub mod chain;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod error;
pub mod from_env;
pub mod gas;
pub mod nonce;
pub mod phases;
pub mod report;
pub mod retry;
pub mod sig_down;
pub mod store;
pub mod telemetry;
pub mod types;

#[cfg(test)]
mod testing;

pub use error::PipelineError;
