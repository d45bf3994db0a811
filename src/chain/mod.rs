//! Chain access used by the pipeline phases.
//!
//! Phases only talk to the network through [`ChainClient`]. The production implementation is
//! [`evm::EvmClient`]; tests use a scripted in-memory client.

pub mod dispatch;
pub mod error;
pub mod evm;

use alloy::primitives::{Address, Bytes, TxHash, U256};
use alloy::rpc::types::{Filter, Log, TransactionRequest};
use alloy::sol;
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::time::Duration;

pub use error::{ChainError, ErrorClass};

sol! {
    #[allow(missing_docs)]
    interface IERC20 {
        function balanceOf(address owner) external view returns (uint256);
        function transfer(address to, uint256 amount) external returns (bool);
    }
}

/// Outcome of a mined transaction, reduced to what the audit log keeps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: TxHash,
    pub block_number: Option<u64>,
    pub gas_used: u64,
    pub effective_gas_price: u128,
    /// `false` when the transaction was mined but reverted.
    pub success: bool,
}

/// Live fee data as reported by the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeData {
    pub gas_price: u128,
    /// Present on fee-market (EIP-1559) networks.
    pub max_fee_per_gas: Option<u128>,
    pub max_priority_fee_per_gas: Option<u128>,
}

/// JSON-RPC operations consumed by the pipeline.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn block_number(&self) -> Result<u64, ChainError>;

    async fn get_balance(&self, address: Address) -> Result<U256, ChainError>;

    /// Transaction count including transactions still in the mempool.
    async fn get_transaction_count(&self, address: Address) -> Result<u64, ChainError>;

    /// Read-only execution against current state (`eth_call`).
    async fn call(&self, tx: &TransactionRequest) -> Result<Bytes, ChainError>;

    async fn estimate_gas(&self, tx: &TransactionRequest) -> Result<u64, ChainError>;

    /// Broadcasts a fully populated transaction and returns its hash.
    async fn send_transaction(&self, tx: TransactionRequest) -> Result<TxHash, ChainError>;

    /// Non-blocking receipt lookup.
    async fn get_receipt(&self, tx_hash: TxHash) -> Result<Option<TxReceipt>, ChainError>;

    /// Waits until `tx_hash` has `confirmations` confirmations.
    ///
    /// Returns `Ok(None)` if `timeout` elapses first. Without a timeout the wait is bounded
    /// only by the client's own receipt timeout.
    async fn wait_for_receipt(
        &self,
        tx_hash: TxHash,
        confirmations: u64,
        timeout: Option<Duration>,
    ) -> Result<Option<TxReceipt>, ChainError>;

    async fn fee_estimate(&self) -> Result<FeeData, ChainError>;

    async fn query_logs(
        &self,
        filter: &Filter,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Log>, ChainError>;

    /// Follows `filter` from `from_block` onwards, one batch per newly available block range.
    ///
    /// Consecutive batches cover contiguous ranges, so nothing mined between two polls is
    /// skipped. A failed poll is yielded as an error and retried after `poll_interval`.
    fn subscribe_logs<'a>(
        &'a self,
        filter: Filter,
        from_block: u64,
        batch_blocks: u64,
        poll_interval: Duration,
    ) -> BoxStream<'a, Result<LogBatch, ChainError>> {
        let batch_blocks = batch_blocks.max(1);
        futures::stream::unfold((from_block, false), move |(next, backoff)| {
            let filter = filter.clone();
            async move {
                if backoff {
                    tokio::time::sleep(poll_interval).await;
                }
                loop {
                    let head = match self.block_number().await {
                        Ok(head) => head,
                        Err(e) => return Some((Err(e), (next, true))),
                    };
                    if head >= next {
                        let to = head.min(next + batch_blocks - 1);
                        return Some(match self.query_logs(&filter, next, to).await {
                            Ok(logs) => (
                                Ok(LogBatch {
                                    from_block: next,
                                    to_block: to,
                                    logs,
                                }),
                                (to + 1, false),
                            ),
                            Err(e) => (Err(e), (next, true)),
                        });
                    }
                    tokio::time::sleep(poll_interval).await;
                }
            }
        })
        .boxed()
    }
}

/// Logs of one contiguous block range.
#[derive(Debug, Clone)]
pub struct LogBatch {
    pub from_block: u64,
    pub to_block: u64,
    pub logs: Vec<Log>,
}

/// Reads an ERC-20 balance through `eth_call`.
pub async fn erc20_balance<C: ChainClient + ?Sized>(
    chain: &C,
    token: Address,
    owner: Address,
) -> Result<U256, ChainError> {
    use alloy::network::TransactionBuilder;

    let call = IERC20::balanceOfCall { owner };
    let tx = TransactionRequest::default()
        .with_to(token)
        .with_input(call.abi_encode());
    let output = chain.call(&tx).await?;
    decode_uint(&output)
        .ok_or_else(|| ChainError::new(ErrorClass::Unknown, format!("malformed balanceOf output from {token}")))
}

/// Calldata for an ERC-20 `transfer(to, amount)`.
pub fn erc20_transfer_calldata(to: Address, amount: U256) -> Bytes {
    IERC20::transferCall { to, amount }.abi_encode().into()
}

fn decode_uint(output: &[u8]) -> Option<U256> {
    if output.len() < 32 {
        return None;
    }
    Some(U256::from_be_slice(&output[..32]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockChain;
    use alloy::primitives::address;

    #[tokio::test]
    async fn test_erc20_balance_reads_mock_token() {
        let token = address!("0x00000000000000000000000000000000000000aa");
        let owner = address!("0x0000000000000000000000000000000000000001");
        let chain = MockChain::new();
        chain.set_token_balance(token, owner, U256::from(42));

        let balance = erc20_balance(&chain, token, owner).await.unwrap();
        assert_eq!(balance, U256::from(42));
    }

    #[tokio::test]
    async fn test_subscription_covers_blocks_mined_between_polls() {
        let chain = MockChain::new();
        chain.set_block(1_000);
        let mut stream = chain.subscribe_logs(Filter::new(), 998, 2, Duration::from_millis(1));

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!((first.from_block, first.to_block), (998, 999));
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!((second.from_block, second.to_block), (1_000, 1_000));

        chain.set_block(1_003);
        let third = stream.next().await.unwrap().unwrap();
        assert_eq!((third.from_block, third.to_block), (1_001, 1_002));
        let fourth = stream.next().await.unwrap().unwrap();
        assert_eq!((fourth.from_block, fourth.to_block), (1_003, 1_003));
    }

    #[test]
    fn test_transfer_calldata_selector() {
        let data = erc20_transfer_calldata(Address::ZERO, U256::from(1));
        assert_eq!(&data[..4], &IERC20::transferCall::SELECTOR);
        assert_eq!(data.len(), 4 + 64);
    }
}
