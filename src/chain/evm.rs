//! Alloy-backed [`ChainClient`] over HTTP JSON-RPC.
//!
//! The client holds an [`EthereumWallet`] with every key the current phase needs (the funding
//! account and, for phases acting on managed wallets, their decrypted keys). Transactions
//! are expected to arrive fully populated (nonce, gas limit, fees) because the pipeline
//! owns sequence allocation and fee policy; no filler layer touches them.

use alloy::network::{Ethereum, EthereumWallet, NetworkWallet, TransactionBuilder};
use alloy::primitives::{Address, Bytes, TxHash, U256};
use alloy::providers::{
    PendingTransactionBuilder, PendingTransactionError, Provider, RootProvider, WatchTxError,
};
use alloy::rpc::client::RpcClient;
use alloy::rpc::types::{Filter, Log, TransactionReceipt, TransactionRequest};
use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{Instrument, instrument};

use crate::chain::dispatch::{DispatchStrategy, SenderCapabilities, select_strategy};
use crate::chain::error::is_already_known;
use crate::chain::{ChainClient, ChainError, ErrorClass, FeeData, TxReceipt};
use crate::config::RpcConfig;

/// JSON-RPC client with local signing.
pub struct EvmClient {
    provider: RootProvider,
    wallet: EthereumWallet,
    chain_id: u64,
    /// Whether the network prices gas with base fee + priority fee.
    eip1559: bool,
    /// Accounts the node will sign for; empty unless explicitly allowed.
    node_accounts: HashSet<Address>,
    receipt_timeout: Duration,
}

impl EvmClient {
    /// Connects to `rpc_url`, resolves the chain id and (optionally) node-managed accounts.
    pub async fn connect(
        rpc_url: &str,
        wallet: EthereumWallet,
        eip1559: bool,
        settings: &RpcConfig,
    ) -> Result<Self, ChainError> {
        let url = rpc_url.parse::<url::Url>().map_err(|e| {
            tracing::error!("Invalid RPC URL {rpc_url}: {e:?}");
            ChainError::new(ErrorClass::Unknown, format!("invalid RPC URL: {e}"))
        })?;

        tracing::debug!(
            request_timeout_secs = settings.request_timeout_secs,
            connect_timeout_secs = settings.connect_timeout_secs,
            pool_max_idle = settings.pool_max_idle_per_host,
            "Configuring RPC HTTP client"
        );

        let http_client = alloy::transports::http::reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(settings.pool_idle_timeout_secs))
            .pool_max_idle_per_host(settings.pool_max_idle_per_host)
            .build()
            .map_err(|e| ChainError::new(ErrorClass::Unknown, format!("HTTP client initialization failed: {e}")))?;

        let transport = alloy::transports::http::Http::with_client(http_client, url);
        let is_local = transport.guess_local();
        let client = RpcClient::builder().transport(transport, is_local);
        let provider = RootProvider::new(client);

        let chain_id = provider
            .get_chain_id()
            .await
            .map_err(|e| ChainError::classify(e, "eth_chainId"))?;

        let node_accounts: HashSet<Address> = if settings.allow_node_accounts {
            provider
                .get_accounts()
                .await
                .map_err(|e| ChainError::classify(e, "eth_accounts"))?
                .into_iter()
                .collect()
        } else {
            HashSet::new()
        };

        let signers: Vec<Address> =
            NetworkWallet::<Ethereum>::signer_addresses(&wallet).collect();
        tracing::info!(
            chain_id,
            eip1559,
            local_signers = signers.len(),
            node_accounts = node_accounts.len(),
            "Initialized chain client"
        );

        Ok(Self {
            provider,
            wallet,
            chain_id,
            eip1559,
            node_accounts,
            receipt_timeout: Duration::from_secs(settings.receipt_timeout_secs),
        })
    }

    fn capabilities(&self, sender: Address) -> SenderCapabilities {
        SenderCapabilities::probe(
            sender,
            |address| NetworkWallet::<Ethereum>::has_signer_for(&self.wallet, address),
            &self.node_accounts,
        )
    }
}

fn to_receipt(receipt: &TransactionReceipt) -> TxReceipt {
    TxReceipt {
        tx_hash: receipt.transaction_hash,
        block_number: receipt.block_number,
        gas_used: receipt.gas_used,
        effective_gas_price: receipt.effective_gas_price,
        success: receipt.status(),
    }
}

#[async_trait]
impl ChainClient for EvmClient {
    async fn block_number(&self) -> Result<u64, ChainError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| ChainError::classify(e, "eth_blockNumber"))
    }

    async fn get_balance(&self, address: Address) -> Result<U256, ChainError> {
        self.provider
            .get_balance(address)
            .await
            .map_err(|e| ChainError::classify(e, "eth_getBalance"))
    }

    async fn get_transaction_count(&self, address: Address) -> Result<u64, ChainError> {
        match self.provider.get_transaction_count(address).pending().await {
            Ok(count) => Ok(count),
            Err(e) => {
                tracing::warn!(
                    %address,
                    error = ?e,
                    "pending block tag not supported by RPC, falling back to latest"
                );
                self.provider
                    .get_transaction_count(address)
                    .latest()
                    .await
                    .map_err(|e| ChainError::classify(e, "eth_getTransactionCount"))
            }
        }
    }

    async fn call(&self, tx: &TransactionRequest) -> Result<Bytes, ChainError> {
        self.provider
            .call(tx.clone())
            .await
            .map_err(|e| ChainError::classify(e, "eth_call"))
    }

    async fn estimate_gas(&self, tx: &TransactionRequest) -> Result<u64, ChainError> {
        self.provider
            .estimate_gas(tx.clone())
            .await
            .map_err(|e| ChainError::classify(e, "eth_estimateGas"))
    }

    #[instrument(skip_all, fields(from = ?tx.from, nonce = ?tx.nonce))]
    async fn send_transaction(&self, tx: TransactionRequest) -> Result<TxHash, ChainError> {
        let from = tx
            .from
            .ok_or_else(|| ChainError::new(ErrorClass::Unknown, "transaction has no sender"))?;
        let tx = tx.with_chain_id(self.chain_id);

        let strategy = select_strategy(&DispatchStrategy::RANKED, &self.capabilities(from))
            .ok_or_else(|| {
                ChainError::new(ErrorClass::Unknown, format!("no dispatch strategy can sign for {from}"))
            })?;
        tracing::debug!(%strategy, "dispatching transaction");

        let sent = match strategy {
            DispatchStrategy::LocalSigner => {
                let envelope = tx.build(&self.wallet).await.map_err(|e| {
                    ChainError::new(ErrorClass::Unknown, format!("failed to sign transaction: {e}"))
                })?;
                let signed_hash = *envelope.tx_hash();
                match self
                    .provider
                    .send_tx_envelope(envelope)
                    .instrument(tracing::debug_span!("eth_sendRawTransaction"))
                    .await
                {
                    Ok(pending) => Ok(*pending.tx_hash()),
                    // The same signed bytes are already in the mempool.
                    Err(e) if is_already_known(&e.to_string()) => {
                        tracing::debug!(hash = %signed_hash, "transaction already known to the node");
                        Ok(signed_hash)
                    }
                    Err(e) => Err(ChainError::classify(e, "send transaction").with_tx_hash(signed_hash)),
                }
            }
            DispatchStrategy::NodeAccount => self
                .provider
                .send_transaction(tx)
                .instrument(tracing::debug_span!("eth_sendTransaction"))
                .await
                .map(|pending| *pending.tx_hash())
                .map_err(|e| ChainError::classify(e, "send transaction")),
        };

        if let Err(error) = &sent {
            if error.class == ErrorClass::StaleSequence {
                tracing::error!(%from, error = %error, "nonce collision detected");
            }
        }
        sent
    }

    async fn get_receipt(&self, tx_hash: TxHash) -> Result<Option<TxReceipt>, ChainError> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| ChainError::classify(e, "eth_getTransactionReceipt"))?;
        Ok(receipt.as_ref().map(to_receipt))
    }

    async fn wait_for_receipt(
        &self,
        tx_hash: TxHash,
        confirmations: u64,
        timeout: Option<Duration>,
    ) -> Result<Option<TxReceipt>, ChainError> {
        let watcher = PendingTransactionBuilder::new(self.provider.clone(), tx_hash)
            .with_required_confirmations(confirmations.max(1))
            .with_timeout(Some(timeout.unwrap_or(self.receipt_timeout)));

        match watcher.get_receipt().await {
            Ok(receipt) => Ok(Some(to_receipt(&receipt))),
            Err(PendingTransactionError::TxWatcher(WatchTxError::Timeout)) => {
                tracing::debug!(%tx_hash, "receipt wait timed out");
                Ok(None)
            }
            Err(e) => Err(ChainError::classify(e, "wait for receipt")),
        }
    }

    async fn fee_estimate(&self) -> Result<FeeData, ChainError> {
        let gas_price = self
            .provider
            .get_gas_price()
            .await
            .map_err(|e| ChainError::classify(e, "eth_gasPrice"))?;
        if !self.eip1559 {
            return Ok(FeeData {
                gas_price,
                max_fee_per_gas: None,
                max_priority_fee_per_gas: None,
            });
        }
        let estimate = self
            .provider
            .estimate_eip1559_fees()
            .await
            .map_err(|e| ChainError::classify(e, "estimate eip1559 fees"))?;
        Ok(FeeData {
            gas_price,
            max_fee_per_gas: Some(estimate.max_fee_per_gas),
            max_priority_fee_per_gas: Some(estimate.max_priority_fee_per_gas),
        })
    }

    async fn query_logs(
        &self,
        filter: &Filter,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Log>, ChainError> {
        let filter = filter.clone().from_block(from_block).to_block(to_block);
        self.provider
            .get_logs(&filter)
            .await
            .map_err(|e| ChainError::classify(e, "eth_getLogs"))
    }
}
