//! Scripted in-memory chain for unit tests.

use alloy::primitives::{Address, B256, Bytes, LogData, TxHash, U256, keccak256};
use alloy::rpc::types::{Filter, Log, TransactionRequest};
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crate::chain::{ChainClient, ChainError, ErrorClass, FeeData, IERC20, TxReceipt};

pub const GWEI: u128 = 1_000_000_000;

pub fn ether(whole: u64, millis: u64) -> U256 {
    U256::from(whole) * U256::from(10u64).pow(U256::from(18))
        + U256::from(millis) * U256::from(10u64).pow(U256::from(15))
}

struct State {
    block: u64,
    fee: FeeData,
    estimate_gas: u64,
    balances: HashMap<Address, U256>,
    nonces: HashMap<Address, u64>,
    used_nonces: HashSet<(Address, u64)>,
    token_balances: HashMap<(Address, Address), U256>,
    reverting_senders: HashSet<Address>,
    send_failures: VecDeque<ChainError>,
    stall_next: u32,
    stalled: HashMap<(Address, u64), TxHash>,
    sent: Vec<TransactionRequest>,
    receipts: HashMap<TxHash, TxReceipt>,
    logs: Vec<Log>,
    sequence: u64,
    send_calls: u64,
    numbered_failures: HashMap<u64, ChainError>,
    lose_next_response: bool,
}

pub struct MockChain {
    state: Mutex<State>,
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChain {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                block: 1_000,
                fee: FeeData {
                    gas_price: GWEI,
                    max_fee_per_gas: Some(2 * GWEI),
                    max_priority_fee_per_gas: Some(GWEI / 10),
                },
                estimate_gas: 60_000,
                balances: HashMap::new(),
                nonces: HashMap::new(),
                used_nonces: HashSet::new(),
                token_balances: HashMap::new(),
                reverting_senders: HashSet::new(),
                send_failures: VecDeque::new(),
                stall_next: 0,
                stalled: HashMap::new(),
                sent: Vec::new(),
                receipts: HashMap::new(),
                logs: Vec::new(),
                sequence: 0,
                send_calls: 0,
                numbered_failures: HashMap::new(),
                lose_next_response: false,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn respond(state: &mut State, hash: TxHash) -> Result<TxHash, ChainError> {
        if std::mem::take(&mut state.lose_next_response) {
            return Err(ChainError::new(ErrorClass::Unknown, "request timed out").with_tx_hash(hash));
        }
        Ok(hash)
    }

    pub fn set_balance(&self, address: Address, balance: U256) {
        self.state().balances.insert(address, balance);
    }

    pub fn balance(&self, address: Address) -> U256 {
        self.state().balances.get(&address).copied().unwrap_or_default()
    }

    pub fn set_nonce(&self, address: Address, nonce: u64) {
        self.state().nonces.insert(address, nonce);
    }

    pub fn set_fee(&self, fee: FeeData) {
        self.state().fee = fee;
    }

    pub fn set_block(&self, block: u64) {
        self.state().block = block;
    }

    pub fn set_token_balance(&self, token: Address, owner: Address, balance: U256) {
        self.state().token_balances.insert((token, owner), balance);
    }

    pub fn token_balance(&self, token: Address, owner: Address) -> U256 {
        self.state()
            .token_balances
            .get(&(token, owner))
            .copied()
            .unwrap_or_default()
    }

    /// Every `eth_call` and broadcast from `sender` reverts.
    pub fn revert_calls_from(&self, sender: Address) {
        self.state().reverting_senders.insert(sender);
    }

    /// The next broadcast fails with `error` before reaching the mempool.
    pub fn fail_next_send(&self, error: ChainError) {
        self.state().send_failures.push_back(error);
    }

    /// The next `count` accepted broadcasts never get a receipt.
    pub fn stall_next_sends(&self, count: u32) {
        self.state().stall_next = count;
    }

    /// Mines every stalled broadcast with a successful receipt.
    pub fn mine_stalled(&self) {
        let mut state = self.state();
        let stalled: Vec<_> = state.stalled.drain().map(|(_, hash)| hash).collect();
        for hash in stalled {
            state.block += 1;
            let block = state.block;
            state.receipts.insert(
                hash,
                TxReceipt {
                    tx_hash: hash,
                    block_number: Some(block),
                    gas_used: 21_000,
                    effective_gas_price: GWEI,
                    success: true,
                },
            );
        }
    }

    /// Every transaction accepted into the mempool, replacements included.
    pub fn sent(&self) -> Vec<TransactionRequest> {
        self.state().sent.clone()
    }

    pub fn push_log(&self, log: Log) {
        self.state().logs.push(log);
    }

    /// The `call`-th broadcast overall (1-based) fails with `error` before reaching the mempool.
    pub fn fail_send_number(&self, call: u64, error: ChainError) {
        self.state().numbered_failures.insert(call, error);
    }

    /// The next broadcast is accepted but the caller sees a timeout.
    pub fn lose_next_response(&self) {
        self.state().lose_next_response = true;
    }
}

/// Builds a mined log for tests.
pub fn log_at(
    address: Address,
    topics: Vec<B256>,
    data: Bytes,
    block: u64,
    tx_seed: u64,
    log_index: u64,
) -> Log {
    Log {
        inner: alloy::primitives::Log {
            address,
            data: LogData::new_unchecked(topics, data),
        },
        block_number: Some(block),
        transaction_hash: Some(keccak256(tx_seed.to_be_bytes())),
        log_index: Some(log_index),
        ..Default::default()
    }
}

fn fee_per_gas(tx: &TransactionRequest) -> u128 {
    tx.max_fee_per_gas.or(tx.gas_price).unwrap_or_default()
}

fn recipient(tx: &TransactionRequest) -> Option<Address> {
    tx.to.and_then(|kind| kind.to().copied())
}

fn input(tx: &TransactionRequest) -> Bytes {
    tx.input.input().cloned().unwrap_or_default()
}

#[async_trait]
impl ChainClient for MockChain {
    async fn block_number(&self) -> Result<u64, ChainError> {
        Ok(self.state().block)
    }

    async fn get_balance(&self, address: Address) -> Result<U256, ChainError> {
        Ok(self.balance(address))
    }

    async fn get_transaction_count(&self, address: Address) -> Result<u64, ChainError> {
        Ok(self.state().nonces.get(&address).copied().unwrap_or_default())
    }

    async fn call(&self, tx: &TransactionRequest) -> Result<Bytes, ChainError> {
        let state = self.state();
        if tx.from.is_some_and(|from| state.reverting_senders.contains(&from)) {
            return Err(ChainError::new(ErrorClass::Reverted, "execution reverted"));
        }
        let data = input(tx);
        if data.len() >= 4 && data[..4] == IERC20::balanceOfCall::SELECTOR {
            let call = IERC20::balanceOfCall::abi_decode(&data)
                .map_err(|e| ChainError::new(ErrorClass::Unknown, e.to_string()))?;
            let token = recipient(tx).unwrap_or_default();
            let balance = state
                .token_balances
                .get(&(token, call.owner))
                .copied()
                .unwrap_or_default();
            return Ok(Bytes::from(balance.to_be_bytes::<32>().to_vec()));
        }
        Ok(Bytes::new())
    }

    async fn estimate_gas(&self, tx: &TransactionRequest) -> Result<u64, ChainError> {
        let state = self.state();
        if tx.from.is_some_and(|from| state.reverting_senders.contains(&from)) {
            return Err(ChainError::new(ErrorClass::Reverted, "execution reverted"));
        }
        Ok(state.estimate_gas)
    }

    async fn send_transaction(&self, tx: TransactionRequest) -> Result<TxHash, ChainError> {
        let mut state = self.state();
        state.send_calls += 1;
        let call = state.send_calls;
        if let Some(error) = state.numbered_failures.remove(&call) {
            return Err(error);
        }
        if let Some(error) = state.send_failures.pop_front() {
            return Err(error);
        }
        let from = tx
            .from
            .ok_or_else(|| ChainError::new(ErrorClass::Unknown, "missing sender"))?;
        let nonce = tx
            .nonce
            .ok_or_else(|| ChainError::new(ErrorClass::Unknown, "missing nonce"))?;
        let replacing = state.stalled.contains_key(&(from, nonce));
        let next = state.nonces.get(&from).copied().unwrap_or_default();
        if state.used_nonces.contains(&(from, nonce)) && !replacing {
            return Err(ChainError::new(
                ErrorClass::StaleSequence,
                format!("nonce too low: next nonce {next}, tx nonce {nonce}"),
            ));
        }

        let gas = tx.gas.unwrap_or(21_000);
        let price = fee_per_gas(&tx);
        let value = tx.value.unwrap_or_default();
        let cost = value + U256::from(gas) * U256::from(price);
        let balance = state.balances.get(&from).copied().unwrap_or_default();
        if balance < cost {
            return Err(ChainError::new(
                ErrorClass::InsufficientFunds,
                "insufficient funds for gas * price + value",
            ));
        }

        state.sequence += 1;
        let hash = keccak256(format!("{from}:{nonce}:{}", state.sequence));
        state.sent.push(tx.clone());
        state.used_nonces.insert((from, nonce));
        state.nonces.insert(from, next.max(nonce + 1));

        if state.stall_next > 0 {
            state.stall_next -= 1;
            state.stalled.insert((from, nonce), hash);
            return Self::respond(&mut state, hash);
        }
        state.stalled.remove(&(from, nonce));

        state.block += 1;
        let block = state.block;
        let to = recipient(&tx).unwrap_or_default();
        let mut success = !state.reverting_senders.contains(&from);
        state.balances.insert(from, balance - U256::from(gas) * U256::from(price));
        if success {
            let data = input(&tx);
            if data.len() >= 4 && data[..4] == IERC20::transferCall::SELECTOR {
                let call = IERC20::transferCall::abi_decode(&data)
                    .map_err(|e| ChainError::new(ErrorClass::Unknown, e.to_string()))?;
                let held = state
                    .token_balances
                    .get(&(to, from))
                    .copied()
                    .unwrap_or_default();
                if held < call.amount {
                    success = false;
                } else {
                    state.token_balances.insert((to, from), held - call.amount);
                    *state.token_balances.entry((to, call.to)).or_default() += call.amount;
                }
            }
        }
        if success {
            *state.balances.entry(from).or_default() -= value;
            *state.balances.entry(to).or_default() += value;
        }
        state.receipts.insert(
            hash,
            TxReceipt {
                tx_hash: hash,
                block_number: Some(block),
                gas_used: gas,
                effective_gas_price: price,
                success,
            },
        );
        Self::respond(&mut state, hash)
    }

    async fn get_receipt(&self, tx_hash: TxHash) -> Result<Option<TxReceipt>, ChainError> {
        Ok(self.state().receipts.get(&tx_hash).cloned())
    }

    async fn wait_for_receipt(
        &self,
        tx_hash: TxHash,
        _confirmations: u64,
        _timeout: Option<Duration>,
    ) -> Result<Option<TxReceipt>, ChainError> {
        Ok(self.state().receipts.get(&tx_hash).cloned())
    }

    async fn fee_estimate(&self) -> Result<FeeData, ChainError> {
        Ok(self.state().fee)
    }

    async fn query_logs(
        &self,
        _filter: &Filter,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Log>, ChainError> {
        Ok(self
            .state()
            .logs
            .iter()
            .filter(|log| {
                log.block_number
                    .is_some_and(|b| b >= from_block && b <= to_block)
            })
            .cloned()
            .collect())
    }

}
