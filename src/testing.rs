//! In-memory chain node for tests
//!
//! [`MockRpc`] implements [`ChainRpc`] without a network. Tests script its
//! answers (nonce, receipts, code, call output) and inspect every raw
//! transaction it receives, decoded back into nonce, target and calldata.
//! Logs pushed with [`MockRpc::emit`] reach every open subscription.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use alloy::{
    consensus::{Transaction, TxEnvelope},
    eips::eip2718::Decodable2718,
    primitives::{Address, Bytes, B256, U256},
    rpc::types::TransactionRequest,
};
use async_trait::async_trait;
use eyre::{eyre, Result};
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;

use crate::evm::rpc::{ChainRpc, LogStream, RelayLog, TxReceipt};
use crate::hash::keccak256;

/// How the mock answers receipt queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptMode {
    /// Mined with success status on the first poll
    Success,
    /// Mined with failure status on the first poll
    Reverted,
    /// Never mined
    Never,
    /// Mined with success status after this many empty polls
    AfterPolls(u32),
}

/// A transaction the mock received through `send_raw_transaction`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentTransaction {
    pub hash: B256,
    pub nonce: u64,
    pub to: Option<Address>,
    pub value: U256,
    pub gas_limit: u64,
    pub chain_id: Option<u64>,
    pub input: Bytes,
}

struct State {
    base_nonce: u64,
    balance: U256,
    gas_price: u128,
    gas_estimate: u64,
    estimate_error: Option<String>,
    estimate_calls: usize,
    receipt_mode: ReceiptMode,
    polls: HashMap<B256, u32>,
    total_polls: usize,
    codes: HashMap<Address, Bytes>,
    call_result: Bytes,
    call_results: HashMap<[u8; 4], Bytes>,
    calls: Vec<TransactionRequest>,
    created_address: Option<Address>,
    sent: Vec<SentTransaction>,
    block_number: u64,
    subscribers: Vec<mpsc::UnboundedSender<RelayLog>>,
    subscriptions: Vec<Vec<Address>>,
}

/// Scriptable [`ChainRpc`] implementation
pub struct MockRpc {
    chain_id: u64,
    state: Mutex<State>,
}

impl MockRpc {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            state: Mutex::new(State {
                base_nonce: 0,
                balance: U256::ZERO,
                gas_price: 1_000_000_000,
                gas_estimate: 100_000,
                estimate_error: None,
                estimate_calls: 0,
                receipt_mode: ReceiptMode::Success,
                polls: HashMap::new(),
                total_polls: 0,
                codes: HashMap::new(),
                call_result: Bytes::new(),
                call_results: HashMap::new(),
                calls: Vec::new(),
                created_address: None,
                sent: Vec::new(),
                block_number: 1,
                subscribers: Vec::new(),
                subscriptions: Vec::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ========================================================================
    // Scripting
    // ========================================================================

    /// Confirmed nonce of the account; pending nonce adds every received transaction
    pub fn set_nonce(&self, nonce: u64) {
        self.state().base_nonce = nonce;
    }

    pub fn set_balance(&self, balance: U256) {
        self.state().balance = balance;
    }

    pub fn set_gas_estimate(&self, gas: u64) {
        self.state().gas_estimate = gas;
    }

    pub fn fail_estimates(&self, reason: &str) {
        self.state().estimate_error = Some(reason.to_string());
    }

    pub fn set_receipt_mode(&self, mode: ReceiptMode) {
        self.state().receipt_mode = mode;
    }

    pub fn set_code(&self, address: Address, code: Bytes) {
        self.state().codes.insert(address, code);
    }

    /// Output returned by `call` when no selector-specific result matches
    pub fn set_call_result(&self, output: Bytes) {
        self.state().call_result = output;
    }

    pub fn set_call_result_for(&self, selector: [u8; 4], output: Bytes) {
        self.state().call_results.insert(selector, output);
    }

    /// Address reported in receipts of contract-creation transactions.
    /// Unset, each creation gets the low 20 bytes of its transaction hash.
    pub fn set_created_address(&self, address: Address) {
        self.state().created_address = Some(address);
    }

    /// Deliver `log` to every open subscription
    pub fn emit(&self, log: RelayLog) {
        let mut state = self.state();
        state.subscribers.retain(|tx| tx.send(log.clone()).is_ok());
    }

    /// End every open subscription stream
    pub fn close_subscriptions(&self) {
        self.state().subscribers.clear();
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn sent_transactions(&self) -> Vec<SentTransaction> {
        self.state().sent.clone()
    }

    pub fn calls(&self) -> Vec<TransactionRequest> {
        self.state().calls.clone()
    }

    pub fn estimate_calls(&self) -> usize {
        self.state().estimate_calls
    }

    pub fn receipt_polls(&self) -> usize {
        self.state().total_polls
    }

    /// Address lists of every subscription opened so far
    pub fn subscriptions(&self) -> Vec<Vec<Address>> {
        self.state().subscriptions.clone()
    }
}

#[async_trait]
impl ChainRpc for MockRpc {
    async fn chain_id(&self) -> Result<u64> {
        Ok(self.chain_id)
    }

    async fn gas_price(&self) -> Result<u128> {
        Ok(self.state().gas_price)
    }

    async fn estimate_gas(&self, _tx: &TransactionRequest) -> Result<u64> {
        let mut state = self.state();
        state.estimate_calls += 1;
        match &state.estimate_error {
            Some(reason) => Err(eyre!("{}", reason)),
            None => Ok(state.gas_estimate),
        }
    }

    async fn nonce_at(&self, _address: Address) -> Result<u64> {
        let state = self.state();
        Ok(state.base_nonce + state.sent.len() as u64)
    }

    async fn balance_at(&self, _address: Address) -> Result<U256> {
        Ok(self.state().balance)
    }

    async fn code_at(&self, address: Address) -> Result<Bytes> {
        Ok(self.state().codes.get(&address).cloned().unwrap_or_default())
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<B256> {
        let envelope = TxEnvelope::decode_2718(&mut &raw[..])
            .map_err(|e| eyre!("invalid raw transaction: {}", e))?;

        let hash = B256::from(keccak256(raw));
        let sent = SentTransaction {
            hash,
            nonce: envelope.nonce(),
            to: envelope.kind().to().copied(),
            value: envelope.value(),
            gas_limit: envelope.gas_limit(),
            chain_id: envelope.chain_id(),
            input: envelope.input().clone(),
        };

        self.state().sent.push(sent);
        Ok(hash)
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<TxReceipt>> {
        let mut state = self.state();
        state.total_polls += 1;

        let Some(sent) = state.sent.iter().find(|t| t.hash == hash).cloned() else {
            return Ok(None);
        };

        let polls = state.polls.entry(hash).or_insert(0);
        *polls += 1;
        let polls = *polls;

        let status = match state.receipt_mode {
            ReceiptMode::Success => true,
            ReceiptMode::Reverted => false,
            ReceiptMode::Never => return Ok(None),
            ReceiptMode::AfterPolls(n) if polls <= n => return Ok(None),
            ReceiptMode::AfterPolls(_) => true,
        };

        state.block_number += 1;
        Ok(Some(TxReceipt {
            tx_hash: hash,
            status,
            block_number: Some(state.block_number),
            gas_used: sent.gas_limit.min(21_000),
            contract_address: match (sent.to, status) {
                (None, true) => Some(
                    state
                        .created_address
                        .unwrap_or_else(|| Address::from_slice(&hash[12..])),
                ),
                _ => None,
            },
        }))
    }

    async fn call(&self, tx: &TransactionRequest) -> Result<Bytes> {
        let mut state = self.state();
        state.calls.push(tx.clone());

        let input = tx.input.input().cloned().unwrap_or_default();
        if input.len() >= 4 {
            let mut selector = [0u8; 4];
            selector.copy_from_slice(&input[..4]);
            if let Some(output) = state.call_results.get(&selector) {
                return Ok(output.clone());
            }
        }
        Ok(state.call_result.clone())
    }

    async fn subscribe_logs(&self, addresses: Vec<Address>) -> Result<LogStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        state.subscribers.push(tx);
        state.subscriptions.push(addresses);

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|log| (log, rx))
        });
        Ok(stream.boxed())
    }
}

/// A log as a node would deliver it, for handler and dispatch tests
pub fn log_with(address: Address, topics: Vec<B256>, data: Bytes, tx_hash: B256) -> RelayLog {
    RelayLog {
        address,
        topics,
        data,
        tx_hash: Some(tx_hash),
        block_number: Some(1),
        log_index: Some(0),
        removed: false,
    }
}
