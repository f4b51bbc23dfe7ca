//! ChainLink: per-chain transaction engine
//!
//! One `ChainLink` exists per chain (parent, child). It pairs an RPC
//! connection with the process-wide signer and a nonce lock shared by every
//! link, and exposes synchronous submission with receipt confirmation,
//! read-only calls and account introspection. Event registration and the
//! dispatch loop live in [`crate::evm::watcher`].
//!
//! ## Submission lifecycle
//!
//! ```text
//! chain id + gas price ─► estimate (gasLimit == 0) ─► [lock: nonce ─► sign ─► broadcast]
//!                                                            │
//!                         confirmed | reverted | timed out ◄─┘ receipt polling (unlocked)
//! ```

use std::{
    collections::HashMap,
    fmt,
    sync::Arc,
    time::Duration,
};

use alloy::{
    network::TransactionBuilder,
    primitives::{Address, Bytes, B256, U256},
    rpc::types::TransactionRequest,
};
use chrono::{DateTime, Utc};
use eyre::{Result, WrapErr};
use thiserror::Error;
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, info, warn};

use crate::evm::{
    rpc::{AlloyRpc, ChainRpc, TxReceipt},
    signer::RelaySigner,
    watcher::EventRegistry,
};
use crate::metrics;

/// Default time to wait for a receipt
pub const DEFAULT_RECEIPT_TIMEOUT: Duration = Duration::from_secs(120);

/// Default interval between receipt polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

// ============================================================================
// Nonce lock
// ============================================================================

/// Process-wide lock held across "read nonce, sign, broadcast".
///
/// Cloning shares the lock. Besides serializing submissions it remembers the
/// next nonce issued per chain id, so several transactions may sit in the
/// node's pool at once without the engine reusing a nonce.
#[derive(Clone, Default)]
pub struct NonceLock {
    next: Arc<Mutex<HashMap<u64, u64>>>,
}

impl NonceLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the locally issued nonce for `chain_id`
    pub async fn reset(&self, chain_id: u64) {
        self.next.lock().await.remove(&chain_id);
    }
}

impl fmt::Debug for NonceLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonceLock").finish_non_exhaustive()
    }
}

// ============================================================================
// Types
// ============================================================================

/// Receipt polling parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkConfig {
    pub receipt_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            receipt_timeout: DEFAULT_RECEIPT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// A broadcast transaction awaiting (or past) confirmation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTransaction {
    pub hash: B256,
    pub nonce: u64,
    pub chain_id: u64,
    /// `None` for contract creation
    pub to: Option<Address>,
    pub value: U256,
    pub gas_limit: u64,
    pub gas_price: u128,
    /// Signed EIP-2718 envelope as broadcast
    pub raw: Bytes,
    pub submitted_at: DateTime<Utc>,
}

/// A transaction mined with success status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmed {
    pub tx: PendingTransaction,
    pub receipt: TxReceipt,
}

/// Failure of [`ChainLink::submit_and_confirm`]
#[derive(Debug, Error)]
pub enum SubmitError {
    /// Chain id, gas price or nonce query failed
    #[error("rpc request failed: {0:#}")]
    Rpc(eyre::Report),

    /// Gas estimation rejected the transaction; nothing was broadcast
    #[error("gas estimation failed: {0:#}")]
    Estimate(eyre::Report),

    #[error("signing failed: {0:#}")]
    Sign(eyre::Report),

    /// The node refused the signed transaction
    #[error("broadcast failed: {0:#}")]
    Broadcast(eyre::Report),

    /// Mined, but execution reverted. Final.
    #[error("transaction {} mined with failure status", tx.hash)]
    ReceiptStatusFailed {
        tx: Box<PendingTransaction>,
        receipt: TxReceipt,
    },

    /// No receipt within the timeout. State unknown; resubmitting under the
    /// same relay id is safe.
    #[error("no receipt for transaction {} after {timeout:?}", tx.hash)]
    ReceiptNotReceived {
        tx: Box<PendingTransaction>,
        timeout: Duration,
    },
}

impl SubmitError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SubmitError::ReceiptNotReceived { .. })
    }

    /// The broadcast transaction, for the confirmation error kinds
    pub fn transaction(&self) -> Option<&PendingTransaction> {
        match self {
            SubmitError::ReceiptStatusFailed { tx, .. }
            | SubmitError::ReceiptNotReceived { tx, .. } => Some(tx),
            _ => None,
        }
    }

    fn outcome_label(&self) -> &'static str {
        match self {
            SubmitError::Rpc(_) => "rpc_error",
            SubmitError::Estimate(_) => "estimate_failed",
            SubmitError::Sign(_) => "sign_failed",
            SubmitError::Broadcast(_) => "broadcast_failed",
            SubmitError::ReceiptStatusFailed { .. } => "reverted",
            SubmitError::ReceiptNotReceived { .. } => "timed_out",
        }
    }
}

// ============================================================================
// ChainLink
// ============================================================================

/// RPC connection, shared signer and shared nonce lock for one chain
pub struct ChainLink {
    name: String,
    rpc: Arc<dyn ChainRpc>,
    signer: Arc<dyn RelaySigner>,
    nonce_lock: NonceLock,
    config: LinkConfig,
    pub(crate) events: EventRegistry,
}

impl fmt::Debug for ChainLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainLink")
            .field("name", &self.name)
            .field("account", &self.signer.address())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ChainLink {
    pub fn new(
        name: impl Into<String>,
        rpc: Arc<dyn ChainRpc>,
        signer: Arc<dyn RelaySigner>,
        nonce_lock: NonceLock,
        config: LinkConfig,
    ) -> Self {
        Self {
            name: name.into(),
            rpc,
            signer,
            nonce_lock,
            config,
            events: EventRegistry::default(),
        }
    }

    /// Connect to a node with the alloy-backed RPC
    pub async fn connect(
        name: &str,
        url: &str,
        signer: Arc<dyn RelaySigner>,
        nonce_lock: NonceLock,
        config: LinkConfig,
    ) -> Result<Self> {
        let rpc = AlloyRpc::connect(url)
            .await
            .wrap_err_with(|| format!("Failed to connect {} chain", name))?;
        Ok(Self::new(name, Arc::new(rpc), signer, nonce_lock, config))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The shared relayer account
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn signer(&self) -> &dyn RelaySigner {
        self.signer.as_ref()
    }

    pub fn rpc(&self) -> &Arc<dyn ChainRpc> {
        &self.rpc
    }

    pub fn config(&self) -> LinkConfig {
        self.config
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub async fn balance(&self) -> Result<U256> {
        self.rpc.balance_at(self.address()).await
    }

    /// `"<address>=<balance> wei"` for startup logging
    pub async fn account_info(&self) -> Result<String> {
        let balance = self
            .balance()
            .await
            .wrap_err_with(|| format!("Failed to read {} account balance", self.name))?;
        Ok(format!("{}={} wei", self.address(), balance))
    }

    /// Deployed bytecode at `address`; empty for accounts without code
    pub async fn code_at(&self, address: Address) -> Result<Bytes> {
        self.rpc.code_at(address).await
    }

    // ========================================================================
    // Read-only calls
    // ========================================================================

    /// Simulated call against the latest state; no nonce, signing or gas
    pub async fn read(&self, to: Address, value: U256, calldata: Bytes) -> Result<Bytes> {
        let request = TransactionRequest::default()
            .with_from(self.address())
            .with_to(to)
            .with_value(value)
            .with_input(calldata);

        self.rpc
            .call(&request)
            .await
            .wrap_err_with(|| format!("Read call to {} on {} failed", to, self.name))
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Sign, broadcast and wait for the receipt of one transaction.
    ///
    /// `to = None` creates a contract with `calldata` as init code. A
    /// `gas_limit` of zero asks the node for an estimate. Only receipt
    /// polling is retried; every other failure surfaces immediately.
    pub async fn submit_and_confirm(
        &self,
        to: Option<Address>,
        value: U256,
        gas_limit: u64,
        calldata: Bytes,
    ) -> Result<Confirmed, SubmitError> {
        let result = self.submit_inner(to, value, gas_limit, calldata).await;

        let outcome = match &result {
            Ok(_) => "confirmed",
            Err(e) => e.outcome_label(),
        };
        metrics::TRANSACTIONS
            .with_label_values(&[self.name.as_str(), outcome])
            .inc();

        result
    }

    async fn submit_inner(
        &self,
        to: Option<Address>,
        value: U256,
        gas_limit: u64,
        calldata: Bytes,
    ) -> Result<Confirmed, SubmitError> {
        let chain_id = self.rpc.chain_id().await.map_err(SubmitError::Rpc)?;
        let gas_price = self.rpc.gas_price().await.map_err(SubmitError::Rpc)?;
        let from = self.address();

        let request = TransactionRequest::default()
            .with_from(from)
            .with_value(value);
        let request = match to {
            Some(to) => request.with_to(to).with_input(calldata),
            None => request.with_deploy_code(calldata),
        };

        let gas_limit = if gas_limit == 0 {
            let estimated = self
                .rpc
                .estimate_gas(&request)
                .await
                .map_err(SubmitError::Estimate)?;
            debug!(chain = %self.name, gas = estimated, "Estimated gas");
            estimated
        } else {
            gas_limit
        };

        let tx = self
            .broadcast_locked(request, chain_id, gas_limit, gas_price)
            .await?;

        info!(
            chain = %self.name,
            tx_hash = %tx.hash,
            nonce = tx.nonce,
            to = ?tx.to,
            "Transaction submitted"
        );

        self.await_receipt(tx).await
    }

    /// Nonce allocation, signing and broadcast under the shared lock
    async fn broadcast_locked(
        &self,
        request: TransactionRequest,
        chain_id: u64,
        gas_limit: u64,
        gas_price: u128,
    ) -> Result<PendingTransaction, SubmitError> {
        let mut issued = self.nonce_lock.next.lock().await;

        let node_nonce = self
            .rpc
            .nonce_at(self.address())
            .await
            .map_err(SubmitError::Rpc)?;
        let nonce = match issued.get(&chain_id) {
            Some(&next) => next.max(node_nonce),
            None => node_nonce,
        };

        let to = request.to.and_then(|kind| kind.to().copied());
        let value = request.value.unwrap_or_default();
        let request = request
            .with_nonce(nonce)
            .with_chain_id(chain_id)
            .with_gas_limit(gas_limit)
            .with_gas_price(gas_price);

        let signed = self
            .signer
            .sign_transaction(request)
            .await
            .map_err(SubmitError::Sign)?;

        let hash = self
            .rpc
            .send_raw_transaction(&signed.raw)
            .await
            .map_err(SubmitError::Broadcast)?;
        if hash != signed.hash {
            warn!(
                chain = %self.name,
                local = %signed.hash,
                node = %hash,
                "Node returned a different transaction hash"
            );
        }

        issued.insert(chain_id, nonce + 1);

        Ok(PendingTransaction {
            hash,
            nonce,
            chain_id,
            to,
            value,
            gas_limit,
            gas_price,
            raw: signed.raw,
            submitted_at: Utc::now(),
        })
    }

    /// Poll for the receipt until it appears or the timeout elapses
    async fn await_receipt(&self, tx: PendingTransaction) -> Result<Confirmed, SubmitError> {
        let started = Instant::now();
        let deadline = started + self.config.receipt_timeout;

        loop {
            match self.rpc.transaction_receipt(tx.hash).await {
                Ok(Some(receipt)) => {
                    metrics::CONFIRMATION_LATENCY
                        .with_label_values(&[self.name.as_str()])
                        .observe(started.elapsed().as_secs_f64());

                    if receipt.status {
                        info!(
                            chain = %self.name,
                            tx_hash = %tx.hash,
                            block = ?receipt.block_number,
                            gas_used = receipt.gas_used,
                            "Transaction confirmed"
                        );
                        return Ok(Confirmed { tx, receipt });
                    }

                    warn!(
                        chain = %self.name,
                        tx_hash = %tx.hash,
                        block = ?receipt.block_number,
                        "Transaction reverted"
                    );
                    return Err(SubmitError::ReceiptStatusFailed {
                        tx: Box::new(tx),
                        receipt,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(
                        chain = %self.name,
                        tx_hash = %tx.hash,
                        error = %e,
                        "Receipt poll failed"
                    );
                }
            }

            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }

        warn!(
            chain = %self.name,
            tx_hash = %tx.hash,
            nonce = tx.nonce,
            timeout = ?self.config.receipt_timeout,
            "No receipt within timeout"
        );

        // The node may have dropped it; resynchronise on the next submission
        self.nonce_lock.reset(tx.chain_id).await;

        Err(SubmitError::ReceiptNotReceived {
            tx: Box::new(tx),
            timeout: self.config.receipt_timeout,
        })
    }
}
