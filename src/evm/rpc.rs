//! Chain RPC boundary
//!
//! The transaction engine and the dispatcher only talk to a node through
//! [`ChainRpc`]. [`AlloyRpc`] is the production implementation (WebSocket,
//! HTTP or IPC picked from the URL scheme); tests use `testing::MockRpc`.

use alloy::{
    primitives::{Address, Bytes, B256, U256},
    providers::{Provider, ProviderBuilder, RootProvider},
    rpc::types::{Filter, Log, TransactionReceipt, TransactionRequest},
    transports::BoxTransport,
};
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use futures::stream::{BoxStream, StreamExt};
use tracing::info;

/// A log record as delivered by a node subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayLog {
    /// Emitting contract
    pub address: Address,
    /// Ordered topics; topic[0] is the event signature hash
    pub topics: Vec<B256>,
    /// ABI-encoded non-indexed fields
    pub data: Bytes,
    /// Source transaction hash
    pub tx_hash: Option<B256>,
    pub block_number: Option<u64>,
    pub log_index: Option<u64>,
    /// Set when a reorg retracts a previously delivered log
    pub removed: bool,
}

impl RelayLog {
    pub fn topic0(&self) -> Option<B256> {
        self.topics.first().copied()
    }
}

impl From<Log> for RelayLog {
    fn from(log: Log) -> Self {
        Self {
            address: log.address(),
            topics: log.topics().to_vec(),
            data: log.data().data.clone(),
            tx_hash: log.transaction_hash,
            block_number: log.block_number,
            log_index: log.log_index,
            removed: log.removed,
        }
    }
}

/// The subset of a transaction receipt the relayer inspects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: B256,
    /// `true` when execution succeeded
    pub status: bool,
    pub block_number: Option<u64>,
    pub gas_used: u64,
    /// Set for contract-creation transactions
    pub contract_address: Option<Address>,
}

impl From<TransactionReceipt> for TxReceipt {
    fn from(receipt: TransactionReceipt) -> Self {
        Self {
            tx_hash: receipt.transaction_hash,
            status: receipt.status(),
            block_number: receipt.block_number,
            gas_used: receipt.gas_used as u64,
            contract_address: receipt.contract_address,
        }
    }
}

/// Stream of logs produced by a subscription
pub type LogStream = BoxStream<'static, RelayLog>;

/// JSON-RPC surface consumed by a `ChainLink`
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Chain id used for replay-protected signing
    async fn chain_id(&self) -> Result<u64>;

    /// Node-suggested legacy gas price
    async fn gas_price(&self) -> Result<u128>;

    /// Simulate `tx` and return the gas it would use
    async fn estimate_gas(&self, tx: &TransactionRequest) -> Result<u64>;

    /// Next nonce for `address`, including transactions in the node's pool
    async fn nonce_at(&self, address: Address) -> Result<u64>;

    async fn balance_at(&self, address: Address) -> Result<U256>;

    async fn code_at(&self, address: Address) -> Result<Bytes>;

    /// Broadcast a signed EIP-2718 transaction and return its hash
    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<B256>;

    /// Receipt for `hash`, `None` while the transaction is not mined
    async fn transaction_receipt(&self, hash: B256) -> Result<Option<TxReceipt>>;

    /// Read-only call against the latest state
    async fn call(&self, tx: &TransactionRequest) -> Result<Bytes>;

    /// Subscribe to logs emitted by any of `addresses`, with no topic filter
    async fn subscribe_logs(&self, addresses: Vec<Address>) -> Result<LogStream>;
}

/// [`ChainRpc`] backed by an alloy provider
pub struct AlloyRpc {
    provider: RootProvider<BoxTransport>,
}

impl AlloyRpc {
    /// Connect to a node; ws://, http:// and ipc paths are all accepted
    pub async fn connect(url: &str) -> Result<Self> {
        let provider = ProviderBuilder::new()
            .on_builtin(url)
            .await
            .map_err(|e| eyre!("Failed to connect to {}: {}", url, e))?;

        info!(rpc_url = %url, "Connected to chain node");

        Ok(Self { provider })
    }
}

#[async_trait]
impl ChainRpc for AlloyRpc {
    async fn chain_id(&self) -> Result<u64> {
        let chain_id = self
            .provider
            .get_chain_id()
            .await
            .wrap_err("Failed to get chain id")?;
        Ok(chain_id)
    }

    async fn gas_price(&self) -> Result<u128> {
        let price = self
            .provider
            .get_gas_price()
            .await
            .wrap_err("Failed to get gas price")?;
        Ok(price)
    }

    async fn estimate_gas(&self, tx: &TransactionRequest) -> Result<u64> {
        let gas = self
            .provider
            .estimate_gas(tx)
            .await
            .wrap_err("Failed to estimate gas")?;
        Ok(gas)
    }

    async fn nonce_at(&self, address: Address) -> Result<u64> {
        let nonce = self
            .provider
            .get_transaction_count(address)
            .pending()
            .await
            .wrap_err("Failed to get account nonce")?;
        Ok(nonce)
    }

    async fn balance_at(&self, address: Address) -> Result<U256> {
        let balance = self
            .provider
            .get_balance(address)
            .await
            .wrap_err("Failed to get balance")?;
        Ok(balance)
    }

    async fn code_at(&self, address: Address) -> Result<Bytes> {
        let code = self
            .provider
            .get_code_at(address)
            .await
            .wrap_err("Failed to get code")?;
        Ok(code)
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<B256> {
        let pending = self
            .provider
            .send_raw_transaction(raw)
            .await
            .wrap_err("Failed to send transaction")?;
        Ok(*pending.tx_hash())
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<TxReceipt>> {
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .wrap_err("Failed to get transaction receipt")?;
        Ok(receipt.map(TxReceipt::from))
    }

    async fn call(&self, tx: &TransactionRequest) -> Result<Bytes> {
        let output = self
            .provider
            .call(tx)
            .await
            .wrap_err("Failed to call contract")?;
        Ok(output)
    }

    async fn subscribe_logs(&self, addresses: Vec<Address>) -> Result<LogStream> {
        // Routing on topic0 happens in-process, the node only filters by emitter
        let filter = Filter::new().address(addresses);

        let subscription = self
            .provider
            .subscribe_logs(&filter)
            .await
            .wrap_err("Failed to subscribe to logs")?;

        Ok(subscription.into_stream().map(RelayLog::from).boxed())
    }
}
