//! Event subscription and dispatch
//!
//! Handlers are registered per (contract address, event name) against a
//! [`ChainLink`]. Starting dispatch opens one log subscription covering every
//! registered address, with no topic filter, and routes each log in-process
//! on `(address, topic0)`.
//!
//! ## Dispatch rules
//!
//! - Logs flagged `removed` (reorg retraction) are dropped
//! - The first registration for an `(address, topic0)` pair wins
//! - Every matched handler runs in its own task; errors are logged, never propagated
//! - Unmatched logs are debug-logged and ignored
//!
//! ## Cancellation
//!
//! [`DispatchHandle::stop`] sends a stop signal and waits for the loop to
//! acknowledge on a second channel. No log is routed after the acknowledgement;
//! handler tasks already spawned keep running.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{Arc, RwLock},
};

use alloy::primitives::{Address, B256};
use eyre::{eyre, Result, WrapErr};
use futures::{future::BoxFuture, StreamExt};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::evm::{client::ChainLink, contract::ContractBinding, rpc::LogStream, rpc::RelayLog};
use crate::metrics;

/// Async callback invoked with a matched log
pub type EventHandler = Arc<dyn Fn(RelayLog) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Box an async closure as an [`EventHandler`]
pub fn event_handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(RelayLog) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |log| Box::pin(f(log)))
}

/// One (contract, event) registration
#[derive(Clone)]
pub struct Registration {
    pub address: Address,
    pub contract: String,
    pub event: String,
    /// Canonical signature, e.g. `LogLock(uint256,address,uint256)`
    pub signature: String,
    /// Derived once from the ABI at registration time
    pub topic: B256,
    handler: Option<EventHandler>,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("address", &self.address)
            .field("contract", &self.contract)
            .field("event", &self.event)
            .field("topic", &self.topic)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

/// Registrations of one ChainLink, in registration order
#[derive(Default)]
pub(crate) struct EventRegistry {
    registrations: RwLock<Vec<Registration>>,
}

impl EventRegistry {
    fn push(&self, registration: Registration) {
        self.registrations
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(registration);
    }

    fn snapshot(&self) -> Vec<Registration> {
        self.registrations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Distinct addresses in first-seen order
fn unique_addresses(registrations: &[Registration]) -> Vec<Address> {
    let mut addresses: Vec<Address> = Vec::new();
    for registration in registrations {
        if !addresses.contains(&registration.address) {
            addresses.push(registration.address);
        }
    }
    addresses
}

/// `(address, topic0)` lookup built when dispatch starts
#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: HashMap<(Address, B256), Registration>,
}

impl RoutingTable {
    pub fn new(registrations: &[Registration]) -> Self {
        let mut routes = HashMap::with_capacity(registrations.len());
        for registration in registrations {
            let key = (registration.address, registration.topic);
            if routes.contains_key(&key) {
                warn!(
                    address = %registration.address,
                    event = %registration.event,
                    "Duplicate event registration, first one wins"
                );
                continue;
            }
            routes.insert(key, registration.clone());
        }
        Self { routes }
    }

    /// Registration for a log, `None` for unmatched or topic-less logs
    pub fn route(&self, log: &RelayLog) -> Option<&Registration> {
        let topic = log.topic0()?;
        self.routes.get(&(log.address, topic))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Handle to a running dispatch loop
pub struct DispatchHandle {
    chain: String,
    stop_tx: Option<oneshot::Sender<()>>,
    done_rx: oneshot::Receiver<()>,
    task: JoinHandle<Result<()>>,
}

impl DispatchHandle {
    /// Stop the loop and wait for its acknowledgement.
    ///
    /// Returns the loop's error if it had already ended on its own.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if self.done_rx.await.is_ok() {
            info!(chain = %self.chain, "Event dispatch stopped");
        }

        self.task
            .await
            .wrap_err_with(|| format!("{} dispatch task panicked", self.chain))?
    }

    /// Resolves once the loop has ended on its own; cancel-safe, so it can
    /// race a shutdown signal. Do not call `stop` after it resolves.
    pub async fn finished(&mut self) -> Result<()> {
        (&mut self.task)
            .await
            .wrap_err_with(|| format!("{} dispatch task panicked", self.chain))?
    }

    /// Wait until the loop ends on its own (subscription closed)
    pub async fn wait(self) -> Result<()> {
        let DispatchHandle {
            chain,
            stop_tx,
            task,
            ..
        } = self;
        // Dropping the sender would read as a stop request
        let _stop_tx = stop_tx;
        task.await
            .wrap_err_with(|| format!("{} dispatch task panicked", chain))?
    }
}

impl ChainLink {
    // ========================================================================
    // Registration
    // ========================================================================

    /// Register `handler` for `event` emitted by `contract`.
    ///
    /// Fails when the event is not in the contract's ABI, the contract has no
    /// address yet, or the contract belongs to another link. A registration
    /// without handler only logs matching events.
    pub fn register(
        &self,
        contract: &ContractBinding,
        event: &str,
        handler: Option<EventHandler>,
    ) -> Result<()> {
        if !std::ptr::eq(Arc::as_ptr(contract.link()), self) {
            return Err(eyre!(
                "Contract {} is not bound to the {} chain",
                contract.name(),
                self.name()
            ));
        }

        let address = contract.address()?;
        let abi_event = contract.event(event)?;
        let registration = Registration {
            address,
            contract: contract.name().to_string(),
            event: event.to_string(),
            signature: abi_event.signature(),
            topic: abi_event.selector(),
            handler,
        };

        debug!(
            chain = %self.name(),
            contract = %registration.contract,
            address = %address,
            event = %registration.signature,
            topic = %registration.topic,
            "Registered event handler"
        );

        self.events.push(registration);
        Ok(())
    }

    /// Registrations in order
    pub fn registrations(&self) -> Vec<Registration> {
        self.events.snapshot()
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Subscribe and start routing logs in a background task
    pub async fn start_dispatch(&self) -> Result<DispatchHandle> {
        let registrations = self.events.snapshot();
        if registrations.is_empty() {
            return Err(eyre!("No event handlers registered on {}", self.name()));
        }

        let addresses = unique_addresses(&registrations);
        let routes = RoutingTable::new(&registrations);

        let stream = self
            .rpc()
            .subscribe_logs(addresses.clone())
            .await
            .wrap_err_with(|| format!("Failed to subscribe to {} logs", self.name()))?;

        info!(
            chain = %self.name(),
            addresses = addresses.len(),
            routes = routes.len(),
            "Event dispatch started"
        );

        let (stop_tx, stop_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        let chain = self.name().to_string();
        let task = tokio::spawn(run_dispatch(chain.clone(), routes, stream, stop_rx, done_tx));

        Ok(DispatchHandle {
            chain,
            stop_tx: Some(stop_tx),
            done_rx,
            task,
        })
    }

    /// Dispatch until the subscription ends; never returns `Ok` in normal operation
    pub async fn dispatch_forever(&self) -> Result<()> {
        self.start_dispatch().await?.wait().await
    }
}

async fn run_dispatch(
    chain: String,
    routes: RoutingTable,
    mut stream: LogStream,
    mut stop_rx: oneshot::Receiver<()>,
    done_tx: oneshot::Sender<()>,
) -> Result<()> {
    loop {
        tokio::select! {
            biased;

            _ = &mut stop_rx => {
                let _ = done_tx.send(());
                return Ok(());
            }

            next = stream.next() => match next {
                Some(log) => dispatch_log(&chain, &routes, log),
                None => {
                    error!(chain = %chain, "Log subscription closed");
                    return Err(eyre!("{} log subscription closed", chain));
                }
            }
        }
    }
}

fn dispatch_log(chain: &str, routes: &RoutingTable, log: RelayLog) {
    metrics::LOGS_RECEIVED.with_label_values(&[chain]).inc();

    if log.removed {
        debug!(
            chain = %chain,
            address = %log.address,
            tx_hash = ?log.tx_hash,
            "Dropping removed log"
        );
        metrics::LOGS_DROPPED
            .with_label_values(&[chain, "removed"])
            .inc();
        return;
    }

    let Some(registration) = routes.route(&log) else {
        debug!(chain = %chain, address = %log.address, topic0 = ?log.topic0(), "Unmatched log");
        metrics::LOGS_DROPPED
            .with_label_values(&[chain, "unmatched"])
            .inc();
        return;
    };

    metrics::LOGS_DISPATCHED
        .with_label_values(&[chain, registration.event.as_str()])
        .inc();

    let Some(handler) = registration.handler.clone() else {
        info!(chain = %chain, event = %registration.signature, tx_hash = ?log.tx_hash, "RECV");
        return;
    };

    let chain = chain.to_string();
    let event = registration.event.clone();
    tokio::spawn(async move {
        let tx_hash = log.tx_hash;
        if let Err(e) = handler(log).await {
            error!(
                chain = %chain,
                event = %event,
                tx_hash = ?tx_hash,
                error = ?e,
                "Event handler failed"
            );
            metrics::HANDLER_FAILURES
                .with_label_values(&[chain.as_str(), event.as_str()])
                .inc();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evm::client::{LinkConfig, NonceLock};
    use crate::evm::contract::ContractArtifact;
    use crate::evm::signer::LocalRelaySigner;
    use crate::testing::{log_with, MockRpc};
    use alloy::primitives::Bytes;
    use std::time::Duration;
    use tokio::sync::{mpsc, Notify};

    const ARTIFACT: &str = r#"{
        "abi": [
            {"type":"event","name":"Ping","anonymous":false,
             "inputs":[{"name":"n","type":"uint256","indexed":false}]},
            {"type":"event","name":"Pong","anonymous":false,
             "inputs":[{"name":"n","type":"uint256","indexed":false}]}
        ],
        "bytecode": "0x"
    }"#;

    async fn setup() -> (Arc<MockRpc>, Arc<ChainLink>, ContractBinding) {
        let rpc = Arc::new(MockRpc::new(1));
        let link = Arc::new(ChainLink::new(
            "test",
            rpc.clone(),
            Arc::new(LocalRelaySigner::random()),
            NonceLock::new(),
            LinkConfig::default(),
        ));
        let artifact = ContractArtifact::from_json("Pinger", ARTIFACT).unwrap();
        let contract = ContractBinding::new(artifact, link.clone());
        contract
            .set_address(Address::repeat_byte(0xaa), false)
            .await
            .unwrap();
        (rpc, link, contract)
    }

    /// Log from the test contract with the given topic, tagged by tx hash
    fn ping(topic: B256, tx: u8) -> RelayLog {
        log_with(Address::repeat_byte(0xaa), vec![topic], Bytes::new(), B256::repeat_byte(tx))
    }

    fn channel_handler(tx: mpsc::UnboundedSender<RelayLog>) -> EventHandler {
        event_handler(move |log| {
            let tx = tx.clone();
            async move {
                tx.send(log).map_err(|e| eyre!("send: {}", e))?;
                Ok(())
            }
        })
    }

    async fn wait_for_subscription(rpc: &MockRpc) {
        for _ in 0..100 {
            if !rpc.subscriptions().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn test_register_unknown_event_fails() {
        let (_rpc, link, contract) = setup().await;
        let err = link.register(&contract, "Missing", None).unwrap_err();
        assert!(err.to_string().contains("Missing"));
    }

    #[tokio::test]
    async fn test_register_requires_matching_link() {
        let (_rpc, _link, contract) = setup().await;
        let other = ChainLink::new(
            "other",
            Arc::new(MockRpc::new(2)),
            Arc::new(LocalRelaySigner::random()),
            NonceLock::new(),
            LinkConfig::default(),
        );
        assert!(other.register(&contract, "Ping", None).is_err());
    }

    #[tokio::test]
    async fn test_start_dispatch_without_registrations_fails() {
        let (_rpc, link, _contract) = setup().await;
        assert!(link.start_dispatch().await.is_err());
    }

    #[tokio::test]
    async fn test_subscription_covers_unique_addresses() {
        let (rpc, link, contract) = setup().await;
        link.register(&contract, "Ping", None).unwrap();
        link.register(&contract, "Pong", None).unwrap();

        let handle = link.start_dispatch().await.unwrap();
        assert_eq!(rpc.subscriptions(), vec![vec![Address::repeat_byte(0xaa)]]);
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_routes_by_address_and_topic() {
        let (rpc, link, contract) = setup().await;
        let (ping_tx, mut ping_rx) = mpsc::unbounded_channel();
        let (pong_tx, mut pong_rx) = mpsc::unbounded_channel();
        link.register(&contract, "Ping", Some(channel_handler(ping_tx)))
            .unwrap();
        link.register(&contract, "Pong", Some(channel_handler(pong_tx)))
            .unwrap();

        let handle = link.start_dispatch().await.unwrap();
        wait_for_subscription(&rpc).await;

        let ping_topic = contract.event_topic("Ping").unwrap();
        let pong_topic = contract.event_topic("Pong").unwrap();
        let address = Address::repeat_byte(0xaa);

        // Wrong address, right topic: ignored
        rpc.emit(log_with(Address::repeat_byte(0xbb), vec![ping_topic], Bytes::new(), B256::ZERO));
        // Removed: ignored
        let mut removed = log_with(address, vec![ping_topic], Bytes::new(), B256::repeat_byte(1));
        removed.removed = true;
        rpc.emit(removed);
        // Delivered
        rpc.emit(log_with(address, vec![pong_topic], Bytes::new(), B256::repeat_byte(2)));
        rpc.emit(log_with(address, vec![ping_topic], Bytes::new(), B256::repeat_byte(3)));

        let pong = tokio::time::timeout(Duration::from_secs(1), pong_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pong.tx_hash, Some(B256::repeat_byte(2)));

        let ping = tokio::time::timeout(Duration::from_secs(1), ping_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ping.tx_hash, Some(B256::repeat_byte(3)));

        handle.stop().await.unwrap();
        assert!(ping_rx.try_recv().is_err());
        assert!(pong_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_first_registration_wins() {
        let (rpc, link, contract) = setup().await;
        let (first_tx, mut first_rx) = mpsc::unbounded_channel();
        let (second_tx, mut second_rx) = mpsc::unbounded_channel();
        link.register(&contract, "Ping", Some(channel_handler(first_tx)))
            .unwrap();
        link.register(&contract, "Ping", Some(channel_handler(second_tx)))
            .unwrap();

        let handle = link.start_dispatch().await.unwrap();
        let topic = contract.event_topic("Ping").unwrap();
        rpc.emit(ping(topic, 0));

        let got = tokio::time::timeout(Duration::from_secs(1), first_rx.recv()).await;
        assert!(got.unwrap().is_some());
        handle.stop().await.unwrap();
        assert!(second_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handler_error_does_not_stop_dispatch() {
        let (rpc, link, contract) = setup().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let failing = event_handler(move |log: RelayLog| {
            let tx = tx.clone();
            async move {
                tx.send(log.tx_hash).map_err(|e| eyre!("send: {}", e))?;
                Err(eyre!("handler failure"))
            }
        });
        link.register(&contract, "Ping", Some(failing)).unwrap();

        let handle = link.start_dispatch().await.unwrap();
        let topic = contract.event_topic("Ping").unwrap();
        for i in 1..=3u8 {
            rpc.emit(ping(topic, i));
        }

        for _ in 0..3 {
            let got = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
            assert!(got.unwrap().is_some());
        }
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_slow_handler_does_not_block_dispatch() {
        let (rpc, link, contract) = setup().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = event_handler(move |log: RelayLog| {
            let tx = tx.clone();
            async move {
                if log.tx_hash == Some(B256::repeat_byte(1)) {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
                tx.send(log.tx_hash).map_err(|e| eyre!("send: {}", e))?;
                Ok(())
            }
        });
        link.register(&contract, "Ping", Some(handler)).unwrap();

        let handle = link.start_dispatch().await.unwrap();
        let topic = contract.event_topic("Ping").unwrap();
        rpc.emit(ping(topic, 1));
        rpc.emit(ping(topic, 2));

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(got, Some(Some(B256::repeat_byte(2))));
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_log_processed_after_stop() {
        let (rpc, link, contract) = setup().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        link.register(&contract, "Ping", Some(channel_handler(tx)))
            .unwrap();

        let handle = link.start_dispatch().await.unwrap();
        handle.stop().await.unwrap();

        let topic = contract.event_topic("Ping").unwrap();
        rpc.emit(ping(topic, 0));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_in_flight_handler_completes_after_stop() {
        let (rpc, link, contract) = setup().await;
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let release = Arc::new(Notify::new());
        let gate = release.clone();
        let handler = event_handler(move |log: RelayLog| {
            let started_tx = started_tx.clone();
            let done_tx = done_tx.clone();
            let gate = gate.clone();
            async move {
                started_tx.send(()).map_err(|e| eyre!("send: {}", e))?;
                gate.notified().await;
                done_tx.send(log.tx_hash).map_err(|e| eyre!("send: {}", e))?;
                Ok(())
            }
        });
        link.register(&contract, "Ping", Some(handler)).unwrap();

        let handle = link.start_dispatch().await.unwrap();
        wait_for_subscription(&rpc).await;
        let topic = contract.event_topic("Ping").unwrap();
        rpc.emit(ping(topic, 7));

        let started = tokio::time::timeout(Duration::from_secs(1), started_rx.recv()).await;
        assert!(started.unwrap().is_some());

        // Stop is acknowledged while the handler is still parked
        handle.stop().await.unwrap();
        assert!(done_rx.try_recv().is_err());

        release.notify_one();
        let done = tokio::time::timeout(Duration::from_secs(1), done_rx.recv())
            .await
            .unwrap();
        assert_eq!(done, Some(Some(B256::repeat_byte(7))));
    }

    #[tokio::test]
    async fn test_closed_subscription_ends_dispatch_with_error() {
        let (rpc, link, contract) = setup().await;
        link.register(&contract, "Ping", None).unwrap();

        let handle = link.start_dispatch().await.unwrap();
        rpc.close_subscriptions();
        let result = tokio::time::timeout(Duration::from_secs(1), handle.wait())
            .await
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_finished_races_shutdown() {
        let (rpc, link, contract) = setup().await;
        link.register(&contract, "Ping", None).unwrap();
        let mut handle = link.start_dispatch().await.unwrap();

        let pending = tokio::time::timeout(Duration::from_millis(20), handle.finished()).await;
        assert!(pending.is_err());

        rpc.close_subscriptions();
        let result = tokio::time::timeout(Duration::from_secs(1), handle.finished())
            .await
            .unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn test_routing_table_ignores_topicless_logs() {
        let table = RoutingTable::default();
        let log = log_with(Address::ZERO, vec![], Bytes::new(), B256::ZERO);
        assert!(table.route(&log).is_none());
        assert!(table.is_empty());
    }
}
