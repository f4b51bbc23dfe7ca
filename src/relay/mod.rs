//! Relay handlers
//!
//! Each handler translates one source-chain event into at most one
//! submission on the child bridge. Handlers are methods on [`RelayContext`],
//! which holds the three contract bindings and is shared by every handler
//! task. They keep no state between invocations.
//!
//! ## Handler table
//!
//! | Chain | Contract | Event | Action |
//! |---|---|---|---|
//! | parent | parent bridge | `LogLock` | `partialExecuteOn(_mintmultisigned)` |
//! | child | child bridge | `LogBurn` | `partialExecuteOff(_burnmultisigned)` |
//! | child | child token | `StateChange` | `partialExecuteOff(_statechangemultisigned)` |
//! | child | child bridge | `Log*Multisigned` | log only |
//! | child | child token | `Transfer` | log only |
//! | both | every contract | `Log` | log only |

pub mod protocol;
pub mod retry;

use std::{future::Future, sync::Arc};

use eyre::{Result, WrapErr};
use tracing::{debug, info};

use crate::evm::{
    client::Confirmed,
    contract::ContractBinding,
    events::{BurnEvent, LockEvent, StateChangeEvent, TransferEvent},
    rpc::RelayLog,
    watcher::{event_handler, EventHandler},
};
use crate::hash::RelayTxId;

use protocol::*;
pub use retry::ResubmitPolicy;

/// Shared dependencies of every relay handler
#[derive(Debug)]
pub struct RelayContext {
    pub parent: Arc<ContractBinding>,
    pub child: Arc<ContractBinding>,
    pub token: Arc<ContractBinding>,
    /// Gas limit of relay submissions; 0 estimates
    pub gas_limit: u64,
    pub resubmit: ResubmitPolicy,
}

/// Bind a context method as a dispatch handler
fn bind<F, Fut>(ctx: &Arc<RelayContext>, f: F) -> EventHandler
where
    F: Fn(Arc<RelayContext>, RelayLog) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let ctx = ctx.clone();
    event_handler(move |log| f(ctx.clone(), log))
}

/// Handler that decodes with `contract` and only logs
fn informational(contract: &Arc<ContractBinding>, event: &'static str) -> EventHandler {
    let contract = contract.clone();
    event_handler(move |log| {
        let contract = contract.clone();
        async move { log_event(&contract, event, &log) }
    })
}

fn log_event(contract: &ContractBinding, event: &str, log: &RelayLog) -> Result<()> {
    let decoded = contract.decode_event(event, log)?;
    let fields: Vec<String> = decoded
        .fields
        .iter()
        .map(|(name, value)| format!("{}={:?}", name, value))
        .collect();
    info!(
        contract = %contract.name(),
        event,
        tx_hash = ?log.tx_hash,
        fields = %fields.join(" "),
        "RECV"
    );
    Ok(())
}

/// Register `handler` only if `contract` declares `event`
fn register_if_declared(
    contract: &Arc<ContractBinding>,
    event: &'static str,
    handler: EventHandler,
) -> Result<()> {
    if contract.event(event).is_err() {
        debug!(contract = %contract.name(), event, "Event not declared, skipping registration");
        return Ok(());
    }
    contract.link().register(contract, event, Some(handler))
}

impl RelayContext {
    /// Register the fixed handler table against the owning links.
    ///
    /// Relayed events are mandatory; informational ones are registered when
    /// the contract's ABI declares them.
    pub fn register_handlers(self: &Arc<Self>) -> Result<()> {
        let parent = &self.parent;
        let child = &self.child;
        let token = &self.token;

        parent
            .link()
            .register(parent, EVENT_LOCK, Some(bind(self, Self::handle_lock)))
            .wrap_err("Failed to register lock handler")?;
        child
            .link()
            .register(child, EVENT_BURN, Some(bind(self, Self::handle_burn)))
            .wrap_err("Failed to register burn handler")?;
        token
            .link()
            .register(token, EVENT_STATE_CHANGE, Some(bind(self, Self::handle_state_change)))
            .wrap_err("Failed to register state change handler")?;

        for event in [
            EVENT_BURN_MULTISIGNED,
            EVENT_MINT_MULTISIGNED,
            EVENT_STATE_CHANGE_MULTISIGNED,
        ] {
            register_if_declared(child, event, informational(child, event))?;
        }
        register_if_declared(token, EVENT_TRANSFER, bind(self, Self::handle_transfer))?;
        for contract in [parent, child, token] {
            register_if_declared(contract, EVENT_LOG, informational(contract, EVENT_LOG))?;
        }

        info!(
            parent_registrations = parent.link().registrations().len(),
            child_registrations = child.link().registrations().len(),
            "Relay handlers registered"
        );
        Ok(())
    }

    // ========================================================================
    // Relayed events
    // ========================================================================

    /// Parent `LogLock` becomes an on-chain-authorized mint on the child bridge
    pub async fn handle_lock(self: Arc<Self>, log: RelayLog) -> Result<()> {
        let event = LockEvent::try_from(&self.parent.decode_event(EVENT_LOCK, &log)?)?;
        let txid = RelayTxId::from_log(&log)?;
        info!(
            from = %event.from,
            value = %event.value,
            epoch = %event.epoch,
            txid = %txid,
            "RECV LogLock"
        );

        let call = mint_call(&self.child, &event)?;
        info!(txid = %txid, "SEND partialExecuteOn _mintmultisigned");
        let confirmed = self
            .submit(EVENT_LOCK, || {
                self.child
                    .execute_on(event.epoch, &txid, call.clone(), self.gas_limit)
            })
            .await?;

        info!(
            txid = %txid,
            tx_hash = %confirmed.tx.hash,
            "RCPT partialExecuteOn _mintmultisigned"
        );
        Ok(())
    }

    /// Child `LogBurn` becomes a signed burn release on the child bridge.
    ///
    /// The event's own epoch is only logged; the signature covers
    /// [`OFF_CHAIN_EPOCH`].
    pub async fn handle_burn(self: Arc<Self>, log: RelayLog) -> Result<()> {
        let event = BurnEvent::try_from(&self.child.decode_event(EVENT_BURN, &log)?)?;
        let txid = RelayTxId::from_log(&log)?;
        info!(
            from = %event.from,
            value = %event.value,
            epoch = %event.epoch,
            txid = %txid,
            "RECV LogBurn"
        );

        let call = burn_call(&self.child, &event)?;
        info!(txid = %txid, "SEND partialExecuteOff _burnmultisigned");
        let confirmed = self
            .submit(EVENT_BURN, || {
                self.child
                    .partial_execute_off(OFF_CHAIN_EPOCH, &txid, call.clone(), self.gas_limit)
            })
            .await?;

        info!(
            txid = %txid,
            tx_hash = %confirmed.tx.hash,
            "RCPT partialExecuteOff _burnmultisigned"
        );
        Ok(())
    }

    /// Token `StateChange` becomes a signed state-root commit on the child bridge
    pub async fn handle_state_change(self: Arc<Self>, log: RelayLog) -> Result<()> {
        let decoded = self.token.decode_event(EVENT_STATE_CHANGE, &log)?;
        let event = StateChangeEvent::try_from(&decoded)?;
        let txid = RelayTxId::from_log(&log)?;
        info!(
            block_no = %event.block_no,
            root_state = %event.root_state,
            txid = %txid,
            "RECV StateChange"
        );

        let call = state_change_call(&self.child, &event)?;
        info!(txid = %txid, "SEND partialExecuteOff _statechangemultisigned");
        let confirmed = self
            .submit(EVENT_STATE_CHANGE, || {
                self.child.partial_execute_off(
                    OFF_CHAIN_EPOCH,
                    &txid,
                    call.clone(),
                    self.gas_limit,
                )
            })
            .await?;

        info!(
            txid = %txid,
            tx_hash = %confirmed.tx.hash,
            "RCPT partialExecuteOff _statechangemultisigned"
        );
        Ok(())
    }

    // ========================================================================
    // Informational events
    // ========================================================================

    pub async fn handle_transfer(self: Arc<Self>, log: RelayLog) -> Result<()> {
        let event = TransferEvent::try_from(&self.token.decode_event(EVENT_TRANSFER, &log)?)?;
        info!(from = %event.from, to = %event.to, value = %event.value, "RECV Transfer");
        Ok(())
    }

    async fn submit<F, Fut>(&self, event: &str, submit: F) -> Result<Confirmed>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Confirmed>>,
    {
        retry::with_resubmit(&self.resubmit, event, submit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evm::{
        client::{ChainLink, LinkConfig, NonceLock},
        contract::{ContractArtifact, PARTIAL_EXECUTE_OFF, PARTIAL_EXECUTE_ON},
        signer::{LocalRelaySigner, RelaySigner},
    };
    use crate::hash::{partial_execution_digest, personal_message_digest};
    use crate::testing::{log_with, MockRpc, ReceiptMode};
    use alloy::{
        dyn_abi::{DynSolValue, JsonAbiExt},
        primitives::{Address, Bytes, PrimitiveSignature, B256, U256},
    };
    use std::collections::HashSet;
    use std::time::Duration;

    const PARENT_BRIDGE: &str = include_str!("../../tests/fixtures/ParentBridge.json");
    const CHILD_BRIDGE: &str = include_str!("../../tests/fixtures/ChildBridge.json");
    const CHILD_TOKEN: &str = include_str!("../../tests/fixtures/ChildToken.json");

    const PARENT_ADDR: Address = Address::new([0x0a; 20]);
    const CHILD_ADDR: Address = Address::new([0x0b; 20]);
    const TOKEN_ADDR: Address = Address::new([0x0c; 20]);

    struct Harness {
        parent_rpc: Arc<MockRpc>,
        child_rpc: Arc<MockRpc>,
        signer: Arc<LocalRelaySigner>,
        ctx: Arc<RelayContext>,
    }

    async fn harness(resubmit: ResubmitPolicy) -> Harness {
        let parent_rpc = Arc::new(MockRpc::new(1));
        let child_rpc = Arc::new(MockRpc::new(2));
        let signer = Arc::new(LocalRelaySigner::random());
        let lock = NonceLock::new();
        let config = LinkConfig {
            receipt_timeout: Duration::from_millis(40),
            poll_interval: Duration::from_millis(5),
        };

        let parent_link = Arc::new(ChainLink::new(
            "parent",
            parent_rpc.clone(),
            signer.clone(),
            lock.clone(),
            config,
        ));
        let child_link = Arc::new(ChainLink::new(
            "child",
            child_rpc.clone(),
            signer.clone(),
            lock,
            config,
        ));

        let bind = |json: &str, name: &str, link: &Arc<ChainLink>| {
            Arc::new(ContractBinding::new(
                ContractArtifact::from_json(name, json).unwrap(),
                link.clone(),
            ))
        };
        let parent = bind(PARENT_BRIDGE, "ParentBridge", &parent_link);
        let child = bind(CHILD_BRIDGE, "ChildBridge", &child_link);
        let token = bind(CHILD_TOKEN, "ChildToken", &child_link);
        parent.set_address(PARENT_ADDR, false).await.unwrap();
        child.set_address(CHILD_ADDR, false).await.unwrap();
        token.set_address(TOKEN_ADDR, false).await.unwrap();

        let ctx = Arc::new(RelayContext {
            parent,
            child,
            token,
            gas_limit: 4_000_000,
            resubmit,
        });

        Harness {
            parent_rpc,
            child_rpc,
            signer,
            ctx,
        }
    }

    fn lock_log(ctx: &RelayContext, tx_hash: B256) -> RelayLog {
        let data = DynSolValue::Tuple(vec![
            DynSolValue::Uint(U256::from(3), 256),
            DynSolValue::Address(Address::repeat_byte(0xaa)),
            DynSolValue::Uint(U256::from(1000), 256),
        ])
        .abi_encode_params();
        let topic = ctx.parent.event_topic(EVENT_LOCK).unwrap();
        log_with(PARENT_ADDR, vec![topic], Bytes::from(data), tx_hash)
    }

    fn burn_log(ctx: &RelayContext, tx_hash: B256, value: u64) -> RelayLog {
        let data = DynSolValue::Tuple(vec![
            DynSolValue::Uint(U256::from(4), 256),
            DynSolValue::Address(Address::repeat_byte(0xbb)),
            DynSolValue::Uint(U256::from(value), 256),
        ])
        .abi_encode_params();
        let topic = ctx.child.event_topic(EVENT_BURN).unwrap();
        log_with(CHILD_ADDR, vec![topic], Bytes::from(data), tx_hash)
    }

    /// Recover the signer of a `partialExecuteOff` submission
    fn recover_off_signer(ctx: &RelayContext, input: &[u8]) -> (U256, Bytes, Address) {
        let function = ctx.child.function(PARTIAL_EXECUTE_OFF, 4).unwrap();
        let values = function.abi_decode_input(&input[4..], true).unwrap();

        let epoch = values[0].as_uint().unwrap().0;
        let txid = RelayTxId(B256::from_slice(values[1].as_fixed_bytes().unwrap().0));
        let call = Bytes::from(values[2].as_bytes().unwrap().to_vec());
        let words = values[3].as_fixed_seq().unwrap();
        let v = words[0].as_fixed_bytes().unwrap().0[31];
        let mut rs = Vec::new();
        rs.extend_from_slice(words[1].as_fixed_bytes().unwrap().0);
        rs.extend_from_slice(words[2].as_fixed_bytes().unwrap().0);

        let digest = personal_message_digest(&partial_execution_digest(epoch, &txid, &call));
        let sig = PrimitiveSignature::from_bytes_and_parity(&rs, v == 28);
        let recovered = sig
            .recover_address_from_prehash(&B256::from(digest))
            .unwrap();
        (epoch, call, recovered)
    }

    #[tokio::test]
    async fn test_lock_submits_execute_on_mint() {
        let h = harness(ResubmitPolicy::none()).await;
        let tx_hash = B256::repeat_byte(0x11);
        let log = lock_log(&h.ctx, tx_hash);

        h.ctx.clone().handle_lock(log.clone()).await.unwrap();

        let txid = RelayTxId::compute(&tx_hash, &h.ctx.parent.event_topic(EVENT_LOCK).unwrap());
        let mint = h
            .ctx
            .child
            .encode_call(
                METHOD_MINT_MULTISIGNED,
                &[
                    DynSolValue::Address(Address::repeat_byte(0xaa)),
                    DynSolValue::Uint(U256::from(1000), 256),
                ],
            )
            .unwrap();
        let expected = h
            .ctx
            .child
            .encode_call(
                PARTIAL_EXECUTE_ON,
                &[
                    DynSolValue::Uint(U256::from(3), 256),
                    DynSolValue::FixedBytes(txid.0, 32),
                    DynSolValue::Bytes(mint.to_vec()),
                ],
            )
            .unwrap();

        let sent = h.child_rpc.sent_transactions();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, Some(CHILD_ADDR));
        assert_eq!(sent[0].input, expected);
        assert_eq!(sent[0].gas_limit, 4_000_000);
        assert!(h.parent_rpc.sent_transactions().is_empty());
    }

    #[tokio::test]
    async fn test_lock_relay_is_idempotent() {
        let h = harness(ResubmitPolicy::none()).await;
        let log = lock_log(&h.ctx, B256::repeat_byte(0x11));

        h.ctx.clone().handle_lock(log.clone()).await.unwrap();
        h.ctx.clone().handle_lock(log).await.unwrap();

        let sent = h.child_rpc.sent_transactions();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].input, sent[1].input);
        assert_ne!(sent[0].nonce, sent[1].nonce);
    }

    #[tokio::test]
    async fn test_burn_submits_signed_execute_off() {
        let h = harness(ResubmitPolicy::none()).await;
        let log = burn_log(&h.ctx, B256::repeat_byte(0x21), 10);

        h.ctx.clone().handle_burn(log).await.unwrap();

        let sent = h.child_rpc.sent_transactions();
        assert_eq!(sent.len(), 1);
        let (epoch, call, recovered) = recover_off_signer(&h.ctx, &sent[0].input);
        // LogBurn carries epoch 4; the signed submission still uses epoch 0
        assert_eq!(epoch, OFF_CHAIN_EPOCH);
        assert_eq!(recovered, h.signer.address());

        let expected_call = h
            .ctx
            .child
            .encode_call(
                METHOD_BURN_MULTISIGNED,
                &[
                    DynSolValue::Address(Address::repeat_byte(0xbb)),
                    DynSolValue::Uint(U256::from(10), 256),
                ],
            )
            .unwrap();
        assert_eq!(call, expected_call);
    }

    #[tokio::test]
    async fn test_concurrent_burns_use_distinct_nonces() {
        let h = harness(ResubmitPolicy::none()).await;
        let first = burn_log(&h.ctx, B256::repeat_byte(0x31), 1);
        let second = burn_log(&h.ctx, B256::repeat_byte(0x32), 2);

        let (a, b) = tokio::join!(
            h.ctx.clone().handle_burn(first),
            h.ctx.clone().handle_burn(second)
        );
        a.unwrap();
        b.unwrap();

        let sent = h.child_rpc.sent_transactions();
        assert_eq!(sent.len(), 2);
        let nonces: HashSet<u64> = sent.iter().map(|t| t.nonce).collect();
        assert_eq!(nonces.len(), 2);
        assert_ne!(sent[0].input, sent[1].input);
    }

    #[tokio::test]
    async fn test_state_change_uses_epoch_zero() {
        let h = harness(ResubmitPolicy::none()).await;
        let data = DynSolValue::Tuple(vec![
            DynSolValue::Uint(U256::from(77), 256),
            DynSolValue::FixedBytes(B256::repeat_byte(0xee), 32),
        ])
        .abi_encode_params();
        let topic = h.ctx.token.event_topic(EVENT_STATE_CHANGE).unwrap();
        let log = log_with(TOKEN_ADDR, vec![topic], Bytes::from(data), B256::repeat_byte(0x41));

        h.ctx.clone().handle_state_change(log).await.unwrap();

        let sent = h.child_rpc.sent_transactions();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, Some(CHILD_ADDR));
        let (epoch, call, recovered) = recover_off_signer(&h.ctx, &sent[0].input);
        assert_eq!(epoch, U256::ZERO);
        assert_eq!(recovered, h.signer.address());

        let expected_call = h
            .ctx
            .child
            .encode_call(
                METHOD_STATE_CHANGE_MULTISIGNED,
                &[
                    DynSolValue::Uint(U256::from(77), 256),
                    DynSolValue::FixedBytes(B256::repeat_byte(0xee), 32),
                ],
            )
            .unwrap();
        assert_eq!(call, expected_call);
    }

    #[tokio::test]
    async fn test_timeout_resubmits_same_payload() {
        let policy = ResubmitPolicy {
            max_resubmits: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            backoff_multiplier: 2.0,
        };
        let h = harness(policy).await;
        h.child_rpc.set_receipt_mode(ReceiptMode::Never);

        let log = lock_log(&h.ctx, B256::repeat_byte(0x51));
        let err = h.ctx.clone().handle_lock(log).await.unwrap_err();
        assert!(retry::is_receipt_timeout(&err));

        let sent = h.child_rpc.sent_transactions();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|t| t.input == sent[0].input));
    }

    #[tokio::test]
    async fn test_revert_is_not_resubmitted() {
        let h = harness(ResubmitPolicy::default()).await;
        h.child_rpc.set_receipt_mode(ReceiptMode::Reverted);

        let log = burn_log(&h.ctx, B256::repeat_byte(0x61), 5);
        assert!(h.ctx.clone().handle_burn(log).await.is_err());
        assert_eq!(h.child_rpc.sent_transactions().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_log_is_rejected_without_submission() {
        let h = harness(ResubmitPolicy::none()).await;
        let topic = h.ctx.parent.event_topic(EVENT_LOCK).unwrap();
        let log = log_with(PARENT_ADDR, vec![topic], Bytes::from_static(&[0; 3]), B256::ZERO);

        assert!(h.ctx.clone().handle_lock(log).await.is_err());
        assert!(h.child_rpc.sent_transactions().is_empty());
    }

    #[tokio::test]
    async fn test_register_handlers_table() {
        let h = harness(ResubmitPolicy::none()).await;
        h.ctx.register_handlers().unwrap();

        let parent_events: Vec<String> = h
            .ctx
            .parent
            .link()
            .registrations()
            .into_iter()
            .map(|r| r.event)
            .collect();
        assert_eq!(parent_events, vec![EVENT_LOCK, EVENT_LOG]);

        let child: Vec<(Address, String)> = h
            .ctx
            .child
            .link()
            .registrations()
            .into_iter()
            .map(|r| (r.address, r.event))
            .collect();
        assert!(child.contains(&(CHILD_ADDR, EVENT_BURN.to_string())));
        assert!(child.contains(&(TOKEN_ADDR, EVENT_STATE_CHANGE.to_string())));
        assert!(child.contains(&(CHILD_ADDR, EVENT_MINT_MULTISIGNED.to_string())));
        assert!(child.contains(&(TOKEN_ADDR, EVENT_TRANSFER.to_string())));
        assert!(!child.iter().any(|(a, _)| *a == PARENT_ADDR));
    }
}
