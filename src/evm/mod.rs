//! EVM Chain Support Module
//!
//! Everything that talks to a parent or child chain node.
//!
//! ## Submodules
//!
//! - `rpc` - Chain RPC boundary trait and the alloy-backed implementation
//! - `signer` - Relayer key, transaction signing, validator signature layout
//! - `client` - `ChainLink` transaction engine with the shared nonce lock
//! - `watcher` - Event registration and cancellable log dispatch
//! - `contract` - Runtime-loaded contract artifacts and bindings
//! - `events` - Decoded event payloads

pub mod client;
pub mod contract;
pub mod events;
pub mod rpc;
pub mod signer;
pub mod watcher;

// Re-export commonly used items
pub use client::{ChainLink, Confirmed, LinkConfig, NonceLock, PendingTransaction, SubmitError};
pub use contract::{ContractArtifact, ContractBinding};
pub use events::{BurnEvent, DecodedLog, LockEvent, StateChangeEvent, TransferEvent};
pub use rpc::{AlloyRpc, ChainRpc, RelayLog, TxReceipt};
pub use signer::{LocalRelaySigner, RelaySigner, ValidatorSignature};
pub use watcher::{event_handler, DispatchHandle, EventHandler};
