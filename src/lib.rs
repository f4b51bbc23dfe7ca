//! Bridge Relayer: parent/child chain relay engine
//!
//! Observes lock, burn and state-change events on a parent and a child EVM
//! chain and submits each one as this validator's partial execution to the
//! child bridge multisig.
//!
//! - **EVM Module** - RPC boundary, signer, transaction engine, event dispatch, contract bindings
//! - **Relay Module** - Event to counter-call mapping and the handler table
//! - **Bridge** - Orchestrator wiring both chains together
//! - **Hash** - Relay id derivation and signature digests
//!
//! ## Feature Flags
//!
//! - `testing` - Expose the in-memory `MockRpc` chain node

pub mod bridge;
pub mod config;
pub mod evm;
pub mod hash;
pub mod metrics;
pub mod redact;
pub mod relay;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used items at the crate root
pub use bridge::{Bridge, BridgeArtifacts, DeployedAddresses};
pub use config::Config;
pub use evm::{
    ChainLink, ChainRpc, ContractArtifact, ContractBinding, LocalRelaySigner, NonceLock,
    RelayLog, RelaySigner, SubmitError,
};
pub use hash::{keccak256, RelayTxId};
pub use relay::{RelayContext, ResubmitPolicy};
