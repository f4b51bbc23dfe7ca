//! Bridge protocol names and counter-call encoding
//!
//! | Source event | Counter call on the child bridge | Shape |
//! |---|---|---|
//! | `LogLock` | `_mintmultisigned(from, value)` | `partialExecuteOn(epoch, ..)` |
//! | `LogBurn` | `_burnmultisigned(from, value)` | `partialExecuteOff(0, ..)` |
//! | `StateChange` | `_statechangemultisigned(blockNo, rootState)` | `partialExecuteOff(0, ..)` |

use alloy::{
    dyn_abi::DynSolValue,
    primitives::{Bytes, U256},
};
use eyre::Result;

use crate::evm::{
    contract::ContractBinding,
    events::{BurnEvent, LockEvent, StateChangeEvent},
};

// Relayed events
pub const EVENT_LOCK: &str = "LogLock";
pub const EVENT_BURN: &str = "LogBurn";
pub const EVENT_STATE_CHANGE: &str = "StateChange";

// Informational events
pub const EVENT_BURN_MULTISIGNED: &str = "LogBurnMultisigned";
pub const EVENT_MINT_MULTISIGNED: &str = "LogMintMultisigned";
pub const EVENT_STATE_CHANGE_MULTISIGNED: &str = "LogStateChangeMultisigned";
pub const EVENT_TRANSFER: &str = "Transfer";
pub const EVENT_LOG: &str = "Log";

// Counter calls, executed by the child bridge once a quorum signs
pub const METHOD_MINT_MULTISIGNED: &str = "_mintmultisigned";
pub const METHOD_BURN_MULTISIGNED: &str = "_burnmultisigned";
pub const METHOD_STATE_CHANGE_MULTISIGNED: &str = "_statechangemultisigned";

// User and deployment entry points
pub const METHOD_LOCK: &str = "lock";
pub const METHOD_BURN: &str = "burn";
pub const METHOD_INIT: &str = "init";
pub const METHOD_TOKEN: &str = "weth";

/// Epoch signed into every `partialExecuteOff` submission
pub const OFF_CHAIN_EPOCH: U256 = U256::ZERO;

/// `_mintmultisigned(from, value)` for a parent-chain lock
pub fn mint_call(child: &ContractBinding, event: &LockEvent) -> Result<Bytes> {
    child.encode_call(
        METHOD_MINT_MULTISIGNED,
        &[
            DynSolValue::Address(event.from),
            DynSolValue::Uint(event.value, 256),
        ],
    )
}

/// `_burnmultisigned(from, value)` for a child-chain burn
pub fn burn_call(child: &ContractBinding, event: &BurnEvent) -> Result<Bytes> {
    child.encode_call(
        METHOD_BURN_MULTISIGNED,
        &[
            DynSolValue::Address(event.from),
            DynSolValue::Uint(event.value, 256),
        ],
    )
}

/// `_statechangemultisigned(blockNo, rootState)` for a token state commit
pub fn state_change_call(child: &ContractBinding, event: &StateChangeEvent) -> Result<Bytes> {
    child.encode_call(
        METHOD_STATE_CHANGE_MULTISIGNED,
        &[
            DynSolValue::Uint(event.block_no, 256),
            DynSolValue::FixedBytes(event.root_state, 32),
        ],
    )
}
