//! Decoded bridge events
//!
//! [`DecodedLog`] holds an event's fields in declaration order with indexed
//! and data fields merged. The typed payloads below read fields by position
//! so ABIs that name them differently (`src`/`dst`/`wad` vs `from`/`to`/`value`)
//! decode the same way.

use alloy::{
    dyn_abi::DynSolValue,
    primitives::{Address, B256, U256},
};
use eyre::{eyre, Result};

/// Event fields in declaration order
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedLog {
    pub event: String,
    pub fields: Vec<(String, DynSolValue)>,
}

impl DecodedLog {
    pub fn new(event: &str, fields: Vec<(String, DynSolValue)>) -> Self {
        Self {
            event: event.to_string(),
            fields,
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn value(&self, index: usize) -> Result<&DynSolValue> {
        self.fields
            .get(index)
            .map(|(_, v)| v)
            .ok_or_else(|| eyre!("{} has no field at position {}", self.event, index))
    }

    pub fn uint(&self, index: usize) -> Result<U256> {
        self.value(index)?
            .as_uint()
            .map(|(v, _)| v)
            .ok_or_else(|| eyre!("{} field {} is not an unsigned integer", self.event, index))
    }

    pub fn address(&self, index: usize) -> Result<Address> {
        self.value(index)?
            .as_address()
            .ok_or_else(|| eyre!("{} field {} is not an address", self.event, index))
    }

    /// A `bytes32` field
    pub fn word(&self, index: usize) -> Result<B256> {
        match self.value(index)?.as_fixed_bytes() {
            Some((bytes, 32)) => Ok(B256::from_slice(bytes)),
            _ => Err(eyre!("{} field {} is not bytes32", self.event, index)),
        }
    }
}

/// `LogLock(uint256 epoch, address from, uint256 value)` on the parent bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockEvent {
    pub epoch: U256,
    pub from: Address,
    pub value: U256,
}

impl TryFrom<&DecodedLog> for LockEvent {
    type Error = eyre::Report;

    fn try_from(log: &DecodedLog) -> Result<Self> {
        Ok(Self {
            epoch: log.uint(0)?,
            from: log.address(1)?,
            value: log.uint(2)?,
        })
    }
}

/// `LogBurn(uint256 epoch, address from, uint256 value)` on the child bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurnEvent {
    pub epoch: U256,
    pub from: Address,
    pub value: U256,
}

impl TryFrom<&DecodedLog> for BurnEvent {
    type Error = eyre::Report;

    fn try_from(log: &DecodedLog) -> Result<Self> {
        Ok(Self {
            epoch: log.uint(0)?,
            from: log.address(1)?,
            value: log.uint(2)?,
        })
    }
}

/// `StateChange(uint256 blockNo, bytes32 rootState)` on the child token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChangeEvent {
    pub block_no: U256,
    pub root_state: B256,
}

impl TryFrom<&DecodedLog> for StateChangeEvent {
    type Error = eyre::Report;

    fn try_from(log: &DecodedLog) -> Result<Self> {
        Ok(Self {
            block_no: log.uint(0)?,
            root_state: log.word(1)?,
        })
    }
}

/// ERC20 `Transfer(address indexed, address indexed, uint256)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferEvent {
    pub from: Address,
    pub to: Address,
    pub value: U256,
}

impl TryFrom<&DecodedLog> for TransferEvent {
    type Error = eyre::Report;

    fn try_from(log: &DecodedLog) -> Result<Self> {
        Ok(Self {
            from: log.address(0)?,
            to: log.address(1)?,
            value: log.uint(2)?,
        })
    }
}
