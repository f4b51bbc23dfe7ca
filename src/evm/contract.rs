//! Contract artifacts and bindings
//!
//! Artifacts are JSON documents with an `abi` array and a `bytecode` hex
//! string (Truffle layout) or `{ "object": "0x.." }` (Foundry layout). They are
//! loaded at runtime, so calls are encoded with alloy's dynamic ABI support
//! rather than `sol!` bindings.
//!
//! ## Usage
//!
//! ```ignore
//! let artifact = ContractArtifact::load("contracts/ChildBridge.json")?;
//! let child = ContractBinding::new(artifact, child_link.clone());
//! child.set_address(address, true).await?;
//! child.send_transaction_sync("burn", U256::ZERO, 0, &[DynSolValue::Uint(value, 256)]).await?;
//! ```

use std::{
    path::Path,
    sync::{Arc, OnceLock},
};

use alloy::{
    dyn_abi::{DynSolValue, EventExt, FunctionExt, JsonAbiExt},
    json_abi::{Event, Function, JsonAbi},
    primitives::{Address, Bytes, B256, U256},
};
use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;
use tracing::{debug, info};

use crate::evm::{
    client::{ChainLink, Confirmed},
    events::DecodedLog,
    rpc::RelayLog,
    signer::sign_partial_execution,
};
use crate::hash::RelayTxId;

/// Multisig entry point for on-chain-authorized partial executions
pub const PARTIAL_EXECUTE_ON: &str = "partialExecuteOn";

/// Multisig entry point for signature-authorized partial executions
pub const PARTIAL_EXECUTE_OFF: &str = "partialExecuteOff";

// ============================================================================
// Artifacts
// ============================================================================

#[derive(Deserialize)]
#[serde(untagged)]
enum RawBytecode {
    Hex(String),
    Object { object: String },
}

#[derive(Deserialize)]
struct RawArtifact {
    abi: JsonAbi,
    #[serde(default)]
    bytecode: Option<RawBytecode>,
}

/// ABI plus optional creation bytecode
#[derive(Debug, Clone)]
pub struct ContractArtifact {
    pub name: String,
    pub abi: JsonAbi,
    /// `None` when the artifact carries no (or empty) bytecode
    pub bytecode: Option<Bytes>,
}

impl ContractArtifact {
    /// Load an artifact file; the contract name is the file stem
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read contract artifact {}", path.display()))?;
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("contract");
        Self::from_json(name, &json)
            .wrap_err_with(|| format!("Invalid contract artifact {}", path.display()))
    }

    pub fn from_json(name: &str, json: &str) -> Result<Self> {
        let raw: RawArtifact =
            serde_json::from_str(json).wrap_err("Failed to parse contract artifact")?;

        let bytecode = match raw.bytecode {
            Some(RawBytecode::Hex(s)) | Some(RawBytecode::Object { object: s }) => {
                parse_bytecode(&s)?
            }
            None => None,
        };

        Ok(Self {
            name: name.to_string(),
            abi: raw.abi,
            bytecode,
        })
    }
}

fn parse_bytecode(s: &str) -> Result<Option<Bytes>> {
    let hex_str = s.trim().trim_start_matches("0x");
    if hex_str.is_empty() {
        return Ok(None);
    }
    let bytes = hex::decode(hex_str).map_err(|e| eyre!("Invalid bytecode hex: {}", e))?;
    Ok(Some(Bytes::from(bytes)))
}

// ============================================================================
// Binding
// ============================================================================

/// A contract on one chain: ABI, bytecode and an address set exactly once
#[derive(Debug)]
pub struct ContractBinding {
    name: String,
    abi: JsonAbi,
    bytecode: Option<Bytes>,
    address: OnceLock<Address>,
    link: Arc<ChainLink>,
}

impl ContractBinding {
    pub fn new(artifact: ContractArtifact, link: Arc<ChainLink>) -> Self {
        Self {
            name: artifact.name,
            abi: artifact.abi,
            bytecode: artifact.bytecode,
            address: OnceLock::new(),
            link,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn abi(&self) -> &JsonAbi {
        &self.abi
    }

    pub fn link(&self) -> &Arc<ChainLink> {
        &self.link
    }

    /// Attached address; fails before `set_address` or `deploy`
    pub fn address(&self) -> Result<Address> {
        self.address
            .get()
            .copied()
            .ok_or_else(|| {
                eyre!("Contract {} has no address, deploy or attach it first", self.name)
            })
    }

    pub fn is_attached(&self) -> bool {
        self.address.get().is_some()
    }

    /// Attach to an existing deployment, optionally checking it has code
    pub async fn set_address(&self, address: Address, verify_code: bool) -> Result<()> {
        if self.is_attached() {
            return Err(eyre!("Contract {} address already set", self.name));
        }

        if verify_code {
            let code = self
                .link
                .code_at(address)
                .await
                .wrap_err_with(|| format!("Failed to read code at {}", address))?;
            if code.is_empty() {
                return Err(eyre!(
                    "Address {} has no code on the {} chain, cannot attach {}",
                    address,
                    self.link.name(),
                    self.name
                ));
            }
        }

        self.address
            .set(address)
            .map_err(|_| eyre!("Contract {} address already set", self.name))?;

        info!(
            contract = %self.name,
            chain = %self.link.name(),
            address = %address,
            "Contract attached"
        );
        Ok(())
    }

    /// Deploy from the artifact bytecode and attach to the created address
    pub async fn deploy(&self, args: &[DynSolValue], gas_limit: u64) -> Result<Confirmed> {
        if self.is_attached() {
            return Err(eyre!("Contract {} address already set", self.name));
        }
        let bytecode = self
            .bytecode
            .as_ref()
            .ok_or_else(|| eyre!("Contract {} artifact has no bytecode", self.name))?;

        let encoded_args = match self.abi.constructor() {
            Some(constructor) => constructor
                .abi_encode_input(args)
                .map_err(|e| eyre!("Failed to encode {} constructor: {}", self.name, e))?,
            None if args.is_empty() => Vec::new(),
            None => {
                return Err(eyre!(
                    "Contract {} has no constructor but {} arguments were given",
                    self.name,
                    args.len()
                ))
            }
        };

        let mut init_code = bytecode.to_vec();
        init_code.extend_from_slice(&encoded_args);

        info!(contract = %self.name, chain = %self.link.name(), "Deploying contract");
        let confirmed = self
            .link
            .submit_and_confirm(None, U256::ZERO, gas_limit, Bytes::from(init_code))
            .await?;

        let address = confirmed
            .receipt
            .contract_address
            .ok_or_else(|| eyre!("Deployment receipt for {} has no contract address", self.name))?;

        self.address
            .set(address)
            .map_err(|_| eyre!("Contract {} address already set", self.name))?;

        info!(
            contract = %self.name,
            address = %address,
            tx_hash = %confirmed.tx.hash,
            "Contract deployed"
        );
        Ok(confirmed)
    }

    // ========================================================================
    // ABI lookup
    // ========================================================================

    /// First overload of `method` taking `arity` arguments
    pub fn function(&self, method: &str, arity: usize) -> Result<&Function> {
        let overloads = self
            .abi
            .function(method)
            .ok_or_else(|| eyre!("Method {} not found in {} ABI", method, self.name))?;
        overloads
            .iter()
            .find(|f| f.inputs.len() == arity)
            .ok_or_else(|| {
                eyre!(
                    "Method {} in {} ABI takes no {} argument form",
                    method,
                    self.name,
                    arity
                )
            })
    }

    pub fn event(&self, name: &str) -> Result<&Event> {
        self.abi
            .event(name)
            .and_then(|overloads| overloads.first())
            .ok_or_else(|| eyre!("Event {} not found in {} ABI", name, self.name))
    }

    /// Topic 0 of `name`, the keccak of its canonical signature
    pub fn event_topic(&self, name: &str) -> Result<B256> {
        Ok(self.event(name)?.selector())
    }

    // ========================================================================
    // Encoding
    // ========================================================================

    /// Selector plus ABI-encoded arguments
    pub fn encode_call(&self, method: &str, args: &[DynSolValue]) -> Result<Bytes> {
        let function = self.function(method, args.len())?;
        let data = function
            .abi_encode_input(args)
            .map_err(|e| eyre!("Failed to encode {}.{}: {}", self.name, method, e))?;
        Ok(Bytes::from(data))
    }

    /// Decode a log of event `name`; values follow declaration order
    pub fn decode_event(&self, name: &str, log: &RelayLog) -> Result<DecodedLog> {
        let event = self.event(name)?;
        let decoded = event
            .decode_log_parts(log.topics.iter().copied(), &log.data, true)
            .map_err(|e| eyre!("Failed to decode {} log: {}", name, e))?;

        let mut indexed = decoded.indexed.into_iter();
        let mut body = decoded.body.into_iter();
        let mut fields = Vec::with_capacity(event.inputs.len());
        for param in &event.inputs {
            let value = if param.indexed {
                indexed.next()
            } else {
                body.next()
            };
            let value = value.ok_or_else(|| eyre!("{} log is missing field {}", name, param.name))?;
            fields.push((param.name.clone(), value));
        }

        Ok(DecodedLog::new(name, fields))
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Encode and submit `method`, waiting for confirmation.
    ///
    /// Submission failures keep their [`crate::evm::client::SubmitError`]
    /// type inside the report so callers can downcast.
    pub async fn send_transaction_sync(
        &self,
        method: &str,
        value: U256,
        gas_limit: u64,
        args: &[DynSolValue],
    ) -> Result<Confirmed> {
        let to = self.address()?;
        let calldata = self.encode_call(method, args)?;

        info!(contract = %self.name, chain = %self.link.name(), method, "SEND");
        let confirmed = self
            .link
            .submit_and_confirm(Some(to), value, gas_limit, calldata)
            .await?;
        info!(contract = %self.name, method, tx_hash = %confirmed.tx.hash, "RCPT");

        Ok(confirmed)
    }

    /// Call a constant method and decode its outputs
    pub async fn call(&self, method: &str, args: &[DynSolValue]) -> Result<Vec<DynSolValue>> {
        let to = self.address()?;
        let function = self.function(method, args.len())?;
        let calldata = self.encode_call(method, args)?;

        let output = self.link.read(to, U256::ZERO, calldata).await?;
        let values = function
            .abi_decode_output(&output, true)
            .map_err(|e| eyre!("Failed to decode {}.{} output: {}", self.name, method, e))?;

        debug!(contract = %self.name, method, outputs = values.len(), "Call returned");
        Ok(values)
    }

    /// Submit `(epoch, txid, call)` as this account's contribution
    pub async fn execute_on(
        &self,
        epoch: U256,
        txid: &RelayTxId,
        call: Bytes,
        gas_limit: u64,
    ) -> Result<Confirmed> {
        let args = [
            DynSolValue::Uint(epoch, 256),
            DynSolValue::FixedBytes(txid.0, 32),
            DynSolValue::Bytes(call.to_vec()),
        ];
        self.send_transaction_sync(PARTIAL_EXECUTE_ON, U256::ZERO, gas_limit, &args)
            .await
    }

    /// Sign `(epoch, txid, call)` and submit it with the `(v, r, s)` signature
    pub async fn partial_execute_off(
        &self,
        epoch: U256,
        txid: &RelayTxId,
        call: Bytes,
        gas_limit: u64,
    ) -> Result<Confirmed> {
        let function = self.function(PARTIAL_EXECUTE_OFF, 4)?;
        let signature = sign_partial_execution(self.link.signer(), epoch, txid, &call)?;

        let words = if function.inputs[3].ty.starts_with("uint256") {
            signature
                .uints()
                .into_iter()
                .map(|w| DynSolValue::Uint(w, 256))
                .collect()
        } else {
            signature
                .words()
                .into_iter()
                .map(|w| DynSolValue::FixedBytes(w, 32))
                .collect()
        };

        let args = [
            DynSolValue::Uint(epoch, 256),
            DynSolValue::FixedBytes(txid.0, 32),
            DynSolValue::Bytes(call.to_vec()),
            DynSolValue::FixedArray(words),
        ];
        self.send_transaction_sync(PARTIAL_EXECUTE_OFF, U256::ZERO, gas_limit, &args)
            .await
    }
}
