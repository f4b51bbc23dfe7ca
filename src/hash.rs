//! Hash computation for relay identifiers and validator signatures
//!
//! Every relayer instance must derive byte-identical values from the same
//! source event, otherwise partial signatures land in different aggregation
//! slots on the destination multisig.
//!
//! ## Formats
//!
//! - RelayTxId: `keccak256(sourceTxHash ‖ topic0)`
//! - Partial execution digest: `keccak256(uint256(epoch) ‖ txid ‖ message)`
//! - Personal message digest: `keccak256("\x19Ethereum Signed Message:\n32" ‖ digest)`

use std::fmt;

use alloy::primitives::{B256, U256};
use eyre::{eyre, Result};
use tiny_keccak::{Hasher, Keccak};

use crate::evm::rpc::RelayLog;

/// Domain separator prepended to a 32-byte digest before personal signing
pub const PERSONAL_MESSAGE_PREFIX: &[u8] = b"\x19Ethereum Signed Message:\n32";

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    keccak256_concat(&[data])
}

/// Compute keccak256 over the concatenation of several byte slices
pub fn keccak256_concat(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    for part in parts {
        hasher.update(part);
    }
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// Deterministic idempotency key for a relayed event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelayTxId(pub B256);

impl RelayTxId {
    /// Derive the id from the source transaction hash and the event topic
    pub fn compute(source_tx_hash: &B256, event_topic: &B256) -> Self {
        Self(B256::from(keccak256_concat(&[
            source_tx_hash.as_slice(),
            event_topic.as_slice(),
        ])))
    }

    /// Derive the id for a log delivered by the dispatcher.
    ///
    /// Fails when the node did not attach a transaction hash or the log
    /// carries no topics (anonymous event).
    pub fn from_log(log: &RelayLog) -> Result<Self> {
        let tx_hash = log
            .tx_hash
            .ok_or_else(|| eyre!("log from {} has no transaction hash", log.address))?;
        let topic = log
            .topic0()
            .ok_or_else(|| eyre!("log from {} has no topics", log.address))?;
        Ok(Self::compute(&tx_hash, &topic))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0 .0
    }
}

impl fmt::Display for RelayTxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bytes32_to_hex(self.as_bytes()))
    }
}

/// Digest a validator signs for an off-chain-authorized execution
pub fn partial_execution_digest(epoch: U256, txid: &RelayTxId, message: &[u8]) -> [u8; 32] {
    let epoch_word: [u8; 32] = epoch.to_be_bytes();
    keccak256_concat(&[&epoch_word, txid.as_bytes(), message])
}

/// Apply the Ethereum personal-message domain separator to a 32-byte digest
pub fn personal_message_digest(digest: &[u8; 32]) -> [u8; 32] {
    keccak256_concat(&[PERSONAL_MESSAGE_PREFIX, digest])
}

/// Convert bytes to hex string with 0x prefix
pub fn bytes32_to_hex(bytes: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keccak256() {
        let result = keccak256(b"hello");
        assert_eq!(
            bytes32_to_hex(&result),
            "0x1c8aff950685c2ed4bc3174f3472287b56d9517b9c948127319a09a7a36deac8"
        );
    }

    #[test]
    fn test_keccak256_concat_matches_single_buffer() {
        let joined = keccak256(b"hello world");
        let parts = keccak256_concat(&[b"hello", b" ", b"world"]);
        assert_eq!(joined, parts);
    }

    #[test]
    fn test_relay_tx_id_is_deterministic() {
        let tx_hash = B256::repeat_byte(0x11);
        let topic = B256::repeat_byte(0x33);

        let first = RelayTxId::compute(&tx_hash, &topic);
        let second = RelayTxId::compute(&tx_hash, &topic);
        assert_eq!(first, second);

        let mut preimage = Vec::new();
        preimage.extend_from_slice(tx_hash.as_slice());
        preimage.extend_from_slice(topic.as_slice());
        assert_eq!(first.as_bytes(), &keccak256(&preimage));
    }

    #[test]
    fn test_relay_tx_id_depends_on_topic() {
        let tx_hash = B256::repeat_byte(0x11);
        let a = RelayTxId::compute(&tx_hash, &B256::repeat_byte(0x33));
        let b = RelayTxId::compute(&tx_hash, &B256::repeat_byte(0x44));
        assert_ne!(a, b);
    }

    #[test]
    fn test_relay_tx_id_from_log_requires_tx_hash() {
        let mut log = RelayLog {
            address: Default::default(),
            topics: vec![B256::repeat_byte(0x33)],
            data: Default::default(),
            tx_hash: None,
            block_number: None,
            log_index: None,
            removed: false,
        };
        assert!(RelayTxId::from_log(&log).is_err());

        log.tx_hash = Some(B256::repeat_byte(0x11));
        let id = RelayTxId::from_log(&log).unwrap();
        assert_eq!(
            id,
            RelayTxId::compute(&B256::repeat_byte(0x11), &B256::repeat_byte(0x33))
        );
    }

    #[test]
    fn test_partial_execution_digest_layout() {
        let txid = RelayTxId(B256::repeat_byte(0x05));
        let message = [0xde, 0xad, 0xbe, 0xef];
        let digest = partial_execution_digest(U256::from(7), &txid, &message);

        let mut preimage = vec![0u8; 31];
        preimage.push(7);
        preimage.extend_from_slice(txid.as_bytes());
        preimage.extend_from_slice(&message);
        assert_eq!(digest, keccak256(&preimage));
    }

    #[test]
    fn test_personal_message_digest_prefix() {
        let digest = [0xabu8; 32];
        let mut preimage = b"\x19Ethereum Signed Message:\n32".to_vec();
        preimage.extend_from_slice(&digest);
        assert_eq!(personal_message_digest(&digest), keccak256(&preimage));
    }

    #[test]
    fn test_relay_tx_id_display() {
        let id = RelayTxId(B256::repeat_byte(0xab));
        let shown = id.to_string();
        assert!(shown.starts_with("0xabab"));
        assert_eq!(shown.len(), 66);
    }
}
