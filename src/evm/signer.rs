//! Relayer account signing
//!
//! Wraps alloy's `PrivateKeySigner` and `EthereumWallet` behind [`RelaySigner`]
//! so the transaction engine can sign both transactions and raw digests
//! without knowing where the key lives.
//!
//! ## Key sources
//!
//! - Hex private key (with or without 0x prefix)
//! - Encrypted keystore: either a single file or a directory holding exactly one account
//!
//! ## Validator signatures
//!
//! Destination multisigs expect `(v, r, s)` packed as three 32-byte words with
//! `v = recovery_id + 27` in the last byte of the first word. See
//! [`ValidatorSignature`].

use std::{fmt, path::Path};

use alloy::{
    eips::eip2718::Encodable2718,
    network::{Ethereum, EthereumWallet, TransactionBuilder},
    primitives::{Address, Bytes, B256, U256},
    rpc::types::TransactionRequest,
    signers::{local::PrivateKeySigner, SignerSync},
};
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use tracing::info;

use crate::hash::{partial_execution_digest, personal_message_digest, RelayTxId};

/// A signed transaction ready for broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub hash: B256,
    /// EIP-2718 encoded envelope
    pub raw: Bytes,
}

/// Signing capability of the relayer account
#[async_trait]
pub trait RelaySigner: Send + Sync {
    fn address(&self) -> Address;

    /// Sign a 32-byte digest; returns `r ‖ s ‖ recovery_id` with the id in {0, 1}
    fn sign_digest(&self, digest: &B256) -> Result<[u8; 65]>;

    /// Sign a fully populated transaction request (nonce, gas and chain id set)
    async fn sign_transaction(&self, tx: TransactionRequest) -> Result<SignedTransaction>;
}

/// [`RelaySigner`] holding the key in memory
pub struct LocalRelaySigner {
    signer: PrivateKeySigner,
    wallet: EthereumWallet,
}

impl fmt::Debug for LocalRelaySigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalRelaySigner")
            .field("address", &self.signer.address())
            .field("key", &"<redacted>")
            .finish()
    }
}

impl LocalRelaySigner {
    pub fn new(signer: PrivateKeySigner) -> Self {
        let wallet = EthereumWallet::from(signer.clone());
        info!(address = %signer.address(), "Relayer signer initialized");
        Self { signer, wallet }
    }

    /// Create from a hex private key string
    pub fn from_private_key(private_key: &str) -> Result<Self> {
        let signer: PrivateKeySigner = private_key
            .trim()
            .parse()
            .map_err(|e| eyre!("Invalid private key: {}", e))?;
        Ok(Self::new(signer))
    }

    /// Decrypt an encrypted keystore.
    ///
    /// `path` may point at the keystore file itself or at a directory; a
    /// directory must contain exactly one account file.
    pub fn from_keystore(path: &Path, password: &str) -> Result<Self> {
        let file = if path.is_dir() {
            single_keystore_file(path)?
        } else {
            path.to_path_buf()
        };

        let signer = PrivateKeySigner::decrypt_keystore(&file, password)
            .map_err(|e| eyre!("Failed to decrypt keystore {}: {}", file.display(), e))?;
        Ok(Self::new(signer))
    }

    /// Fresh random key, used by tests and local tooling
    pub fn random() -> Self {
        Self::new(PrivateKeySigner::random())
    }
}

fn single_keystore_file(dir: &Path) -> Result<std::path::PathBuf> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)
        .wrap_err_with(|| format!("Failed to read keystore directory {}", dir.display()))?
    {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }

    match files.len() {
        1 => Ok(files.remove(0)),
        n => Err(eyre!(
            "Keystore directory {} must hold exactly one account, found {}",
            dir.display(),
            n
        )),
    }
}

#[async_trait]
impl RelaySigner for LocalRelaySigner {
    fn address(&self) -> Address {
        self.signer.address()
    }

    fn sign_digest(&self, digest: &B256) -> Result<[u8; 65]> {
        let signature = self
            .signer
            .sign_hash_sync(digest)
            .map_err(|e| eyre!("Failed to sign digest: {}", e))?;

        let mut bytes = signature.as_bytes();
        // alloy encodes v as 27/28; callers expect the bare recovery id
        if bytes[64] >= 27 {
            bytes[64] -= 27;
        }
        Ok(bytes)
    }

    async fn sign_transaction(&self, tx: TransactionRequest) -> Result<SignedTransaction> {
        let envelope = TransactionBuilder::<Ethereum>::build(tx, &self.wallet)
            .await
            .map_err(|e| eyre!("Failed to sign transaction: {}", e))?;

        Ok(SignedTransaction {
            hash: *envelope.tx_hash(),
            raw: Bytes::from(envelope.encoded_2718()),
        })
    }
}

/// Signature in the `(v, r, s)` word layout destination contracts verify
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatorSignature {
    /// Left-padded `v`, value in byte 31
    pub v: [u8; 32],
    pub r: [u8; 32],
    pub s: [u8; 32],
}

impl ValidatorSignature {
    /// The three words as `bytes32[3]`
    pub fn words(&self) -> [B256; 3] {
        [B256::from(self.v), B256::from(self.r), B256::from(self.s)]
    }

    /// The three words as `uint256[3]`
    pub fn uints(&self) -> [U256; 3] {
        self.words().map(|w| U256::from_be_bytes(w.0))
    }

    pub fn v_value(&self) -> u8 {
        self.v[31]
    }
}

/// Convert `r ‖ s ‖ recovery_id` into the three-word layout
pub fn reformat_signature(raw: &[u8; 65]) -> Result<ValidatorSignature> {
    let recovery_id = raw[64];
    if recovery_id > 1 {
        return Err(eyre!(
            "Unexpected recovery id {}, expected 0 or 1",
            recovery_id
        ));
    }

    let mut v = [0u8; 32];
    v[31] = recovery_id + 27;
    let mut r = [0u8; 32];
    r.copy_from_slice(&raw[0..32]);
    let mut s = [0u8; 32];
    s.copy_from_slice(&raw[32..64]);

    Ok(ValidatorSignature { v, r, s })
}

/// Produce this relayer's partial signature over `(epoch, txid, call)`
pub fn sign_partial_execution(
    signer: &dyn RelaySigner,
    epoch: U256,
    txid: &RelayTxId,
    call: &[u8],
) -> Result<ValidatorSignature> {
    let digest = partial_execution_digest(epoch, txid, call);
    let prefixed = personal_message_digest(&digest);
    let raw = signer.sign_digest(&B256::from(prefixed))?;
    reformat_signature(&raw)
}
