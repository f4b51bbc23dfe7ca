//! Relayer configuration
//!
//! Loaded from a `.env` file when present, then from the process
//! environment. Secrets are wrapped in [`Redacted`] and every config struct
//! holding one has a custom `Debug`.

use std::{
    env, fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use alloy::primitives::Address;
use eyre::{eyre, Result, WrapErr};

use crate::evm::{client::LinkConfig, signer::LocalRelaySigner};
use crate::redact::Redacted;
use crate::relay::ResubmitPolicy;

/// Artifact file names under `CONTRACTS_PATH`
pub const PARENT_BRIDGE_ARTIFACT: &str = "ParentBridge.json";
pub const CHILD_BRIDGE_ARTIFACT: &str = "ChildBridge.json";
pub const CHILD_TOKEN_ARTIFACT: &str = "ChildToken.json";

/// Main configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub parent: ChainConfig,
    pub child: ChainConfig,
    /// Child token; read from the child bridge when unset
    pub token_address: Option<Address>,
    pub key: KeySource,
    pub contracts_path: PathBuf,
    /// Initial validator set for `deploy`; the relayer account when unset
    pub deploy_signers: Option<Vec<Address>>,
    pub relayer: RelayerConfig,
}

/// One chain endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainConfig {
    pub rpc_url: String,
    /// Bridge contract; required by every command except `deploy`
    pub bridge_address: Option<Address>,
}

/// Where the relayer key comes from
#[derive(Clone)]
pub enum KeySource {
    PrivateKey(Redacted<String>),
    /// Keystore file, or a directory holding exactly one keystore
    Keystore {
        path: PathBuf,
        password: Redacted<String>,
    },
}

/// Custom Debug that shows the key source kind but never the secret
impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySource::PrivateKey(key) => f.debug_tuple("PrivateKey").field(key).finish(),
            KeySource::Keystore { path, password } => f
                .debug_struct("Keystore")
                .field("path", path)
                .field("password", password)
                .finish(),
        }
    }
}

/// Engine and handler tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayerConfig {
    pub receipt_timeout_secs: u64,
    pub receipt_poll_interval_ms: u64,
    /// 0 asks the node for an estimate
    pub gas_limit: u64,
    pub resubmit_attempts: u32,
    pub verify_contract_code: bool,
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            receipt_timeout_secs: default_receipt_timeout_secs(),
            receipt_poll_interval_ms: default_receipt_poll_interval_ms(),
            gas_limit: default_gas_limit(),
            resubmit_attempts: default_resubmit_attempts(),
            verify_contract_code: true,
        }
    }
}

/// Default functions
fn default_receipt_timeout_secs() -> u64 {
    120
}

fn default_receipt_poll_interval_ms() -> u64 {
    200
}

fn default_gas_limit() -> u64 {
    4_000_000
}

fn default_resubmit_attempts() -> u32 {
    2
}

fn default_contracts_path() -> PathBuf {
    PathBuf::from("./contracts")
}

impl Config {
    /// Load configuration, reading `.env` first if it exists
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env")
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
            tracing::debug!("Loaded .env from {}", path);
        }
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from any variable source; used by `load` and by tests
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let required = |name: &str| {
            var(name).ok_or_else(|| eyre!("{} environment variable is required", name))
        };

        let parent = ChainConfig {
            rpc_url: required("PARENT_RPC_URL")?,
            bridge_address: var("PARENT_BRIDGE_ADDRESS")
                .map(|v| parse_address("PARENT_BRIDGE_ADDRESS", &v))
                .transpose()?,
        };
        let child = ChainConfig {
            rpc_url: required("CHILD_RPC_URL")?,
            bridge_address: var("CHILD_BRIDGE_ADDRESS")
                .map(|v| parse_address("CHILD_BRIDGE_ADDRESS", &v))
                .transpose()?,
        };

        let key = match (var("RELAYER_PRIVATE_KEY"), var("RELAYER_KEYSTORE_PATH")) {
            (Some(key), None) => KeySource::PrivateKey(Redacted::new(key)),
            (None, Some(path)) => KeySource::Keystore {
                path: PathBuf::from(path),
                password: Redacted::new(required("RELAYER_KEYSTORE_PASSWORD")?),
            },
            (Some(_), Some(_)) => {
                return Err(eyre!(
                    "Set either RELAYER_PRIVATE_KEY or RELAYER_KEYSTORE_PATH, not both"
                ))
            }
            (None, None) => {
                return Err(eyre!(
                    "RELAYER_PRIVATE_KEY or RELAYER_KEYSTORE_PATH environment variable is required"
                ))
            }
        };

        let deploy_signers = var("DEPLOY_SIGNERS")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| parse_address("DEPLOY_SIGNERS", s))
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?;

        let relayer = RelayerConfig {
            receipt_timeout_secs: parse_or(
                "RECEIPT_TIMEOUT_SECS",
                var("RECEIPT_TIMEOUT_SECS"),
                default_receipt_timeout_secs(),
            )?,
            receipt_poll_interval_ms: parse_or(
                "RECEIPT_POLL_INTERVAL_MS",
                var("RECEIPT_POLL_INTERVAL_MS"),
                default_receipt_poll_interval_ms(),
            )?,
            gas_limit: parse_or("RELAY_GAS_LIMIT", var("RELAY_GAS_LIMIT"), default_gas_limit())?,
            resubmit_attempts: parse_or(
                "RELAY_RESUBMIT_ATTEMPTS",
                var("RELAY_RESUBMIT_ATTEMPTS"),
                default_resubmit_attempts(),
            )?,
            verify_contract_code: parse_or(
                "VERIFY_CONTRACT_CODE",
                var("VERIFY_CONTRACT_CODE"),
                true,
            )?,
        };

        let config = Config {
            parent,
            child,
            token_address: var("TOKEN_ADDRESS")
                .map(|v| parse_address("TOKEN_ADDRESS", &v))
                .transpose()?,
            key,
            contracts_path: var("CONTRACTS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(default_contracts_path),
            deploy_signers,
            relayer,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        for (name, chain) in [("parent", &self.parent), ("child", &self.child)] {
            let url = chain.rpc_url.as_str();
            let supported = url.starts_with("ws://")
                || url.starts_with("wss://")
                || url.starts_with("http://")
                || url.starts_with("https://")
                || url.ends_with(".ipc");
            if !supported {
                return Err(eyre!(
                    "{} rpc url must be ws(s)://, http(s):// or an .ipc path",
                    name
                ));
            }
        }

        if let KeySource::PrivateKey(key) = &self.key {
            let key = key.expose().trim();
            let hex_part = key.strip_prefix("0x").unwrap_or(key);
            if hex_part.len() != 64 || hex::decode(hex_part).is_err() {
                return Err(eyre!("RELAYER_PRIVATE_KEY must be 64 hex chars (0x prefix optional)"));
            }
        }

        if self.relayer.receipt_timeout_secs == 0 {
            return Err(eyre!("RECEIPT_TIMEOUT_SECS must be greater than 0"));
        }
        if self.relayer.receipt_poll_interval_ms == 0 {
            return Err(eyre!("RECEIPT_POLL_INTERVAL_MS must be greater than 0"));
        }
        if Duration::from_millis(self.relayer.receipt_poll_interval_ms)
            > Duration::from_secs(self.relayer.receipt_timeout_secs)
        {
            return Err(eyre!("RECEIPT_POLL_INTERVAL_MS must not exceed RECEIPT_TIMEOUT_SECS"));
        }

        Ok(())
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            receipt_timeout: Duration::from_secs(self.relayer.receipt_timeout_secs),
            poll_interval: Duration::from_millis(self.relayer.receipt_poll_interval_ms),
        }
    }

    pub fn resubmit_policy(&self) -> ResubmitPolicy {
        ResubmitPolicy {
            max_resubmits: self.relayer.resubmit_attempts,
            ..ResubmitPolicy::default()
        }
    }

    /// Open the relayer key
    pub fn load_signer(&self) -> Result<LocalRelaySigner> {
        match &self.key {
            KeySource::PrivateKey(key) => LocalRelaySigner::from_private_key(key.expose()),
            KeySource::Keystore { path, password } => {
                LocalRelaySigner::from_keystore(path, password.expose())
            }
        }
    }
}

fn parse_address(name: &str, value: &str) -> Result<Address> {
    value
        .trim()
        .parse()
        .map_err(|e| eyre!("{} is not a valid address ({}): {}", name, value, e))
}

fn parse_or<T>(name: &str, value: Option<String>, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match value {
        Some(v) => v
            .trim()
            .parse()
            .map_err(|e| eyre!("Invalid {} ({}): {}", name, v, e)),
        None => Ok(default),
    }
}
