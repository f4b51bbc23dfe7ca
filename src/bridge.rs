//! Bridge orchestrator
//!
//! Wires the parent and child [`ChainLink`]s (one signer, one nonce lock),
//! the three contract bindings and the relay handler table, then runs both
//! dispatch loops until shutdown.

use std::{path::Path, sync::Arc};

use alloy::{
    dyn_abi::DynSolValue,
    primitives::{Address, U256},
};
use eyre::{eyre, Result, WrapErr};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::config::{
    Config, RelayerConfig, CHILD_BRIDGE_ARTIFACT, CHILD_TOKEN_ARTIFACT, PARENT_BRIDGE_ARTIFACT,
};
use crate::evm::{
    client::{ChainLink, Confirmed, NonceLock},
    contract::{ContractArtifact, ContractBinding},
    signer::RelaySigner,
};
use crate::hash::RelayTxId;
use crate::relay::{protocol::*, RelayContext, ResubmitPolicy};

/// ABI and bytecode of the three bridge contracts
#[derive(Debug, Clone)]
pub struct BridgeArtifacts {
    pub parent: ContractArtifact,
    pub child: ContractArtifact,
    pub token: ContractArtifact,
}

impl BridgeArtifacts {
    pub fn load(dir: &Path) -> Result<Self> {
        Ok(Self {
            parent: ContractArtifact::load(dir.join(PARENT_BRIDGE_ARTIFACT))?,
            child: ContractArtifact::load(dir.join(CHILD_BRIDGE_ARTIFACT))?,
            token: ContractArtifact::load(dir.join(CHILD_TOKEN_ARTIFACT))?,
        })
    }
}

/// Addresses produced by [`Bridge::deploy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeployedAddresses {
    pub parent: Address,
    pub child: Address,
    pub token: Address,
}

/// Parent and child links with the bridge contracts bound to them
pub struct Bridge {
    parent_link: Arc<ChainLink>,
    child_link: Arc<ChainLink>,
    pub parent: Arc<ContractBinding>,
    pub child: Arc<ContractBinding>,
    pub token: Arc<ContractBinding>,
    settings: RelayerConfig,
    resubmit: ResubmitPolicy,
}

impl Bridge {
    /// Open the relayer key, connect both chains and load the artifacts
    pub async fn connect(config: &Config) -> Result<Self> {
        let signer: Arc<dyn RelaySigner> = Arc::new(config.load_signer()?);
        info!(account = %signer.address(), "Relayer account loaded");

        let nonce_lock = NonceLock::new();
        let link_config = config.link_config();

        let parent_link = ChainLink::connect(
            "parent",
            &config.parent.rpc_url,
            signer.clone(),
            nonce_lock.clone(),
            link_config,
        )
        .await?;
        let child_link = ChainLink::connect(
            "child",
            &config.child.rpc_url,
            signer,
            nonce_lock,
            link_config,
        )
        .await?;

        let artifacts = BridgeArtifacts::load(&config.contracts_path).wrap_err_with(|| {
            format!(
                "Failed to load contract artifacts from {}",
                config.contracts_path.display()
            )
        })?;

        Ok(Self::from_parts(
            Arc::new(parent_link),
            Arc::new(child_link),
            artifacts,
            config.relayer.clone(),
            config.resubmit_policy(),
        ))
    }

    /// Assemble from already connected links
    pub fn from_parts(
        parent_link: Arc<ChainLink>,
        child_link: Arc<ChainLink>,
        artifacts: BridgeArtifacts,
        settings: RelayerConfig,
        resubmit: ResubmitPolicy,
    ) -> Self {
        let parent = Arc::new(ContractBinding::new(artifacts.parent, parent_link.clone()));
        let child = Arc::new(ContractBinding::new(artifacts.child, child_link.clone()));
        let token = Arc::new(ContractBinding::new(artifacts.token, child_link.clone()));

        Self {
            parent_link,
            child_link,
            parent,
            child,
            token,
            settings,
            resubmit,
        }
    }

    pub fn parent_link(&self) -> &Arc<ChainLink> {
        &self.parent_link
    }

    pub fn child_link(&self) -> &Arc<ChainLink> {
        &self.child_link
    }

    /// Log the relayer balance on both chains
    pub async fn log_account_info(&self) -> Result<()> {
        let parent = self.parent_link.account_info().await?;
        let child = self.child_link.account_info().await?;
        info!(parent = %parent, child = %child, "Relayer accounts");
        Ok(())
    }

    // ========================================================================
    // Attachment and deployment
    // ========================================================================

    /// Attach to deployed contracts. Without a token address the child
    /// bridge is asked for it.
    pub async fn attach(
        &self,
        parent: Address,
        child: Address,
        token: Option<Address>,
    ) -> Result<()> {
        let verify = self.settings.verify_contract_code;
        self.parent.set_address(parent, verify).await?;
        self.child.set_address(child, verify).await?;

        let token = match token {
            Some(token) => token,
            None => self.read_token_address().await?,
        };
        self.token.set_address(token, verify).await
    }

    async fn read_token_address(&self) -> Result<Address> {
        let outputs = self
            .child
            .call(METHOD_TOKEN, &[])
            .await
            .wrap_err("Failed to read the token address from the child bridge")?;
        outputs
            .first()
            .and_then(DynSolValue::as_address)
            .ok_or_else(|| eyre!("{}() did not return an address", METHOD_TOKEN))
    }

    /// Initial validator set for [`Bridge::deploy`]: the configured list,
    /// or the relayer account alone when none is configured
    pub fn deploy_signers(&self, configured: Option<&[Address]>) -> Vec<Address> {
        configured.map_or_else(|| vec![self.parent_link().address()], <[Address]>::to_vec)
    }

    /// Deploy parent bridge, child bridge and token, then link the token
    /// into the child bridge.
    pub async fn deploy(&self, signers: &[Address]) -> Result<DeployedAddresses> {
        if signers.is_empty() {
            return Err(eyre!("Deployment needs at least one signer address"));
        }
        let signer_list =
            DynSolValue::Array(signers.iter().copied().map(DynSolValue::Address).collect());

        self.parent
            .deploy(std::slice::from_ref(&signer_list), 0)
            .await
            .wrap_err("Parent bridge deployment failed")?;
        self.child
            .deploy(std::slice::from_ref(&signer_list), 0)
            .await
            .wrap_err("Child bridge deployment failed")?;

        let child = self.child.address()?;
        self.token
            .deploy(&[DynSolValue::Address(child)], 0)
            .await
            .wrap_err("Token deployment failed")?;

        let token = self.token.address()?;
        self.child
            .send_transaction_sync(METHOD_INIT, U256::ZERO, 0, &[DynSolValue::Address(token)])
            .await
            .wrap_err("Child bridge init failed")?;

        let deployed = DeployedAddresses {
            parent: self.parent.address()?,
            child,
            token,
        };
        info!(
            parent = %deployed.parent,
            child = %deployed.child,
            token = %deployed.token,
            signers = signers.len(),
            "Bridge deployed"
        );
        Ok(deployed)
    }

    // ========================================================================
    // Relaying
    // ========================================================================

    /// Register the relay handler table on both links
    pub fn register_handlers(&self) -> Result<Arc<RelayContext>> {
        let ctx = Arc::new(RelayContext {
            parent: self.parent.clone(),
            child: self.child.clone(),
            token: self.token.clone(),
            gas_limit: self.settings.gas_limit,
            resubmit: self.resubmit.clone(),
        });
        ctx.register_handlers()?;
        Ok(ctx)
    }

    /// Run both dispatch loops until `shutdown` fires or one of them fails
    pub async fn run(&self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        let mut parent = self.parent_link.start_dispatch().await?;
        let mut child = match self.child_link.start_dispatch().await {
            Ok(handle) => handle,
            Err(e) => {
                let _ = parent.stop().await;
                return Err(e);
            }
        };

        info!("Relaying, waiting for events");

        enum Exit {
            Shutdown,
            Parent(Result<()>),
            Child(Result<()>),
        }

        let exit = tokio::select! {
            _ = shutdown.recv() => Exit::Shutdown,
            result = parent.finished() => Exit::Parent(result),
            result = child.finished() => Exit::Child(result),
        };

        match exit {
            Exit::Shutdown => {
                info!("Shutdown signal received, stopping dispatch");
                let parent_result = parent.stop().await;
                let child_result = child.stop().await;
                parent_result.and(child_result)
            }
            Exit::Parent(result) => {
                let _ = child.stop().await;
                Err(dispatch_ended(self.parent_link.name(), result))
            }
            Exit::Child(result) => {
                let _ = parent.stop().await;
                Err(dispatch_ended(self.child_link.name(), result))
            }
        }
    }

    // ========================================================================
    // User actions
    // ========================================================================

    /// Lock `value` wei on the parent bridge
    pub async fn lock(&self, value: U256) -> Result<Confirmed> {
        self.parent
            .send_transaction_sync(METHOD_LOCK, value, 0, &[])
            .await
            .wrap_err("Lock failed")
    }

    /// Burn `value` on the child bridge; returns the id relayers sign under
    pub async fn burn(&self, value: U256) -> Result<RelayTxId> {
        let confirmed = self
            .child
            .send_transaction_sync(METHOD_BURN, U256::ZERO, 0, &[DynSolValue::Uint(value, 256)])
            .await
            .wrap_err("Burn failed")?;
        let topic = self.child.event_topic(EVENT_BURN)?;
        Ok(RelayTxId::compute(&confirmed.tx.hash, &topic))
    }
}

fn dispatch_ended(chain: &str, result: Result<()>) -> eyre::Report {
    match result {
        Ok(()) => {
            error!(chain, "Dispatch exited unexpectedly");
            eyre!("{} dispatch exited unexpectedly", chain)
        }
        Err(e) => {
            error!(chain, error = ?e, "Dispatch stopped with error");
            e
        }
    }
}
