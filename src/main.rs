//! Bridge Relayer Node
//!
//! Relays parent-chain locks, child-chain burns and token state commits to
//! the child bridge multisig as this validator's partial executions.
//!
//! # Commands
//!
//! - `start` - attach to deployed contracts and relay until SIGINT/SIGTERM
//! - `deploy` - deploy both bridges and the token with `DEPLOY_SIGNERS`,
//!   or the relayer account alone when it is unset
//! - `lock` / `unlock` - user actions on the parent and child bridge
//! - `account` - print the relayer balance on both chains

use alloy::primitives::U256;
use clap::{Parser, Subcommand};
use eyre::{eyre, Result};
use tracing::info;

use bridge_relayer::{metrics, Bridge, Config};

#[derive(Parser)]
#[command(name = "bridge-relayer")]
#[command(about = "Parent/child chain bridge relayer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Relay events until interrupted
    Start,

    /// Deploy parent bridge, child bridge and token
    Deploy,

    /// Lock native value on the parent bridge
    Lock {
        /// Amount in wei
        #[arg(long)]
        value: U256,
    },

    /// Burn on the child bridge and print the relay id
    Unlock {
        /// Amount in wei
        #[arg(long)]
        value: U256,
    },

    /// Show the relayer account on both chains
    Account,
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    init_logging();

    let config = Config::load()?;
    info!(
        parent_rpc = %config.parent.rpc_url,
        child_rpc = %config.child.rpc_url,
        contracts = %config.contracts_path.display(),
        "Configuration loaded"
    );

    let bridge = Bridge::connect(&config).await?;
    bridge.log_account_info().await?;

    match cli.command {
        Commands::Start => start(&config, bridge).await?,
        Commands::Deploy => {
            let signers = bridge.deploy_signers(config.deploy_signers.as_deref());
            let deployed = bridge.deploy(&signers).await?;
            println!("PARENT_BRIDGE_ADDRESS={}", deployed.parent);
            println!("CHILD_BRIDGE_ADDRESS={}", deployed.child);
            println!("TOKEN_ADDRESS={}", deployed.token);
        }
        Commands::Lock { value } => {
            attach(&config, &bridge).await?;
            let confirmed = bridge.lock(value).await?;
            println!("{}", confirmed.tx.hash);
        }
        Commands::Unlock { value } => {
            attach(&config, &bridge).await?;
            let txid = bridge.burn(value).await?;
            println!("{}", txid);
        }
        Commands::Account => {
            println!("parent {}", bridge.parent_link().account_info().await?);
            println!("child {}", bridge.child_link().account_info().await?);
        }
    }

    Ok(())
}

async fn start(config: &Config, bridge: Bridge) -> Result<()> {
    attach(config, &bridge).await?;
    bridge.register_handlers()?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(()).await;
    });

    info!("Starting bridge relayer");
    let result = bridge.run(shutdown_rx).await;

    info!(metrics = %metrics::encode_text(), "Final metrics");
    info!("Bridge relayer stopped");
    result
}

async fn attach(config: &Config, bridge: &Bridge) -> Result<()> {
    let parent = config
        .parent
        .bridge_address
        .ok_or_else(|| eyre!("PARENT_BRIDGE_ADDRESS environment variable is required"))?;
    let child = config
        .child
        .bridge_address
        .ok_or_else(|| eyre!("CHILD_BRIDGE_ADDRESS environment variable is required"))?;
    bridge.attach(parent, child, config.token_address).await
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,bridge_relayer=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(filter)
        .init();
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}
