//! Yield agent entry point.
//!
//! Loads configuration, initialises structured logging, checks the
//! deployment against the chain, then either runs the rebalancing loop or a
//! one-shot operator command.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use yield_agent::chain::reader::EvmReader;
use yield_agent::chain::writer::{ConfirmPolicy, EvmWriter};
use yield_agent::chain::ChainReader;
use yield_agent::cli::{self, Cli, Command};
use yield_agent::config::{AppConfig, Deployment, OperatorKey};
use yield_agent::dashboard::{self, DashboardState};
use yield_agent::engine::decision::decide;
use yield_agent::engine::scheduler::{AgentLoop, Schedule};
use yield_agent::engine::snapshot::{display_or_unknown, Snapshot};
use yield_agent::status::StatusBroadcaster;
use yield_agent::types::{AgentError, PoolId};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cli = Cli::parse();
    init_logging();

    let config_path = cli.config.to_string_lossy().to_string();
    let cfg = AppConfig::load(&config_path)?;
    cfg.validate()?;

    let deployment = cfg.deployment()?;
    let agent_id = cfg.agent_id();
    let reader = Arc::new(EvmReader::new(&cfg.chain.rpc_url, deployment)?);

    // Read-only: no key needed.
    let command = cli.command();
    if command == Command::Snapshot {
        return print_snapshot(reader.as_ref(), &deployment, &cfg).await;
    }

    let key = cfg.operator_key()?;
    info!(
        agent_name = %cfg.agent.name,
        %agent_id,
        operator = %key.address(),
        rpc = %cfg.chain.rpc_url,
        "Yield agent starting up"
    );

    match command {
        Command::Run => {
            preflight(&reader, &deployment, &cfg, &key).await?;
            run_agent(cfg, deployment, key, reader).await
        }
        admin => {
            let writer = build_writer(&cfg, &key, &deployment)?;
            let receipts =
                cli::run_admin(reader.as_ref(), &writer, &deployment, agent_id, &admin).await?;
            for receipt in receipts {
                println!(
                    "Transaction confirmed! Hash: {} Block number: {}",
                    receipt.hash,
                    receipt
                        .block_number
                        .map_or_else(|| "pending".to_string(), |b| b.to_string())
                );
            }
            Ok(())
        }
    }
}

/// Refuse to start against a deployment the agent cannot operate.
async fn preflight(
    reader: &EvmReader,
    deployment: &Deployment,
    cfg: &AppConfig,
    key: &OperatorKey,
) -> Result<()> {
    let chain_id = reader
        .chain_id()
        .await
        .map_err(|e| AgentError::Startup(e.to_string()))?;
    if let Some(expected) = cfg.chain.chain_id {
        if expected != chain_id {
            return Err(AgentError::Config(format!(
                "RPC reports chain id {chain_id}, config expects {expected}"
            ))
            .into());
        }
    }
    info!(chain_id, "Connected to chain");

    for (name, address) in deployment.named() {
        let has_code = reader
            .has_code(address)
            .await
            .map_err(|e| AgentError::Startup(e.to_string()))?;
        if !has_code {
            return Err(AgentError::MissingContract {
                name: name.to_string(),
                address,
            }
            .into());
        }
    }

    let agent_id = cfg.agent_id();
    let on_chain = reader
        .read_operator(agent_id)
        .await
        .ok_or_else(|| AgentError::Startup(format!("could not read operator for agent {agent_id}")))?;
    if on_chain != key.address() {
        return Err(AgentError::OperatorMismatch {
            agent_id,
            configured: key.address(),
            on_chain,
        }
        .into());
    }

    match reader.read_wallet_address(agent_id).await.and_then(|w| w.address()) {
        Some(wallet) => info!(%agent_id, %wallet, "Agent wallet resolved"),
        None => warn!(%agent_id, "Agent wallet not deployed yet; the loop will stand by"),
    }

    Ok(())
}

fn build_writer(cfg: &AppConfig, key: &OperatorKey, deployment: &Deployment) -> Result<EvmWriter> {
    EvmWriter::new(
        &cfg.chain.rpc_url,
        key,
        deployment.factory,
        cfg.chain.relay,
        cfg.chain.chain_id,
        ConfirmPolicy {
            timeout: cfg.confirm_timeout(),
            poll_interval: cfg.confirm_poll(),
        },
    )
    .context("Failed to build transaction writer")
}

async fn run_agent(
    cfg: AppConfig,
    deployment: Deployment,
    key: OperatorKey,
    reader: Arc<EvmReader>,
) -> Result<()> {
    let writer = Arc::new(build_writer(&cfg, &key, &deployment)?);
    let status = Arc::new(StatusBroadcaster::default());
    let agent_id = cfg.agent_id();

    let agent = AgentLoop::new(reader, writer, deployment, agent_id, status.clone())
        .with_policy(cfg.agent.policy)
        .with_schedule(Schedule::from_config(&cfg.scheduler));

    if cfg.status.enabled {
        let state = Arc::new(DashboardState::new(agent_id, agent.state(), status.clone()));
        dashboard::spawn_dashboard(state, cfg.status.port).await?;
    }

    let (stop_tx, stop_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received. Stopping after the current cycle."),
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl+C; stopping"),
        }
        let _ = stop_tx.send(());
    });

    info!("Entering main loop. Press Ctrl+C to stop.");
    agent.run(stop_rx).await;
    info!("Yield agent shut down cleanly.");
    Ok(())
}

/// One read + decide pass, printed to stdout.
async fn print_snapshot(reader: &EvmReader, deployment: &Deployment, cfg: &AppConfig) -> Result<()> {
    let agent_id = cfg.agent_id();
    let snapshot = Snapshot::take(reader, deployment, agent_id).await;
    println!("{}", snapshot.rates_line());
    for pool in PoolId::ALL {
        let address = deployment.pool(pool);
        let (total, owner) = tokio::join!(
            reader.read_total_supply(address),
            reader.read_pool_owner(address)
        );
        println!(
            "{pool}: total deposits {}, owner {}",
            display_or_unknown(total),
            display_or_unknown(owner)
        );
    }
    println!(
        "Agent {agent_id} owner: {}",
        display_or_unknown(reader.read_agent_owner(agent_id).await)
    );
    match snapshot.wallet_address() {
        Some(wallet) => {
            println!("Agent wallet: {wallet}");
            println!("{}", snapshot.balances_line());
        }
        None => println!("Agent wallet: not available"),
    }
    println!("Decision: {}", decide(&snapshot, cfg.agent.policy));
    Ok(())
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("yield_agent=info"));

    let json_logging = std::env::var("YIELD_AGENT_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
