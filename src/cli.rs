//! Command-line interface and the operator's one-shot chain writes.
//!
//! `run` starts the agent loop. The other subcommands are the manual
//! actions a user would otherwise take from the dashboard; they go through
//! the same `ChainWriter` and wait for each receipt.

use alloy::primitives::{Address, U256};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};

use crate::chain::{ChainReader, ChainWriter, ContractCall, Receipt};
use crate::config::Deployment;
use crate::types::PoolId;

/// Autonomous two-pool yield agent: watches reward rates and moves the
/// agent wallet's funds to the better pool.
#[derive(Debug, Parser)]
#[command(name = "yield-agent", version, about)]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, short = 'c', default_value = "config.toml", global = true)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Cli {
    /// `run` when no subcommand is given.
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Run the rebalancing loop (default)
    Run,

    /// Read rates and positions once, print the decision, write nothing
    Snapshot,

    /// Set a pool's reward rate (pool owner, or the agent if its wallet owns the pool)
    SetRate {
        /// Pool to update: a or b
        #[arg(long)]
        pool: PoolId,

        /// New reward rate
        #[arg(long)]
        rate: u128,
    },

    /// Deploy a new agent wallet delegated to an operator
    DeployAgent {
        /// Operator address allowed to relay calls for the agent
        #[arg(long)]
        operator: Address,
    },

    /// Mint tokens to the sender and deposit them into the configured agent
    Fund {
        /// Amount in token base units
        #[arg(long)]
        amount: u128,
    },

    /// Approve and deposit the sender's own tokens straight into a pool
    DepositPool {
        /// Pool to deposit into: a or b
        #[arg(long)]
        pool: PoolId,

        /// Amount in token base units
        #[arg(long)]
        amount: u128,
    },

    /// Mint demo tokens to an address
    Mint {
        /// Recipient
        #[arg(long)]
        to: Address,

        /// Amount in token base units
        #[arg(long)]
        amount: u128,
    },
}

impl Command {
    /// The contract calls this command submits, in order.
    ///
    /// Empty for `run` and `snapshot`. `set-rate` asks the pool who owns it:
    /// a pool owned by the agent wallet takes the agent-owner entry point.
    pub async fn plan(
        &self,
        reader: &dyn ChainReader,
        deployment: &Deployment,
        agent_id: U256,
        sender: Address,
    ) -> Vec<ContractCall> {
        match self {
            Command::Run | Command::Snapshot => Vec::new(),
            Command::SetRate { pool, rate } => {
                let pool = deployment.pool(*pool);
                let rate = U256::from(*rate);
                if agent_owns_pool(reader, pool, agent_id).await {
                    vec![ContractCall::SetRewardRateByAgentOwner {
                        pool,
                        agent_id,
                        rate,
                    }]
                } else {
                    vec![ContractCall::SetRewardRate { pool, rate }]
                }
            }
            Command::DepositPool { pool, amount } => {
                let pool = deployment.pool(*pool);
                let amount = U256::from(*amount);
                vec![
                    ContractCall::ApproveToken {
                        token: deployment.token,
                        spender: pool,
                        amount,
                    },
                    ContractCall::DepositPool { pool, amount },
                ]
            }
            Command::DeployAgent { operator } => vec![ContractCall::DeployAgent {
                factory: deployment.factory,
                operator: *operator,
            }],
            Command::Fund { amount } => {
                let amount = U256::from(*amount);
                vec![
                    ContractCall::Mint {
                        token: deployment.token,
                        to: sender,
                        amount,
                    },
                    ContractCall::ApproveToken {
                        token: deployment.token,
                        spender: deployment.factory,
                        amount,
                    },
                    ContractCall::FundAgent {
                        factory: deployment.factory,
                        agent_id,
                        amount,
                    },
                ]
            }
            Command::Mint { to, amount } => vec![ContractCall::Mint {
                token: deployment.token,
                to: *to,
                amount: U256::from(*amount),
            }],
        }
    }
}

/// Whether `pool.owner()` is the agent's wallet. An unreadable owner or
/// wallet counts as not owned.
async fn agent_owns_pool(reader: &dyn ChainReader, pool: Address, agent_id: U256) -> bool {
    let (owner, wallet) = tokio::join!(
        reader.read_pool_owner(pool),
        reader.read_wallet_address(agent_id)
    );
    match (owner, wallet.and_then(|w| w.address())) {
        (Some(owner), Some(wallet)) => owner == wallet,
        (None, _) => {
            warn!(%pool, "Pool owner unknown; using setRewardRate");
            false
        }
        _ => false,
    }
}

/// Submit and confirm each call of `command` in order, stopping at the
/// first failure.
pub async fn run_admin(
    reader: &dyn ChainReader,
    writer: &dyn ChainWriter,
    deployment: &Deployment,
    agent_id: U256,
    command: &Command,
) -> Result<Vec<Receipt>> {
    let calls = command
        .plan(reader, deployment, agent_id, writer.sender())
        .await;
    let mut receipts = Vec::with_capacity(calls.len());

    for call in calls {
        let label = call.label();
        let receipt = writer
            .send_and_confirm(call)
            .await
            .with_context(|| format!("{label} failed"))?;
        info!(
            call = label,
            tx = %receipt.hash,
            block = ?receipt.block_number,
            "Admin call confirmed"
        );
        receipts.push(receipt);
    }

    Ok(receipts)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
