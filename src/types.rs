//! Shared types for the yield agent.
//!
//! These types form the data model used across all modules.
//! They are kept free of chain-client details so that the decision engine,
//! executor and status surfaces can depend on them without cycles.

use alloy::primitives::{Address, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Pools
// ---------------------------------------------------------------------------

/// One of the two yield pools the agent allocates between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolId {
    A,
    B,
}

impl PoolId {
    pub const ALL: [PoolId; 2] = [PoolId::A, PoolId::B];

    /// The other pool.
    pub fn other(&self) -> Self {
        match self {
            PoolId::A => PoolId::B,
            PoolId::B => PoolId::A,
        }
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolId::A => write!(f, "Pool A"),
            PoolId::B => write!(f, "Pool B"),
        }
    }
}

impl std::str::FromStr for PoolId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "a" | "pool_a" | "pool-a" => Ok(PoolId::A),
            "b" | "pool_b" | "pool-b" => Ok(PoolId::B),
            other => anyhow::bail!("Unknown pool '{other}' (expected 'a' or 'b')"),
        }
    }
}

/// Reward rate observed for a pool in one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolState {
    pub pool: PoolId,
    pub reward_rate: U256,
}

/// The agent wallet's balance inside one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AgentPosition {
    pub pool: PoolId,
    pub balance: U256,
}

// ---------------------------------------------------------------------------
// Agent wallet
// ---------------------------------------------------------------------------

/// Result of resolving an agent id to its custodial wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WalletLookup {
    Deployed(Address),
    /// The factory returned the zero address.
    Undeployed,
}

impl WalletLookup {
    pub fn from_address(address: Address) -> Self {
        if address == Address::ZERO {
            WalletLookup::Undeployed
        } else {
            WalletLookup::Deployed(address)
        }
    }

    pub fn address(&self) -> Option<Address> {
        match self {
            WalletLookup::Deployed(a) => Some(*a),
            WalletLookup::Undeployed => None,
        }
    }
}

/// The custodial account controlled by the operator key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentWallet {
    pub agent_id: U256,
    pub wallet: Address,
    /// Token balance held directly by the wallet (not deposited).
    pub idle_balance: Option<U256>,
}

// ---------------------------------------------------------------------------
// Rebalance action
// ---------------------------------------------------------------------------

/// What the decision engine wants done this cycle.
///
/// Recomputed from scratch every cycle; never queued or merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum RebalanceAction {
    NoOp,
    MoveToPool {
        source: PoolId,
        dest: PoolId,
        /// Amount withdrawn from `source`.
        amount: U256,
        /// Idle wallet funds added on top of `amount` when depositing.
        /// Always zero under the source-pool-only policy.
        idle_sweep: U256,
    },
}

impl RebalanceAction {
    pub fn is_noop(&self) -> bool {
        matches!(self, RebalanceAction::NoOp)
    }

    /// Total amount deposited into the destination pool.
    pub fn deposit_amount(&self) -> U256 {
        match self {
            RebalanceAction::NoOp => U256::ZERO,
            RebalanceAction::MoveToPool {
                amount, idle_sweep, ..
            } => amount.saturating_add(*idle_sweep),
        }
    }
}

impl fmt::Display for RebalanceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebalanceAction::NoOp => write!(f, "Stay in current position"),
            RebalanceAction::MoveToPool {
                source,
                dest,
                amount,
                idle_sweep,
            } if idle_sweep.is_zero() => {
                write!(f, "Move {amount} from {source} to {dest}")
            }
            RebalanceAction::MoveToPool {
                source,
                dest,
                amount,
                idle_sweep,
            } => write!(
                f,
                "Move {amount} from {source} plus {idle_sweep} idle to {dest}"
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Status messages
// ---------------------------------------------------------------------------

/// A single human-readable line on the status stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

impl LogMessage {
    pub fn now(text: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            text: text.into(),
        }
    }
}

impl fmt::Display for LogMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

// ---------------------------------------------------------------------------
// Loop phase
// ---------------------------------------------------------------------------

/// Where the control loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CyclePhase {
    Idle,
    Reading,
    Deciding,
    Executing,
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CyclePhase::Idle => write!(f, "IDLE"),
            CyclePhase::Reading => write!(f, "READING"),
            CyclePhase::Deciding => write!(f, "DECIDING"),
            CyclePhase::Executing => write!(f, "EXECUTING"),
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Fatal errors that must stop the agent before its first cycle.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid operator key: {0}")]
    InvalidKey(String),

    #[error("No contract code at {name} ({address})")]
    MissingContract { name: String, address: Address },

    #[error("Operator {configured} is not authorised for agent {agent_id} (on-chain operator: {on_chain})")]
    OperatorMismatch {
        agent_id: U256,
        configured: Address,
        on_chain: Address,
    },

    #[error("Chain unreachable during startup: {0}")]
    Startup(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
