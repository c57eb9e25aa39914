//! Rate & position snapshot.
//!
//! Issues the per-cycle reads and assembles them into one view. A failed
//! read leaves its field `None`; the decision engine refuses to act on a
//! snapshot with gaps.

use alloy::primitives::{Address, U256};
use chrono::{DateTime, Utc};
use std::fmt;

use crate::chain::ChainReader;
use crate::config::Deployment;
use crate::types::{AgentPosition, AgentWallet, PoolId, PoolState, WalletLookup};

/// Everything the decision engine sees for one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub agent_id: U256,
    /// `None` when the factory lookup failed.
    pub wallet: Option<WalletLookup>,
    pub rate_a: Option<U256>,
    pub rate_b: Option<U256>,
    pub position_a: Option<U256>,
    pub position_b: Option<U256>,
    pub idle_balance: Option<U256>,
    pub taken_at: DateTime<Utc>,
}

impl Snapshot {
    /// Read rates, wallet, positions and idle balance for `agent_id`.
    ///
    /// Positions and idle balance are only read once the wallet is known to
    /// be deployed; otherwise they stay unknown.
    pub async fn take(reader: &dyn ChainReader, deployment: &Deployment, agent_id: U256) -> Self {
        let (rate_a, rate_b, wallet) = tokio::join!(
            reader.read_rate(deployment.pool_a),
            reader.read_rate(deployment.pool_b),
            reader.read_wallet_address(agent_id),
        );

        let (position_a, position_b, idle_balance) = match wallet.and_then(|w| w.address()) {
            Some(addr) => {
                tokio::join!(
                    reader.read_position(addr, deployment.pool_a),
                    reader.read_position(addr, deployment.pool_b),
                    reader.read_idle_balance(addr),
                )
            }
            None => (None, None, None),
        };

        Self {
            agent_id,
            wallet,
            rate_a,
            rate_b,
            position_a,
            position_b,
            idle_balance,
            taken_at: Utc::now(),
        }
    }

    pub fn rate(&self, pool: PoolId) -> Option<U256> {
        match pool {
            PoolId::A => self.rate_a,
            PoolId::B => self.rate_b,
        }
    }

    pub fn position(&self, pool: PoolId) -> Option<U256> {
        match pool {
            PoolId::A => self.position_a,
            PoolId::B => self.position_b,
        }
    }

    pub fn wallet_address(&self) -> Option<Address> {
        self.wallet.and_then(|w| w.address())
    }

    /// Pool states that were read successfully.
    pub fn pool_states(&self) -> Vec<PoolState> {
        PoolId::ALL
            .iter()
            .filter_map(|&pool| {
                self.rate(pool).map(|reward_rate| PoolState { pool, reward_rate })
            })
            .collect()
    }

    /// Positions that were read successfully.
    pub fn positions(&self) -> Vec<AgentPosition> {
        PoolId::ALL
            .iter()
            .filter_map(|&pool| self.position(pool).map(|balance| AgentPosition { pool, balance }))
            .collect()
    }

    pub fn agent_wallet(&self) -> Option<AgentWallet> {
        self.wallet_address().map(|wallet| AgentWallet {
            agent_id: self.agent_id,
            wallet,
            idle_balance: self.idle_balance,
        })
    }

    /// Both rates and both positions are known.
    pub fn is_complete(&self) -> bool {
        self.rate_a.is_some()
            && self.rate_b.is_some()
            && self.position_a.is_some()
            && self.position_b.is_some()
    }

    /// Positions plus idle balance, if all three are known.
    pub fn total_funds(&self) -> Option<U256> {
        Some(
            self.position_a?
                .saturating_add(self.position_b?)
                .saturating_add(self.idle_balance?),
        )
    }

    /// `Current rates: A: 100, B: 106`
    pub fn rates_line(&self) -> String {
        format!(
            "Current rates: A: {}, B: {}",
            display_or_unknown(self.rate_a),
            display_or_unknown(self.rate_b)
        )
    }

    /// `Agent wallet balance: 0, Pool A: 1000, Pool B: 0`
    pub fn balances_line(&self) -> String {
        format!(
            "Agent wallet balance: {}, Pool A: {}, Pool B: {}",
            display_or_unknown(self.idle_balance),
            display_or_unknown(self.position_a),
            display_or_unknown(self.position_b)
        )
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} | {}", self.rates_line(), self.balances_line())
    }
}

pub fn display_or_unknown<T: fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "unknown".to_string(), |v| v.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
