//! Chain boundary.
//!
//! Defines the `ChainReader` and `ChainWriter` traits the control loop is
//! written against, the call vocabulary the writer understands, and the
//! alloy-backed implementations in `reader` and `writer`.

pub mod contracts;
pub mod reader;
pub mod writer;

use alloy::primitives::{Address, TxHash, U256};
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

use crate::types::WalletLookup;

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

/// Point-in-time view reads.
///
/// Every method returns `None` when the read failed (network error, revert,
/// malformed response). Implementations log the failure; callers treat
/// `None` as "unknown this cycle" and never retry within the cycle.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// `pool.rewardRate()`
    async fn read_rate(&self, pool: Address) -> Option<U256>;

    /// `pool.balanceOf(wallet)`
    async fn read_position(&self, wallet: Address, pool: Address) -> Option<U256>;

    /// `factory.agentIdToWallet(agentId)`
    async fn read_wallet_address(&self, agent_id: U256) -> Option<WalletLookup>;

    /// `token.balanceOf(wallet)`
    async fn read_idle_balance(&self, wallet: Address) -> Option<U256>;

    /// `factory.agentIdToOperator(agentId)`
    async fn read_operator(&self, agent_id: U256) -> Option<Address>;

    /// `pool.owner()`
    async fn read_pool_owner(&self, pool: Address) -> Option<Address>;
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

/// How relayed calls reach the agent wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayMode {
    /// `factory.execute(agentId, target, calldata)`
    Direct,
    /// `factory.execute(agentId, wallet, wallet.execute(target, 0, calldata))`
    #[default]
    Wallet,
}

/// An action performed by the agent wallet itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalletAction {
    Withdraw { pool: Address, amount: U256 },
    Approve { token: Address, spender: Address, amount: U256 },
    Deposit { pool: Address, amount: U256 },
}

impl WalletAction {
    /// The contract the wallet ends up calling.
    pub fn target(&self) -> Address {
        match self {
            WalletAction::Withdraw { pool, .. } | WalletAction::Deposit { pool, .. } => *pool,
            WalletAction::Approve { token, .. } => *token,
        }
    }
}

/// A state-changing call submitted from the operator key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractCall {
    /// Routed through the factory relay on behalf of the agent wallet.
    Relayed {
        agent_id: U256,
        wallet: Address,
        action: WalletAction,
    },
    /// `token.mint(to, amount)`
    Mint { token: Address, to: Address, amount: U256 },
    /// `token.approve(spender, amount)` from the sender's own balance.
    ApproveToken { token: Address, spender: Address, amount: U256 },
    /// `pool.setRewardRate(rate)`
    SetRewardRate { pool: Address, rate: U256 },
    /// `pool.setRewardRateByAgentOwner(agentId, rate)`, for pools owned by
    /// the agent wallet.
    SetRewardRateByAgentOwner {
        pool: Address,
        agent_id: U256,
        rate: U256,
    },
    /// `pool.deposit(amount)` from the sender's own balance.
    DepositPool { pool: Address, amount: U256 },
    /// `factory.deployAgent(operator)`
    DeployAgent { factory: Address, operator: Address },
    /// `factory.deposit(agentId, amount)`
    FundAgent { factory: Address, agent_id: U256, amount: U256 },
}

impl ContractCall {
    /// Short label used in logs and failure messages.
    pub fn label(&self) -> &'static str {
        match self {
            ContractCall::Relayed { action, .. } => match action {
                WalletAction::Withdraw { .. } => "withdraw",
                WalletAction::Approve { .. } => "approve",
                WalletAction::Deposit { .. } => "deposit",
            },
            ContractCall::Mint { .. } => "mint",
            ContractCall::ApproveToken { .. } => "approve",
            ContractCall::SetRewardRate { .. } => "setRewardRate",
            ContractCall::SetRewardRateByAgentOwner { .. } => "setRewardRateByAgentOwner",
            ContractCall::DepositPool { .. } => "depositPool",
            ContractCall::DeployAgent { .. } => "deployAgent",
            ContractCall::FundAgent { .. } => "fundAgent",
        }
    }
}

/// Handle to a submitted, not yet confirmed, transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxHandle {
    pub hash: TxHash,
    pub nonce: u64,
    pub label: &'static str,
}

impl fmt::Display for TxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (nonce {}, {})", self.label, self.nonce, self.hash)
    }
}

/// A mined, successful transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub hash: TxHash,
    pub block_number: Option<u64>,
    pub gas_used: u64,
}

/// Why a write step did not complete.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepFailure {
    #[error("{label} rejected before mining: {reason}")]
    Submit { label: &'static str, reason: String },

    #[error("{label} tx reverted (hash: {hash})")]
    Reverted { label: &'static str, hash: TxHash },

    #[error("{label} not confirmed after {waited:?} (hash: {hash})")]
    Timeout {
        label: &'static str,
        hash: TxHash,
        waited: Duration,
    },

    #[error("{label} receipt lookup failed (hash: {hash}): {reason}")]
    Receipt {
        label: &'static str,
        hash: TxHash,
        reason: String,
    },

    #[error("{0}")]
    Precondition(String),
}

/// Submits calls and waits for them to be mined.
///
/// `submit` returns once the node accepted the transaction; `confirm`
/// suspends until it is mined, reverted or timed out. Callers confirm each
/// call before submitting the next one of the same sequence.
#[async_trait]
pub trait ChainWriter: Send + Sync {
    async fn submit(&self, call: ContractCall) -> Result<TxHandle, StepFailure>;

    async fn confirm(&self, handle: &TxHandle) -> Result<Receipt, StepFailure>;

    /// The sending address (operator key).
    fn sender(&self) -> Address;

    /// Submit then confirm.
    async fn send_and_confirm(&self, call: ContractCall) -> Result<Receipt, StepFailure> {
        let handle = self.submit(call).await?;
        self.confirm(&handle).await
    }
}

/// Short `0x1234...abcd` form for status lines.
pub fn short_addr(addr: &Address) -> String {
    let s = format!("{addr}");
    if s.len() > 10 {
        format!("{}...{}", &s[..6], &s[s.len() - 4..])
    } else {
        s
    }
}
