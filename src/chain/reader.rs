//! Read-only chain access over JSON-RPC.
//!
//! Each read is a single `eth_call` against the latest state. Failures are
//! logged at `warn` and returned as `None`; nothing is cached.

use alloy::primitives::{Address, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

use super::contracts::{IAgentFactory, IDemoUsd, IYieldPool};
use super::{short_addr, ChainReader};
use crate::config::Deployment;
use crate::types::WalletLookup;

/// `ChainReader` backed by an alloy HTTP provider.
pub struct EvmReader {
    provider: DynProvider,
    deployment: Deployment,
}

impl EvmReader {
    pub fn new(rpc_url: &str, deployment: Deployment) -> Result<Self> {
        let provider = ProviderBuilder::new()
            .connect_http(
                rpc_url
                    .parse()
                    .with_context(|| format!("Invalid RPC URL: {rpc_url}"))?,
            )
            .erased();
        Ok(Self::with_provider(provider, deployment))
    }

    pub fn with_provider(provider: DynProvider, deployment: Deployment) -> Self {
        Self {
            provider,
            deployment,
        }
    }

    pub fn provider(&self) -> &DynProvider {
        &self.provider
    }

    /// Whether any bytecode is deployed at `address`.
    pub async fn has_code(&self, address: Address) -> Result<bool> {
        let code = self
            .provider
            .get_code_at(address)
            .await
            .with_context(|| format!("eth_getCode for {address}"))?;
        Ok(!code.is_empty())
    }

    pub async fn chain_id(&self) -> Result<u64> {
        self.provider.get_chain_id().await.context("eth_chainId")
    }

    /// `pool.totalSupply()`: everything deposited in the pool.
    pub async fn read_total_supply(&self, pool: Address) -> Option<U256> {
        let contract = IYieldPool::new(pool, &self.provider);
        match contract.totalSupply().call().await {
            Ok(total) => Some(total),
            Err(e) => {
                warn!(pool = %short_addr(&pool), error = %e, "totalSupply read failed");
                None
            }
        }
    }

    /// `factory.agentIdToOwner(agentId)`
    pub async fn read_agent_owner(&self, agent_id: U256) -> Option<Address> {
        let factory = IAgentFactory::new(self.deployment.factory, &self.provider);
        match factory.agentIdToOwner(agent_id).call().await {
            Ok(owner) => Some(owner),
            Err(e) => {
                warn!(%agent_id, error = %e, "agentIdToOwner read failed");
                None
            }
        }
    }
}

#[async_trait]
impl ChainReader for EvmReader {
    async fn read_rate(&self, pool: Address) -> Option<U256> {
        let contract = IYieldPool::new(pool, &self.provider);
        match contract.rewardRate().call().await {
            Ok(rate) => {
                debug!(pool = %short_addr(&pool), %rate, "rewardRate");
                Some(rate)
            }
            Err(e) => {
                warn!(pool = %short_addr(&pool), error = %e, "rewardRate read failed");
                None
            }
        }
    }

    async fn read_position(&self, wallet: Address, pool: Address) -> Option<U256> {
        let contract = IYieldPool::new(pool, &self.provider);
        match contract.balanceOf(wallet).call().await {
            Ok(balance) => Some(balance),
            Err(e) => {
                warn!(
                    pool = %short_addr(&pool),
                    wallet = %short_addr(&wallet),
                    error = %e,
                    "pool balanceOf read failed"
                );
                None
            }
        }
    }

    async fn read_wallet_address(&self, agent_id: U256) -> Option<WalletLookup> {
        let factory = IAgentFactory::new(self.deployment.factory, &self.provider);
        match factory.agentIdToWallet(agent_id).call().await {
            Ok(address) => Some(WalletLookup::from_address(address)),
            Err(e) => {
                warn!(%agent_id, error = %e, "agentIdToWallet read failed");
                None
            }
        }
    }

    async fn read_idle_balance(&self, wallet: Address) -> Option<U256> {
        let token = IDemoUsd::new(self.deployment.token, &self.provider);
        match token.balanceOf(wallet).call().await {
            Ok(balance) => Some(balance),
            Err(e) => {
                warn!(wallet = %short_addr(&wallet), error = %e, "token balanceOf read failed");
                None
            }
        }
    }

    async fn read_operator(&self, agent_id: U256) -> Option<Address> {
        let factory = IAgentFactory::new(self.deployment.factory, &self.provider);
        match factory.agentIdToOperator(agent_id).call().await {
            Ok(operator) => Some(operator),
            Err(e) => {
                warn!(%agent_id, error = %e, "agentIdToOperator read failed");
                None
            }
        }
    }

    async fn read_pool_owner(&self, pool: Address) -> Option<Address> {
        let contract = IYieldPool::new(pool, &self.provider);
        match contract.owner().call().await {
            Ok(owner) => Some(owner),
            Err(e) => {
                warn!(pool = %short_addr(&pool), error = %e, "pool owner read failed");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
