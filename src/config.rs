//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! The operator key is referenced by env-var name in the config and
//! resolved at startup. Everything is validated before the first cycle:
//! a missing address or a bad key stops the process, it never degrades.

use alloy::primitives::{Address, U256};
use alloy::signers::local::PrivateKeySigner;
use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::chain::RelayMode;
use crate::engine::decision::RebalancePolicy;
use crate::types::{AgentError, PoolId};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub chain: ChainConfig,
    pub contracts: ContractsConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    pub name: String,
    pub agent_id: u64,
    /// Name of the env var holding the operator's hex private key.
    pub operator_key_env: String,
    #[serde(default)]
    pub policy: RebalancePolicy,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainConfig {
    pub rpc_url: String,
    #[serde(default)]
    pub chain_id: Option<u64>,
    #[serde(default = "default_confirm_timeout")]
    pub confirm_timeout_secs: u64,
    #[serde(default = "default_confirm_poll")]
    pub confirm_poll_ms: u64,
    #[serde(default)]
    pub relay: RelayMode,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContractsConfig {
    pub token: String,
    pub pool_a: String,
    pub pool_b: String,
    pub factory: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Fixed delay between cycles.
    #[default]
    Interval,
    /// Poll rates and only cycle when one of them moved.
    RateChange,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub mode: TriggerMode,
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_rate_poll")]
    pub rate_poll_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: TriggerMode::default(),
            interval_secs: default_interval(),
            rate_poll_secs: default_rate_poll(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StatusConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            port: default_port(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_port() -> u16 {
    8080
}

fn default_confirm_timeout() -> u64 {
    120
}

fn default_confirm_poll() -> u64 {
    1000
}

fn default_interval() -> u64 {
    10
}

fn default_rate_poll() -> u64 {
    30
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// Parse every address in `[contracts]`.
    pub fn deployment(&self) -> Result<Deployment, AgentError> {
        Ok(Deployment {
            token: parse_address("token", &self.contracts.token)?,
            pool_a: parse_address("pool_a", &self.contracts.pool_a)?,
            pool_b: parse_address("pool_b", &self.contracts.pool_b)?,
            factory: parse_address("factory", &self.contracts.factory)?,
        })
    }

    /// Read the operator key from the configured env var.
    pub fn operator_key(&self) -> Result<OperatorKey, AgentError> {
        let raw = Self::resolve_env(&self.agent.operator_key_env)
            .map_err(|e| AgentError::Config(e.to_string()))?;
        OperatorKey::parse(SecretString::new(raw))
    }

    pub fn agent_id(&self) -> U256 {
        U256::from(self.agent.agent_id)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.chain.confirm_timeout_secs)
    }

    pub fn confirm_poll(&self) -> Duration {
        Duration::from_millis(self.chain.confirm_poll_ms)
    }

    /// Reject values that would make the loop spin or never confirm.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.chain.rpc_url.trim().is_empty() {
            return Err(AgentError::Config("chain.rpc_url is empty".into()));
        }
        if self.scheduler.interval_secs == 0 || self.scheduler.rate_poll_secs == 0 {
            return Err(AgentError::Config(
                "scheduler intervals must be at least one second".into(),
            ));
        }
        if self.chain.confirm_timeout_secs == 0 {
            return Err(AgentError::Config("chain.confirm_timeout_secs must be > 0".into()));
        }
        let deployment = self.deployment()?;
        if deployment.pool_a == deployment.pool_b {
            return Err(AgentError::Config("pool_a and pool_b must differ".into()));
        }
        Ok(())
    }
}

fn parse_address(name: &str, raw: &str) -> Result<Address, AgentError> {
    let address: Address = raw
        .trim()
        .parse()
        .map_err(|e| AgentError::Config(format!("contracts.{name} = '{raw}' is not an address: {e}")))?;
    if address == Address::ZERO {
        return Err(AgentError::Config(format!("contracts.{name} is the zero address")));
    }
    Ok(address)
}

// ---------------------------------------------------------------------------
// Resolved deployment
// ---------------------------------------------------------------------------

/// Contract addresses the agent talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deployment {
    pub token: Address,
    pub pool_a: Address,
    pub pool_b: Address,
    pub factory: Address,
}

impl Deployment {
    pub fn pool(&self, pool: PoolId) -> Address {
        match pool {
            PoolId::A => self.pool_a,
            PoolId::B => self.pool_b,
        }
    }

    /// (name, address) pairs, for startup code checks and logging.
    pub fn named(&self) -> [(&'static str, Address); 4] {
        [
            ("token", self.token),
            ("pool_a", self.pool_a),
            ("pool_b", self.pool_b),
            ("factory", self.factory),
        ]
    }
}

// ---------------------------------------------------------------------------
// Operator key
// ---------------------------------------------------------------------------

/// The delegated operator's signing key.
pub struct OperatorKey {
    secret: SecretString,
    address: Address,
}

impl OperatorKey {
    pub fn parse(secret: SecretString) -> Result<Self, AgentError> {
        let signer = Self::signer_from(&secret)?;
        Ok(Self {
            address: signer.address(),
            secret,
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn signer(&self) -> Result<PrivateKeySigner, AgentError> {
        Self::signer_from(&self.secret)
    }

    fn signer_from(secret: &SecretString) -> Result<PrivateKeySigner, AgentError> {
        let raw = secret.expose_secret().trim();
        let hex = raw.strip_prefix("0x").unwrap_or(raw);
        hex.parse::<PrivateKeySigner>()
            .map_err(|e| AgentError::InvalidKey(e.to_string()))
    }
}

impl std::fmt::Debug for OperatorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorKey")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
