//! In-memory chain for integration testing.
//!
//! Implements both `ChainReader` and `ChainWriter` over a tiny model of the
//! token, the two pools and the agent factory. Submitted calls take effect
//! when confirmed, the way a mined transaction would. Reads, rejections,
//! reverts and timeouts can be forced per call label.

use alloy::primitives::{Address, TxHash, U256};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use yield_agent::chain::{
    ChainReader, ChainWriter, ContractCall, Receipt, StepFailure, TxHandle, WalletAction,
};
use yield_agent::config::Deployment;
use yield_agent::types::{PoolId, WalletLookup};

pub const OPERATOR: Address = Address::new([0x0e; 20]);
pub const WALLET: Address = Address::new([0x77; 20]);

pub fn deployment() -> Deployment {
    Deployment {
        token: Address::repeat_byte(0x10),
        pool_a: Address::repeat_byte(0xaa),
        pool_b: Address::repeat_byte(0xbb),
        factory: Address::repeat_byte(0xfa),
    }
}

/// How a forced failure shows up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Node refuses the transaction.
    Reject,
    /// Mined with status 0.
    Revert,
    /// Never mined within the wait.
    Timeout,
}

#[derive(Default)]
struct Ledger {
    rates: [U256; 2],
    /// (holder, pool index) -> deposited balance
    pool_balances: HashMap<(Address, usize), U256>,
    tokens: HashMap<Address, U256>,
    allowances: HashMap<(Address, Address), U256>,
    wallet: Option<Address>,
    operator: Address,
    pool_owners: [Address; 2],
    block: u64,
    nonce: u64,
    pending: HashMap<TxHash, ContractCall>,
    /// Labels of every accepted submission, in order.
    submitted: Vec<&'static str>,
    failures: HashMap<&'static str, Failure>,
    unreadable_rates: [bool; 2],
}

pub struct MockChain {
    deployment: Deployment,
    ledger: Mutex<Ledger>,
}

impl MockChain {
    /// Agent 0 with a deployed wallet and the given rates and positions.
    pub fn new(rate_a: u64, rate_b: u64, position_a: u64, position_b: u64) -> Self {
        let mut ledger = Ledger {
            rates: [U256::from(rate_a), U256::from(rate_b)],
            wallet: Some(WALLET),
            operator: OPERATOR,
            pool_owners: [OPERATOR; 2],
            block: 100,
            ..Default::default()
        };
        ledger.pool_balances.insert((WALLET, 0), U256::from(position_a));
        ledger.pool_balances.insert((WALLET, 1), U256::from(position_b));
        Self {
            deployment: deployment(),
            ledger: Mutex::new(ledger),
        }
    }

    /// No agent wallet deployed yet.
    pub fn without_wallet(rate_a: u64, rate_b: u64) -> Self {
        let chain = Self::new(rate_a, rate_b, 0, 0);
        chain.ledger.lock().unwrap().wallet = None;
        chain
    }

    pub fn set_rate(&self, pool: PoolId, rate: u64) {
        self.ledger.lock().unwrap().rates[index(pool)] = U256::from(rate);
    }

    pub fn set_pool_owner(&self, pool: PoolId, owner: Address) {
        self.ledger.lock().unwrap().pool_owners[index(pool)] = owner;
    }

    pub fn fail(&self, label: &'static str, failure: Failure) {
        self.ledger.lock().unwrap().failures.insert(label, failure);
    }

    pub fn clear_failures(&self) {
        self.ledger.lock().unwrap().failures.clear();
    }

    pub fn set_rate_unreadable(&self, pool: PoolId, unreadable: bool) {
        self.ledger.lock().unwrap().unreadable_rates[index(pool)] = unreadable;
    }

    /// Simulate another actor moving the wallet's funds.
    pub fn set_position(&self, pool: PoolId, amount: u64) {
        self.ledger
            .lock()
            .unwrap()
            .pool_balances
            .insert((WALLET, index(pool)), U256::from(amount));
    }

    pub fn position(&self, pool: PoolId) -> U256 {
        let ledger = self.ledger.lock().unwrap();
        ledger
            .pool_balances
            .get(&(WALLET, index(pool)))
            .copied()
            .unwrap_or_default()
    }

    /// Deposited balance of any holder in `pool`.
    pub fn pool_balance(&self, holder: Address, pool: PoolId) -> U256 {
        let ledger = self.ledger.lock().unwrap();
        ledger
            .pool_balances
            .get(&(holder, index(pool)))
            .copied()
            .unwrap_or_default()
    }

    pub fn token_balance(&self, holder: Address) -> U256 {
        let ledger = self.ledger.lock().unwrap();
        ledger.tokens.get(&holder).copied().unwrap_or_default()
    }

    pub fn submitted(&self) -> Vec<&'static str> {
        self.ledger.lock().unwrap().submitted.clone()
    }

    pub fn wallet(&self) -> Option<Address> {
        self.ledger.lock().unwrap().wallet
    }

    fn pool_index(&self, pool: Address) -> Option<usize> {
        if pool == self.deployment.pool_a {
            Some(0)
        } else if pool == self.deployment.pool_b {
            Some(1)
        } else {
            None
        }
    }

    /// Apply a mined call. `false` means it reverted.
    fn apply(&self, ledger: &mut Ledger, call: &ContractCall) -> bool {
        match *call {
            ContractCall::Relayed { wallet, action, .. } => match action {
                WalletAction::Withdraw { pool, amount } => {
                    let Some(i) = self.pool_index(pool) else {
                        return false;
                    };
                    let held = ledger.pool_balances.entry((wallet, i)).or_default();
                    if *held < amount {
                        return false;
                    }
                    *held -= amount;
                    *ledger.tokens.entry(wallet).or_default() += amount;
                    true
                }
                WalletAction::Approve {
                    spender, amount, ..
                } => {
                    ledger.allowances.insert((wallet, spender), amount);
                    true
                }
                WalletAction::Deposit { pool, amount } => {
                    let Some(i) = self.pool_index(pool) else {
                        return false;
                    };
                    let allowance = ledger
                        .allowances
                        .get(&(wallet, pool))
                        .copied()
                        .unwrap_or_default();
                    let balance = ledger.tokens.get(&wallet).copied().unwrap_or_default();
                    if allowance < amount || balance < amount {
                        return false;
                    }
                    ledger.allowances.insert((wallet, pool), allowance - amount);
                    ledger.tokens.insert(wallet, balance - amount);
                    *ledger.pool_balances.entry((wallet, i)).or_default() += amount;
                    true
                }
            },
            ContractCall::Mint { to, amount, .. } => {
                *ledger.tokens.entry(to).or_default() += amount;
                true
            }
            ContractCall::ApproveToken {
                spender, amount, ..
            } => {
                ledger.allowances.insert((OPERATOR, spender), amount);
                true
            }
            // Only the owner may set the rate directly.
            ContractCall::SetRewardRate { pool, rate } => match self.pool_index(pool) {
                Some(i) if ledger.pool_owners[i] == OPERATOR => {
                    ledger.rates[i] = rate;
                    true
                }
                _ => false,
            },
            ContractCall::SetRewardRateByAgentOwner { pool, rate, .. } => {
                match (self.pool_index(pool), ledger.wallet) {
                    (Some(i), Some(wallet)) if ledger.pool_owners[i] == wallet => {
                        ledger.rates[i] = rate;
                        true
                    }
                    _ => false,
                }
            }
            ContractCall::DepositPool { pool, amount } => {
                let Some(i) = self.pool_index(pool) else {
                    return false;
                };
                let allowance = ledger
                    .allowances
                    .get(&(OPERATOR, pool))
                    .copied()
                    .unwrap_or_default();
                let balance = ledger.tokens.get(&OPERATOR).copied().unwrap_or_default();
                if allowance < amount || balance < amount {
                    return false;
                }
                ledger.allowances.insert((OPERATOR, pool), allowance - amount);
                ledger.tokens.insert(OPERATOR, balance - amount);
                *ledger.pool_balances.entry((OPERATOR, i)).or_default() += amount;
                true
            }
            ContractCall::DeployAgent { operator, .. } => {
                ledger.wallet = Some(WALLET);
                ledger.operator = operator;
                true
            }
            ContractCall::FundAgent {
                factory, amount, ..
            } => {
                let Some(wallet) = ledger.wallet else {
                    return false;
                };
                let allowance = ledger
                    .allowances
                    .get(&(OPERATOR, factory))
                    .copied()
                    .unwrap_or_default();
                let balance = ledger.tokens.get(&OPERATOR).copied().unwrap_or_default();
                if allowance < amount || balance < amount {
                    return false;
                }
                ledger.allowances.insert((OPERATOR, factory), allowance - amount);
                ledger.tokens.insert(OPERATOR, balance - amount);
                *ledger.tokens.entry(wallet).or_default() += amount;
                true
            }
        }
    }
}

fn index(pool: PoolId) -> usize {
    match pool {
        PoolId::A => 0,
        PoolId::B => 1,
    }
}

#[async_trait]
impl ChainReader for MockChain {
    async fn read_rate(&self, pool: Address) -> Option<U256> {
        let ledger = self.ledger.lock().unwrap();
        let i = self.pool_index(pool)?;
        if ledger.unreadable_rates[i] {
            return None;
        }
        Some(ledger.rates[i])
    }

    async fn read_position(&self, wallet: Address, pool: Address) -> Option<U256> {
        let ledger = self.ledger.lock().unwrap();
        let i = self.pool_index(pool)?;
        Some(ledger.pool_balances.get(&(wallet, i)).copied().unwrap_or_default())
    }

    async fn read_wallet_address(&self, _agent_id: U256) -> Option<WalletLookup> {
        let ledger = self.ledger.lock().unwrap();
        Some(WalletLookup::from_address(ledger.wallet.unwrap_or(Address::ZERO)))
    }

    async fn read_idle_balance(&self, wallet: Address) -> Option<U256> {
        let ledger = self.ledger.lock().unwrap();
        Some(ledger.tokens.get(&wallet).copied().unwrap_or_default())
    }

    async fn read_operator(&self, _agent_id: U256) -> Option<Address> {
        Some(self.ledger.lock().unwrap().operator)
    }

    async fn read_pool_owner(&self, pool: Address) -> Option<Address> {
        let i = self.pool_index(pool)?;
        Some(self.ledger.lock().unwrap().pool_owners[i])
    }
}

#[async_trait]
impl ChainWriter for MockChain {
    async fn submit(&self, call: ContractCall) -> Result<TxHandle, StepFailure> {
        let label = call.label();
        let mut ledger = self.ledger.lock().unwrap();
        if ledger.failures.get(label) == Some(&Failure::Reject) {
            return Err(StepFailure::Submit {
                label,
                reason: "replacement transaction underpriced".into(),
            });
        }
        let nonce = ledger.nonce;
        ledger.nonce += 1;
        let hash = TxHash::with_last_byte(nonce as u8 + 1);
        ledger.pending.insert(hash, call);
        ledger.submitted.push(label);
        Ok(TxHandle { hash, nonce, label })
    }

    async fn confirm(&self, handle: &TxHandle) -> Result<Receipt, StepFailure> {
        let mut ledger = self.ledger.lock().unwrap();
        let failure = ledger.failures.get(handle.label).copied();
        if failure == Some(Failure::Timeout) {
            return Err(StepFailure::Timeout {
                label: handle.label,
                hash: handle.hash,
                waited: Duration::from_secs(120),
            });
        }
        let Some(call) = ledger.pending.remove(&handle.hash) else {
            return Err(StepFailure::Receipt {
                label: handle.label,
                hash: handle.hash,
                reason: "unknown transaction".into(),
            });
        };
        ledger.block += 1;
        let block = ledger.block;

        if failure == Some(Failure::Revert) || !self.apply(&mut ledger, &call) {
            return Err(StepFailure::Reverted {
                label: handle.label,
                hash: handle.hash,
            });
        }
        Ok(Receipt {
            hash: handle.hash,
            block_number: Some(block),
            gas_used: 50_000,
        })
    }

    fn sender(&self) -> Address {
        OPERATOR
    }
}
