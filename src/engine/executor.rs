//! Rebalance executor.
//!
//! Turns a `MoveToPool` action into the withdraw → approve → deposit
//! sequence, relayed through the agent factory. Each step is confirmed
//! before the next one is submitted. The first failure ends the sequence;
//! nothing is rolled back, the next cycle re-reads whatever state the chain
//! is actually in.

use alloy::primitives::{Address, U256};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::chain::{ChainReader, ChainWriter, ContractCall, Receipt, StepFailure, WalletAction};
use crate::config::Deployment;
use crate::status::StatusBroadcaster;
use crate::types::{PoolId, RebalanceAction};

// ---------------------------------------------------------------------------
// Execution report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Withdraw,
    Approve,
    Deposit,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Withdraw => write!(f, "withdraw"),
            StepKind::Approve => write!(f, "approve"),
            StepKind::Deposit => write!(f, "deposit"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Confirmed(Receipt),
    Failed(StepFailure),
    /// Not attempted: an earlier step failed, or there was nothing to do.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub kind: StepKind,
    pub pool: PoolId,
    pub amount: U256,
    pub outcome: StepOutcome,
}

/// What happened to one rebalance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub action: RebalanceAction,
    pub steps: Vec<StepRecord>,
    /// Every required step was confirmed.
    pub completed: bool,
}

impl ExecutionReport {
    fn empty(action: RebalanceAction) -> Self {
        Self {
            action,
            steps: Vec::new(),
            completed: true,
        }
    }

    /// The step failure that ended the sequence, if any.
    pub fn failure(&self) -> Option<&StepFailure> {
        self.steps.iter().find_map(|s| match &s.outcome {
            StepOutcome::Failed(f) => Some(f),
            _ => None,
        })
    }

    pub fn confirmed(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, StepOutcome::Confirmed(_)))
            .count()
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct RebalanceExecutor {
    writer: Arc<dyn ChainWriter>,
    reader: Arc<dyn ChainReader>,
    deployment: Deployment,
    agent_id: U256,
    status: Arc<StatusBroadcaster>,
}

impl RebalanceExecutor {
    pub fn new(
        writer: Arc<dyn ChainWriter>,
        reader: Arc<dyn ChainReader>,
        deployment: Deployment,
        agent_id: U256,
        status: Arc<StatusBroadcaster>,
    ) -> Self {
        Self {
            writer,
            reader,
            deployment,
            agent_id,
            status,
        }
    }

    /// Run the step sequence for `action` on behalf of `wallet`.
    pub async fn execute(&self, wallet: Address, action: RebalanceAction) -> ExecutionReport {
        let RebalanceAction::MoveToPool {
            source,
            dest,
            amount,
            ..
        } = action
        else {
            return ExecutionReport::empty(action);
        };
        let deposit = action.deposit_amount();
        if deposit.is_zero() {
            return ExecutionReport::empty(action);
        }

        let source_pool = self.deployment.pool(source);
        let dest_pool = self.deployment.pool(dest);

        info!(
            agent_id = %self.agent_id,
            %source,
            %dest,
            %amount,
            %deposit,
            "Executing rebalance"
        );

        let plan = [
            (StepKind::Withdraw, source, amount),
            (StepKind::Approve, dest, deposit),
            (StepKind::Deposit, dest, deposit),
        ];
        let mut steps = Vec::with_capacity(plan.len());
        let mut failed = false;

        for (kind, pool, step_amount) in plan {
            if failed {
                steps.push(StepRecord {
                    kind,
                    pool,
                    amount: step_amount,
                    outcome: StepOutcome::Skipped,
                });
                continue;
            }

            let wallet_action = match kind {
                StepKind::Withdraw => {
                    if step_amount.is_zero() {
                        steps.push(StepRecord {
                            kind,
                            pool,
                            amount: step_amount,
                            outcome: StepOutcome::Skipped,
                        });
                        continue;
                    }
                    if let Err(f) = self.check_source(wallet, source, source_pool, step_amount).await {
                        self.report_failure(&f);
                        steps.push(StepRecord {
                            kind,
                            pool,
                            amount: step_amount,
                            outcome: StepOutcome::Failed(f),
                        });
                        failed = true;
                        continue;
                    }
                    WalletAction::Withdraw {
                        pool: source_pool,
                        amount: step_amount,
                    }
                }
                StepKind::Approve => WalletAction::Approve {
                    token: self.deployment.token,
                    spender: dest_pool,
                    amount: step_amount,
                },
                StepKind::Deposit => WalletAction::Deposit {
                    pool: dest_pool,
                    amount: step_amount,
                },
            };

            let call = ContractCall::Relayed {
                agent_id: self.agent_id,
                wallet,
                action: wallet_action,
            };
            let outcome = match self.run_step(call).await {
                Ok(receipt) => {
                    self.status.publish(done_line(kind, step_amount, pool));
                    StepOutcome::Confirmed(receipt)
                }
                Err(f) => {
                    self.report_failure(&f);
                    failed = true;
                    StepOutcome::Failed(f)
                }
            };
            steps.push(StepRecord {
                kind,
                pool,
                amount: step_amount,
                outcome,
            });
        }

        if failed {
            self.status
                .publish("Move aborted. Remaining steps skipped; next cycle will re-check.");
        } else {
            self.status.publish("Move complete!");
        }

        ExecutionReport {
            action,
            steps,
            completed: !failed,
        }
    }

    /// The source pool must still hold at least `amount` right before the
    /// withdraw is submitted.
    async fn check_source(
        &self,
        wallet: Address,
        source: PoolId,
        pool: Address,
        amount: U256,
    ) -> Result<(), StepFailure> {
        match self.reader.read_position(wallet, pool).await {
            Some(balance) if balance >= amount => Ok(()),
            Some(balance) => Err(StepFailure::Precondition(format!(
                "{source} balance {balance} no longer covers withdraw of {amount}"
            ))),
            None => Err(StepFailure::Precondition(format!(
                "{source} balance could not be re-read before withdraw"
            ))),
        }
    }

    async fn run_step(&self, call: ContractCall) -> Result<Receipt, StepFailure> {
        let handle = self.writer.submit(call).await?;
        self.status
            .publish(format!("Transaction sent! Hash: {}", handle.hash));
        let receipt = self.writer.confirm(&handle).await?;
        let block = receipt
            .block_number
            .map_or_else(|| "pending".to_string(), |b| b.to_string());
        self.status
            .publish(format!("Transaction confirmed! Block number: {block}"));
        Ok(receipt)
    }

    fn report_failure(&self, failure: &StepFailure) {
        warn!(agent_id = %self.agent_id, error = %failure, "Rebalance step failed");
        self.status.publish(format!("Execution failed: {failure}"));
    }
}

fn done_line(kind: StepKind, amount: U256, pool: PoolId) -> String {
    match kind {
        StepKind::Withdraw => format!("Withdrew {amount} from {pool}"),
        StepKind::Approve => format!("Approved {amount} for {pool}"),
        StepKind::Deposit => format!("Deposited {amount} to {pool}"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
