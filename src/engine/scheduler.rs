//! Control loop.
//!
//! One cycle at a time: snapshot, decide, execute. Between cycles the loop
//! waits on either a fixed interval or a rate poll, and that wait is the
//! only place a stop request is observed. A cycle that errors or panics is
//! logged, broadcast and counted; the loop carries on with the next one.

use alloy::primitives::U256;
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info, warn};

use super::decision::{decide, RebalancePolicy};
use super::executor::{ExecutionReport, RebalanceExecutor};
use super::snapshot::Snapshot;
use crate::chain::{ChainReader, ChainWriter};
use crate::config::{Deployment, SchedulerConfig, TriggerMode};
use crate::status::StatusBroadcaster;
use crate::types::{CyclePhase, PoolId, RebalanceAction, WalletLookup};

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Time source for the loop's waits and timestamps.
#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);

    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock backed by `tokio::time`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// When cycles run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Run a cycle, then wait `every`.
    Interval { every: Duration },
    /// Poll both rates every `poll`; run a cycle when one changed, or when
    /// the previous cycle failed or lacked data.
    RateChange { poll: Duration },
}

impl Schedule {
    pub fn from_config(cfg: &SchedulerConfig) -> Self {
        match cfg.mode {
            TriggerMode::Interval => Schedule::Interval {
                every: Duration::from_secs(cfg.interval_secs),
            },
            TriggerMode::RateChange => Schedule::RateChange {
                poll: Duration::from_secs(cfg.rate_poll_secs),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Loop state
// ---------------------------------------------------------------------------

/// What the loop exposes to the status API.
#[derive(Debug, Clone)]
pub struct LoopState {
    pub phase: CyclePhase,
    pub cycle_count: u64,
    pub failed_cycles: u64,
    pub rebalances: u64,
    pub last_snapshot: Option<Snapshot>,
    pub last_action: Option<RebalanceAction>,
    pub last_execution: Option<ExecutionReport>,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl LoopState {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            phase: CyclePhase::Idle,
            cycle_count: 0,
            failed_cycles: 0,
            rebalances: 0,
            last_snapshot: None,
            last_action: None,
            last_execution: None,
            last_error: None,
            started_at,
        }
    }
}

pub type SharedState = Arc<RwLock<LoopState>>;

/// How a cycle ended, short of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The factory lookup failed or no wallet is deployed yet.
    NoWallet,
    /// A rate or position could not be read.
    IncompleteData,
    /// Everything is zero.
    NoFunds,
    Hold,
    Rebalanced,
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle: u64,
    pub outcome: CycleOutcome,
    pub action: RebalanceAction,
    pub execution: Option<ExecutionReport>,
}

// ---------------------------------------------------------------------------
// Agent loop
// ---------------------------------------------------------------------------

pub struct AgentLoop {
    reader: Arc<dyn ChainReader>,
    executor: RebalanceExecutor,
    deployment: Deployment,
    agent_id: U256,
    policy: RebalancePolicy,
    schedule: Schedule,
    clock: Arc<dyn Clock>,
    status: Arc<StatusBroadcaster>,
    state: SharedState,
}

impl AgentLoop {
    pub fn new(
        reader: Arc<dyn ChainReader>,
        writer: Arc<dyn ChainWriter>,
        deployment: Deployment,
        agent_id: U256,
        status: Arc<StatusBroadcaster>,
    ) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock);
        let state = Arc::new(RwLock::new(LoopState::new(clock.now())));
        let executor =
            RebalanceExecutor::new(writer, reader.clone(), deployment, agent_id, status.clone());
        Self {
            reader,
            executor,
            deployment,
            agent_id,
            policy: RebalancePolicy::default(),
            schedule: Schedule::Interval {
                every: Duration::from_secs(10),
            },
            clock,
            status,
            state,
        }
    }

    pub fn with_policy(mut self, policy: RebalancePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Handle for the status API.
    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    async fn set_phase(&self, phase: CyclePhase) {
        self.state.write().await.phase = phase;
    }

    /// Run cycles until `shutdown` fires (or its sender is dropped).
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        self.status.publish("--- Autonomous Yield Agent Starting ---");
        self.status
            .publish(format!("Controlling Agent ID: {}", self.agent_id));
        self.status
            .publish(format!("Pool A: {}", self.deployment.pool_a));
        self.status
            .publish(format!("Pool B: {}", self.deployment.pool_b));
        info!(schedule = ?self.schedule, policy = ?self.policy, "Entering main loop");

        match self.schedule {
            Schedule::Interval { every } => loop {
                self.guarded_cycle().await;
                if self.wait(every, &mut shutdown).await {
                    break;
                }
            },
            Schedule::RateChange { poll } => {
                let mut last = [None, None];
                let mut unsettled = false;
                loop {
                    let changed = self.rates_changed(&mut last).await;
                    if changed || unsettled {
                        if !changed {
                            self.status
                                .publish("Previous cycle did not settle. Checking again.");
                        }
                        unsettled = !self.guarded_cycle().await.is_some_and(|report| {
                            report.outcome != CycleOutcome::IncompleteData
                        });
                    }
                    if self.wait(poll, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        let state = self.state.read().await;
        info!(
            cycles = state.cycle_count,
            failed = state.failed_cycles,
            rebalances = state.rebalances,
            "Agent loop stopped"
        );
    }

    /// Idle wait. Returns true when a stop was requested.
    async fn wait(&self, duration: Duration, shutdown: &mut broadcast::Receiver<()>) -> bool {
        tokio::select! {
            biased;
            _ = shutdown.recv() => {
                info!("Stop requested");
                true
            }
            _ = self.clock.sleep(duration) => false,
        }
    }

    /// Poll both rates and announce changes. An unreadable rate is not a
    /// change; the first successful read is.
    async fn rates_changed(&self, last: &mut [Option<U256>; 2]) -> bool {
        let mut changed = false;
        for (slot, pool) in last.iter_mut().zip(PoolId::ALL) {
            let Some(rate) = self.reader.read_rate(self.deployment.pool(pool)).await else {
                continue;
            };
            if *slot != Some(rate) {
                self.status.publish(format!("{pool} rate changed to {rate}"));
                *slot = Some(rate);
                changed = true;
            }
        }
        changed
    }

    /// Run one cycle and contain whatever goes wrong inside it.
    pub async fn guarded_cycle(&self) -> Option<CycleReport> {
        let result = AssertUnwindSafe(self.run_cycle()).catch_unwind().await;
        let failure = match result {
            Ok(Ok(report)) => {
                info!(
                    cycle = report.cycle,
                    outcome = ?report.outcome,
                    action = %report.action,
                    "Cycle complete"
                );
                self.set_phase(CyclePhase::Idle).await;
                return Some(report);
            }
            Ok(Err(e)) => e.to_string(),
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                format!("cycle panicked: {detail}")
            }
        };

        let cycle = {
            let mut state = self.state.write().await;
            state.phase = CyclePhase::Idle;
            state.failed_cycles += 1;
            state.last_error = Some(failure.clone());
            state.cycle_count
        };
        error!(cycle, error = %failure, "Cycle failed, continuing");
        self.status
            .publish(format!("An error occurred in the main loop: {failure}"));
        None
    }

    /// Snapshot, decide, and execute once.
    ///
    /// Errors only when a rebalance was attempted and did not complete.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let cycle = {
            let mut state = self.state.write().await;
            state.cycle_count += 1;
            state.phase = CyclePhase::Reading;
            state.cycle_count
        };

        self.status.publish(format!(
            "-- Checking pools at {}",
            self.clock.now().format("%H:%M:%S")
        ));

        let snapshot = Snapshot::take(self.reader.as_ref(), &self.deployment, self.agent_id).await;
        self.status.publish(snapshot.rates_line());
        {
            let mut state = self.state.write().await;
            state.last_snapshot = Some(snapshot.clone());
            state.last_action = Some(RebalanceAction::NoOp);
            state.last_execution = None;
        }

        let report = |outcome| CycleReport {
            cycle,
            outcome,
            action: RebalanceAction::NoOp,
            execution: None,
        };

        let wallet = match snapshot.wallet {
            Some(WalletLookup::Deployed(wallet)) => wallet,
            Some(WalletLookup::Undeployed) => {
                self.status.publish(format!(
                    "Agent {} has no wallet deployed. Standing by.",
                    self.agent_id
                ));
                return Ok(report(CycleOutcome::NoWallet));
            }
            None => {
                self.status
                    .publish("Could not look up the agent wallet. Skipping this cycle.");
                return Ok(report(CycleOutcome::NoWallet));
            }
        };

        self.status.publish(snapshot.balances_line());

        if !snapshot.is_complete() {
            self.status
                .publish("Incomplete pool data this cycle. No action taken.");
            return Ok(report(CycleOutcome::IncompleteData));
        }

        let holds_funds = [snapshot.position_a, snapshot.position_b, snapshot.idle_balance]
            .iter()
            .any(|v| v.is_some_and(|v| !v.is_zero()));
        if !holds_funds {
            self.status
                .publish("Agent has no funds deposited. Standing by.");
            return Ok(report(CycleOutcome::NoFunds));
        }

        self.set_phase(CyclePhase::Deciding).await;
        let action = decide(&snapshot, self.policy);
        self.state.write().await.last_action = Some(action);

        let RebalanceAction::MoveToPool { source, dest, .. } = action else {
            self.status.publish("Decision: Stay in current position.");
            return Ok(report(CycleOutcome::Hold));
        };

        self.status
            .publish(format!("Decision: Move funds from {source} to {dest}"));
        info!(cycle, %action, "Rebalancing");

        self.set_phase(CyclePhase::Executing).await;
        let execution = self.executor.execute(wallet, action).await;
        let completed = execution.completed;
        let failure = execution.failure().map(|f| f.to_string());
        {
            let mut state = self.state.write().await;
            state.last_execution = Some(execution.clone());
            if completed {
                state.rebalances += 1;
            }
        }

        if !completed {
            let reason = failure.unwrap_or_else(|| "unknown step failure".to_string());
            warn!(cycle, %action, "Rebalance did not complete");
            bail!("Rebalance {action} aborted: {reason}");
        }

        Ok(CycleReport {
            cycle,
            outcome: CycleOutcome::Rebalanced,
            action,
            execution: Some(execution),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
