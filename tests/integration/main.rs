//! End-to-end cycle scenarios against the in-memory chain.

mod mock_chain;

use alloy::primitives::U256;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use mock_chain::{deployment, Failure, MockChain, OPERATOR, WALLET};
use yield_agent::chain::StepFailure;
use yield_agent::cli::{run_admin, Command};
use yield_agent::engine::decision::RebalancePolicy;
use yield_agent::engine::executor::StepOutcome;
use yield_agent::engine::scheduler::{AgentLoop, Clock, CycleOutcome, Schedule};
use yield_agent::engine::snapshot::Snapshot;
use yield_agent::status::{Observer, StatusBroadcaster};
use yield_agent::types::{CyclePhase, PoolId, RebalanceAction};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Sleeps return at once. Runs `on_sleep(n)` before the n-th sleep and
/// requests a stop on sleep `stop_after`.
struct ScriptedClock {
    sleeps: AtomicUsize,
    stop_after: usize,
    stop: broadcast::Sender<()>,
    on_sleep: Box<dyn Fn(usize) + Send + Sync>,
}

impl ScriptedClock {
    fn new(
        stop_after: usize,
        on_sleep: impl Fn(usize) + Send + Sync + 'static,
    ) -> (Arc<Self>, broadcast::Receiver<()>) {
        let (stop, rx) = broadcast::channel(1);
        let clock = Arc::new(Self {
            sleeps: AtomicUsize::new(0),
            stop_after,
            stop,
            on_sleep: Box::new(on_sleep),
        });
        (clock, rx)
    }
}

#[async_trait]
impl Clock for ScriptedClock {
    async fn sleep(&self, _duration: Duration) {
        let n = self.sleeps.fetch_add(1, Ordering::SeqCst) + 1;
        (self.on_sleep)(n);
        if n >= self.stop_after {
            let _ = self.stop.send(());
            std::future::pending::<()>().await;
        }
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

fn agent(chain: &Arc<MockChain>, status: &Arc<StatusBroadcaster>) -> AgentLoop {
    AgentLoop::new(
        chain.clone(),
        chain.clone(),
        deployment(),
        U256::ZERO,
        status.clone(),
    )
}

fn drain(obs: &mut Observer) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(m) = obs.try_next() {
        lines.push(m.text);
    }
    lines
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_a_moves_everything_to_the_better_pool() {
    let chain = Arc::new(MockChain::new(100, 106, 1000, 0));
    let status = Arc::new(StatusBroadcaster::default());
    let mut obs = status.connect();
    let agent = agent(&chain, &status);

    let report = agent.run_cycle().await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::Rebalanced);
    assert_eq!(
        report.action,
        RebalanceAction::MoveToPool {
            source: PoolId::A,
            dest: PoolId::B,
            amount: U256::from(1000),
            idle_sweep: U256::ZERO,
        }
    );
    assert_eq!(chain.submitted(), vec!["withdraw", "approve", "deposit"]);

    // The next snapshot sees the funds in Pool B.
    let next = Snapshot::take(chain.as_ref(), &deployment(), U256::ZERO).await;
    assert_eq!(next.position_a, Some(U256::ZERO));
    assert_eq!(next.position_b, Some(U256::from(1000)));
    assert_eq!(next.idle_balance, Some(U256::ZERO));

    let lines = drain(&mut obs);
    assert!(lines.contains(&"Current rates: A: 100, B: 106".to_string()));
    assert!(lines.contains(&"Decision: Move funds from Pool A to Pool B".to_string()));
    assert!(lines.contains(&"Withdrew 1000 from Pool A".to_string()));
    assert!(lines.contains(&"Deposited 1000 to Pool B".to_string()));
    assert_eq!(lines.last().map(String::as_str), Some("Move complete!"));
}

#[tokio::test]
async fn scenario_b_four_percent_is_not_enough() {
    let chain = Arc::new(MockChain::new(100, 104, 1000, 0));
    let status = Arc::new(StatusBroadcaster::default());
    let agent = agent(&chain, &status);

    let report = agent.run_cycle().await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::Hold);
    assert!(chain.submitted().is_empty());
    assert_eq!(chain.position(PoolId::A), U256::from(1000));
}

#[tokio::test]
async fn scenario_c_failed_approve_leaves_funds_idle() {
    let chain = Arc::new(MockChain::new(100, 106, 1000, 0));
    chain.fail("approve", Failure::Revert);
    let status = Arc::new(StatusBroadcaster::default());
    let agent = agent(&chain, &status);

    let err = agent.run_cycle().await.unwrap_err();
    assert!(err.to_string().contains("approve tx reverted"));
    assert_eq!(chain.submitted(), vec!["withdraw", "approve"]);

    // Withdrawn but never deposited.
    assert_eq!(chain.position(PoolId::A), U256::ZERO);
    assert_eq!(chain.position(PoolId::B), U256::ZERO);
    assert_eq!(chain.token_balance(WALLET), U256::from(1000));

    let state = agent.state();
    let state = state.read().await;
    let exec = state.last_execution.as_ref().unwrap();
    assert!(!exec.completed);
    assert!(matches!(exec.steps[0].outcome, StepOutcome::Confirmed(_)));
    assert!(matches!(
        exec.steps[1].outcome,
        StepOutcome::Failed(StepFailure::Reverted { .. })
    ));
    assert_eq!(exec.steps[2].outcome, StepOutcome::Skipped);
}

#[tokio::test]
async fn stranded_idle_funds_stay_put_under_source_pool_policy() {
    let chain = Arc::new(MockChain::new(100, 106, 1000, 0));
    chain.fail("approve", Failure::Revert);
    let status = Arc::new(StatusBroadcaster::default());
    let agent = agent(&chain, &status);

    assert!(agent.guarded_cycle().await.is_none());
    chain.clear_failures();

    let report = agent.run_cycle().await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::Hold);
    assert_eq!(chain.token_balance(WALLET), U256::from(1000));
}

#[tokio::test]
async fn consolidate_policy_sweeps_stranded_funds() {
    let chain = Arc::new(MockChain::new(100, 106, 1000, 0));
    chain.fail("approve", Failure::Revert);
    let status = Arc::new(StatusBroadcaster::default());
    let agent = agent(&chain, &status).with_policy(RebalancePolicy::Consolidate);

    assert!(agent.guarded_cycle().await.is_none());
    chain.clear_failures();

    let report = agent.run_cycle().await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::Rebalanced);
    // Nothing left in Pool A, so only approve and deposit this time.
    assert_eq!(
        chain.submitted(),
        vec!["withdraw", "approve", "approve", "deposit"]
    );
    assert_eq!(chain.position(PoolId::B), U256::from(1000));
    assert_eq!(chain.token_balance(WALLET), U256::ZERO);
}

#[tokio::test]
async fn withdraw_rejection_submits_nothing_else() {
    let chain = Arc::new(MockChain::new(100, 200, 1000, 0));
    chain.fail("withdraw", Failure::Reject);
    let status = Arc::new(StatusBroadcaster::default());
    let agent = agent(&chain, &status);

    assert!(agent.run_cycle().await.is_err());
    assert!(chain.submitted().is_empty());
    assert_eq!(chain.position(PoolId::A), U256::from(1000));
}

#[tokio::test]
async fn confirmation_timeout_abandons_the_move() {
    let chain = Arc::new(MockChain::new(100, 200, 1000, 0));
    chain.fail("withdraw", Failure::Timeout);
    let status = Arc::new(StatusBroadcaster::default());
    let agent = agent(&chain, &status);

    let err = agent.run_cycle().await.unwrap_err();
    assert!(err.to_string().contains("not confirmed"));
    assert_eq!(chain.submitted(), vec!["withdraw"]);
}

#[tokio::test]
async fn cycle_rereads_balance_moved_by_someone_else() {
    let chain = Arc::new(MockChain::new(100, 200, 1000, 0));
    let status = Arc::new(StatusBroadcaster::default());
    let agent = agent(&chain, &status);

    let earlier = Snapshot::take(chain.as_ref(), &deployment(), U256::ZERO).await;
    assert_eq!(earlier.position_a, Some(U256::from(1000)));

    // Someone else withdraws part of Pool A; the cycle re-reads and moves
    // only what is actually there.
    chain.set_position(PoolId::A, 400);

    let report = agent.run_cycle().await.unwrap();
    assert_eq!(
        report.action,
        RebalanceAction::MoveToPool {
            source: PoolId::A,
            dest: PoolId::B,
            amount: U256::from(400),
            idle_sweep: U256::ZERO,
        }
    );
    assert_eq!(chain.position(PoolId::B), U256::from(400));
}

#[tokio::test]
async fn unreadable_rate_means_no_action() {
    let chain = Arc::new(MockChain::new(100, 300, 1000, 0));
    chain.set_rate_unreadable(PoolId::B, true);
    let status = Arc::new(StatusBroadcaster::default());
    let mut obs = status.connect();
    let agent = agent(&chain, &status);

    let report = agent.run_cycle().await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::IncompleteData);
    assert!(chain.submitted().is_empty());
    assert!(drain(&mut obs).contains(&"Current rates: A: 100, B: unknown".to_string()));
}

#[tokio::test]
async fn undeployed_agent_stands_by() {
    let chain = Arc::new(MockChain::without_wallet(100, 300));
    let status = Arc::new(StatusBroadcaster::default());
    let agent = agent(&chain, &status);

    let report = agent.run_cycle().await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::NoWallet);
    assert!(chain.submitted().is_empty());
}

#[tokio::test]
async fn no_oscillation_inside_the_band() {
    let chain = Arc::new(MockChain::new(100, 106, 1000, 0));
    let status = Arc::new(StatusBroadcaster::default());
    let agent = agent(&chain, &status);

    agent.run_cycle().await.unwrap();
    assert_eq!(chain.position(PoolId::B), U256::from(1000));

    // Pool A edges ahead, but by less than 5% of B.
    chain.set_rate(PoolId::A, 110);
    chain.set_rate(PoolId::B, 106);
    let report = agent.run_cycle().await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::Hold);
    assert_eq!(chain.submitted().len(), 3);
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn interval_loop_reacts_to_rate_change_and_stops_between_cycles() {
    let chain = Arc::new(MockChain::new(100, 100, 1000, 0));
    let status = Arc::new(StatusBroadcaster::default());
    let bump = chain.clone();
    let (clock, stop) = ScriptedClock::new(4, move |n| {
        if n == 2 {
            bump.set_rate(PoolId::B, 150);
        }
    });
    let agent = agent(&chain, &status).with_clock(clock);

    agent.run(stop).await;

    let state = agent.state();
    let state = state.read().await;
    assert_eq!(state.cycle_count, 4);
    assert_eq!(state.rebalances, 1);
    assert_eq!(state.failed_cycles, 0);
    assert_eq!(state.phase, CyclePhase::Idle);
    assert_eq!(chain.position(PoolId::B), U256::from(1000));
}

#[tokio::test]
async fn failed_cycle_does_not_stop_the_loop() {
    let chain = Arc::new(MockChain::new(100, 150, 1000, 0));
    chain.fail("withdraw", Failure::Reject);
    let status = Arc::new(StatusBroadcaster::default());
    let heal = chain.clone();
    let (clock, stop) = ScriptedClock::new(2, move |_| heal.clear_failures());
    let agent = agent(&chain, &status).with_clock(clock);

    agent.run(stop).await;

    let state = agent.state();
    let state = state.read().await;
    assert_eq!(state.cycle_count, 2);
    assert_eq!(state.failed_cycles, 1);
    assert_eq!(state.rebalances, 1);
    assert_eq!(chain.position(PoolId::B), U256::from(1000));
}

#[tokio::test]
async fn rate_change_mode_announces_and_cycles() {
    let chain = Arc::new(MockChain::new(100, 100, 1000, 0));
    let status = Arc::new(StatusBroadcaster::default());
    let mut obs = status.connect();
    let bump = chain.clone();
    let (clock, stop) = ScriptedClock::new(4, move |n| {
        if n == 1 {
            bump.set_rate(PoolId::B, 120);
        }
    });
    let agent = agent(&chain, &status)
        .with_clock(clock)
        .with_schedule(Schedule::RateChange {
            poll: Duration::from_secs(30),
        });

    agent.run(stop).await;

    let state = agent.state();
    assert_eq!(state.read().await.cycle_count, 2);
    assert_eq!(chain.position(PoolId::B), U256::from(1000));

    let lines = drain(&mut obs);
    assert!(lines.contains(&"Pool B rate changed to 120".to_string()));
    assert!(lines.contains(&"Move complete!".to_string()));
}

#[tokio::test]
async fn rate_change_mode_retries_a_failed_move_without_a_new_rate() {
    let chain = Arc::new(MockChain::new(100, 150, 1000, 0));
    chain.fail("withdraw", Failure::Reject);
    let status = Arc::new(StatusBroadcaster::default());
    let heal = chain.clone();
    let (clock, stop) = ScriptedClock::new(5, move |n| {
        if n == 1 {
            heal.clear_failures();
        }
    });
    let agent = agent(&chain, &status)
        .with_clock(clock)
        .with_schedule(Schedule::RateChange {
            poll: Duration::from_secs(30),
        });

    agent.run(stop).await;

    let state = agent.state();
    let state = state.read().await;
    assert_eq!(state.cycle_count, 2);
    assert_eq!(state.failed_cycles, 1);
    assert_eq!(state.rebalances, 1);
    assert_eq!(chain.position(PoolId::A), U256::ZERO);
    assert_eq!(chain.position(PoolId::B), U256::from(1000));
}

// ---------------------------------------------------------------------------
// Operator commands
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fund_then_consolidate_deposits_new_funds() {
    let chain = Arc::new(MockChain::new(100, 200, 0, 0));
    let status = Arc::new(StatusBroadcaster::default());

    run_admin(chain.as_ref(), chain.as_ref(), &deployment(), U256::ZERO, &Command::Fund { amount: 750 })
        .await
        .unwrap();
    assert_eq!(chain.token_balance(WALLET), U256::from(750));
    assert_eq!(chain.token_balance(OPERATOR), U256::ZERO);

    let agent = agent(&chain, &status).with_policy(RebalancePolicy::Consolidate);
    let report = agent.run_cycle().await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::Rebalanced);
    assert_eq!(chain.position(PoolId::B), U256::from(750));
}

#[tokio::test]
async fn set_rate_command_changes_the_decision() {
    let chain = Arc::new(MockChain::new(100, 100, 1000, 0));
    let status = Arc::new(StatusBroadcaster::default());

    run_admin(
        chain.as_ref(),
        chain.as_ref(),
        &deployment(),
        U256::ZERO,
        &Command::SetRate {
            pool: PoolId::B,
            rate: 200,
        },
    )
    .await
    .unwrap();

    let agent = agent(&chain, &status);
    let report = agent.run_cycle().await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::Rebalanced);
}

#[tokio::test]
async fn deploy_agent_makes_wallet_visible() {
    let chain = Arc::new(MockChain::without_wallet(100, 100));
    run_admin(
        chain.as_ref(),
        chain.as_ref(),
        &deployment(),
        U256::ZERO,
        &Command::DeployAgent { operator: OPERATOR },
    )
    .await
    .unwrap();
    assert_eq!(chain.wallet(), Some(WALLET));
}

#[tokio::test]
async fn set_rate_on_agent_owned_pool_goes_through_the_agent() {
    let chain = Arc::new(MockChain::new(100, 100, 1000, 0));
    chain.set_pool_owner(PoolId::B, WALLET);

    run_admin(
        chain.as_ref(),
        chain.as_ref(),
        &deployment(),
        U256::ZERO,
        &Command::SetRate {
            pool: PoolId::B,
            rate: 150,
        },
    )
    .await
    .unwrap();

    assert_eq!(chain.submitted(), vec!["setRewardRateByAgentOwner"]);
    let snapshot = Snapshot::take(chain.as_ref(), &deployment(), U256::ZERO).await;
    assert_eq!(snapshot.rate_b, Some(U256::from(150)));
}

#[tokio::test]
async fn deposit_pool_command_adds_operator_funds() {
    let chain = Arc::new(MockChain::new(100, 100, 0, 0));

    run_admin(
        chain.as_ref(),
        chain.as_ref(),
        &deployment(),
        U256::ZERO,
        &Command::Mint {
            to: OPERATOR,
            amount: 300,
        },
    )
    .await
    .unwrap();
    run_admin(
        chain.as_ref(),
        chain.as_ref(),
        &deployment(),
        U256::ZERO,
        &Command::DepositPool {
            pool: PoolId::A,
            amount: 300,
        },
    )
    .await
    .unwrap();

    assert_eq!(chain.submitted(), vec!["mint", "approve", "depositPool"]);
    assert_eq!(chain.pool_balance(OPERATOR, PoolId::A), U256::from(300));
    assert_eq!(chain.token_balance(OPERATOR), U256::ZERO);
    // The agent's own position is untouched.
    assert_eq!(chain.position(PoolId::A), U256::ZERO);
}
