//! Dashboard route handlers.
//!
//! `/api/status` returns JSON built from the loop state; token amounts are
//! decimal strings and anything not known yet is `null`. `/ws` streams
//! status lines as WebSocket text frames.

use alloy::primitives::U256;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::Response,
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::engine::executor::{ExecutionReport, StepOutcome};
use crate::engine::scheduler::SharedState;
use crate::status::{StatusBroadcaster, WELCOME};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Shared state accessible by all route handlers.
pub struct DashboardState {
    pub agent_id: U256,
    pub loop_state: SharedState,
    pub status: Arc<StatusBroadcaster>,
}

impl DashboardState {
    pub fn new(agent_id: U256, loop_state: SharedState, status: Arc<StatusBroadcaster>) -> Self {
        Self {
            agent_id,
            loop_state,
            status,
        }
    }
}

pub type AppState = Arc<DashboardState>;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct PoolFigures {
    pub pool_a: Option<String>,
    pub pool_b: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepSummary {
    pub step: String,
    pub pool: String,
    pub amount: String,
    /// `confirmed`, `failed` or `skipped`.
    pub outcome: String,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    pub action: String,
    pub completed: bool,
    pub steps: Vec<StepSummary>,
}

impl From<&ExecutionReport> for ExecutionSummary {
    fn from(report: &ExecutionReport) -> Self {
        let steps = report
            .steps
            .iter()
            .map(|s| {
                let (outcome, tx_hash, error) = match &s.outcome {
                    StepOutcome::Confirmed(r) => ("confirmed", Some(r.hash.to_string()), None),
                    StepOutcome::Failed(f) => ("failed", None, Some(f.to_string())),
                    StepOutcome::Skipped => ("skipped", None, None),
                };
                StepSummary {
                    step: s.kind.to_string(),
                    pool: s.pool.to_string(),
                    amount: s.amount.to_string(),
                    outcome: outcome.to_string(),
                    tx_hash,
                    error,
                }
            })
            .collect();
        Self {
            action: report.action.to_string(),
            completed: report.completed,
            steps,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub agent_id: String,
    pub phase: String,
    pub cycle_count: u64,
    pub failed_cycles: u64,
    pub rebalances: u64,
    pub uptime_secs: i64,
    pub wallet: Option<String>,
    pub rates: PoolFigures,
    pub positions: PoolFigures,
    pub idle_balance: Option<String>,
    pub snapshot_at: Option<String>,
    pub last_action: Option<String>,
    pub last_execution: Option<ExecutionSummary>,
    pub last_error: Option<String>,
    pub observers: usize,
}

fn amount(value: Option<U256>) -> Option<String> {
    value.map(|v| v.to_string())
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /api/status
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let observers = state.status.observer_count();
    let agent = state.loop_state.read().await;
    let snapshot = agent.last_snapshot.as_ref();
    let uptime = (chrono::Utc::now() - agent.started_at).num_seconds();

    Json(StatusResponse {
        agent_id: state.agent_id.to_string(),
        phase: agent.phase.to_string(),
        cycle_count: agent.cycle_count,
        failed_cycles: agent.failed_cycles,
        rebalances: agent.rebalances,
        uptime_secs: uptime,
        wallet: snapshot
            .and_then(|s| s.wallet_address())
            .map(|w| w.to_string()),
        rates: PoolFigures {
            pool_a: amount(snapshot.and_then(|s| s.rate_a)),
            pool_b: amount(snapshot.and_then(|s| s.rate_b)),
        },
        positions: PoolFigures {
            pool_a: amount(snapshot.and_then(|s| s.position_a)),
            pool_b: amount(snapshot.and_then(|s| s.position_b)),
        },
        idle_balance: amount(snapshot.and_then(|s| s.idle_balance)),
        snapshot_at: snapshot.map(|s| s.taken_at.to_rfc3339()),
        last_action: agent.last_action.map(|a| a.to_string()),
        last_execution: agent.last_execution.as_ref().map(ExecutionSummary::from),
        last_error: agent.last_error.clone(),
        observers,
    })
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// GET /ws
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| stream_status(socket, state))
}

/// Pump status lines to one client until it closes or falls behind.
/// Text it sends is relayed to every other observer.
async fn stream_status(socket: WebSocket, state: AppState) {
    let mut observer = state.status.connect();
    let id = observer.id();
    let (mut sink, mut inbound) = socket.split();

    if sink.send(Message::Text(WELCOME.to_string())).await.is_ok() {
        loop {
            tokio::select! {
                line = observer.next() => match line {
                    Some(msg) => {
                        if sink.send(Message::Text(msg.text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                frame = inbound.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        state.status.relay(id, text);
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    debug!(observer = %id, "WebSocket closed");
    state.status.disconnect(id);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
