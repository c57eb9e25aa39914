//! Decision engine: snapshot in, `RebalanceAction` out.
//!
//! A move is only proposed when the other pool's reward rate beats the
//! current one by more than 5% (relative), so noise-level differences never
//! cause funds to bounce between pools. Pure and deterministic: the same
//! snapshot always yields the same action.

use alloy::primitives::U256;
use serde::{Deserialize, Serialize};

use crate::engine::snapshot::Snapshot;
use crate::types::{PoolId, RebalanceAction};

/// `rate / 20` is the 5% hysteresis band.
pub const BAND_DIVISOR: u64 = 20;

/// Which funds a move carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalancePolicy {
    /// Move only the source pool's balance.
    #[default]
    SourcePoolOnly,
    /// Move the source pool's balance plus whatever sits idle in the wallet.
    Consolidate,
}

/// True when `candidate` beats `incumbent` by more than the band.
pub fn exceeds_band(candidate: U256, incumbent: U256) -> bool {
    let band = incumbent / U256::from(BAND_DIVISOR);
    candidate > incumbent.saturating_add(band)
}

/// Decide what to do with the agent's funds this cycle.
///
/// Any unknown rate or position yields `NoOp`.
pub fn decide(snapshot: &Snapshot, policy: RebalancePolicy) -> RebalanceAction {
    let (Some(rate_a), Some(rate_b), Some(position_a), Some(position_b)) = (
        snapshot.rate_a,
        snapshot.rate_b,
        snapshot.position_a,
        snapshot.position_b,
    ) else {
        return RebalanceAction::NoOp;
    };

    match policy {
        RebalancePolicy::SourcePoolOnly => {
            if !position_a.is_zero() && exceeds_band(rate_b, rate_a) {
                move_all(PoolId::A, position_a, U256::ZERO)
            } else if !position_b.is_zero() && exceeds_band(rate_a, rate_b) {
                move_all(PoolId::B, position_b, U256::ZERO)
            } else {
                RebalanceAction::NoOp
            }
        }
        RebalancePolicy::Consolidate => {
            let Some(idle) = snapshot.idle_balance else {
                return RebalanceAction::NoOp;
            };
            let (source, amount) = if exceeds_band(rate_b, rate_a) {
                (PoolId::A, position_a)
            } else if exceeds_band(rate_a, rate_b) {
                (PoolId::B, position_b)
            } else {
                return RebalanceAction::NoOp;
            };
            if amount.is_zero() && idle.is_zero() {
                RebalanceAction::NoOp
            } else {
                move_all(source, amount, idle)
            }
        }
    }
}

fn move_all(source: PoolId, amount: U256, idle_sweep: U256) -> RebalanceAction {
    RebalanceAction::MoveToPool {
        source,
        dest: source.other(),
        amount,
        idle_sweep,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
