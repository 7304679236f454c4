//! Decision and eligibility result types returned by the rule engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::constants;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionKind {
    NoAction,
    StartMatch,
    CancelMatch,
    FinishWithWinner,
    FinishWithWalkover,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WinnerSide {
    None,
    A,
    B,
}

/// Deterministic output of the rule engine. The worker applies and persists
/// this (status, winner, audit fields, hysteresis counters).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub kind: DecisionKind,
    pub winner_entity_id: Option<i64>,
    pub winner_side: WinnerSide,
    /// Stable reason code for auditing.
    pub reason_code: String,
    /// Human detail for logs; never used as a rule input.
    pub reason_detail: String,
    pub ruleset_version: String,
    /// Updated hysteresis counters. Returned on every ongoing decision so the
    /// caller can persist them even on `NoAction`.
    pub updated_out_cycles_a: Option<u32>,
    pub updated_out_cycles_b: Option<u32>,
}

impl Decision {
    pub fn no_action(detail: impl Into<String>, ruleset_version: &str) -> Self {
        Self {
            kind: DecisionKind::NoAction,
            winner_entity_id: None,
            winner_side: WinnerSide::None,
            reason_code: constants::RC_NO_ACTION.to_string(),
            reason_detail: detail.into(),
            ruleset_version: ruleset_version.to_string(),
            updated_out_cycles_a: None,
            updated_out_cycles_b: None,
        }
    }

    pub fn no_action_with_counters(
        detail: impl Into<String>,
        ruleset_version: &str,
        out_a: u32,
        out_b: u32,
    ) -> Self {
        Self {
            updated_out_cycles_a: Some(out_a),
            updated_out_cycles_b: Some(out_b),
            ..Self::no_action(detail, ruleset_version)
        }
    }

    pub fn start(detail: impl Into<String>, ruleset_version: &str) -> Self {
        Self {
            kind: DecisionKind::StartMatch,
            reason_code: constants::RC_LINEUP_OK.to_string(),
            ..Self::no_action(detail, ruleset_version)
        }
    }

    pub fn cancel(code: &str, detail: impl Into<String>, ruleset_version: &str) -> Self {
        Self {
            kind: DecisionKind::CancelMatch,
            reason_code: code.to_string(),
            ..Self::no_action(detail, ruleset_version)
        }
    }

    pub fn winner(
        winner_entity_id: i64,
        code: &str,
        detail: impl Into<String>,
        ruleset_version: &str,
        out_a: u32,
        out_b: u32,
    ) -> Self {
        Self {
            kind: DecisionKind::FinishWithWinner,
            winner_entity_id: Some(winner_entity_id),
            reason_code: code.to_string(),
            updated_out_cycles_a: Some(out_a),
            updated_out_cycles_b: Some(out_b),
            ..Self::no_action(detail, ruleset_version)
        }
    }

    pub fn walkover(
        code: &str,
        detail: impl Into<String>,
        ruleset_version: &str,
        out_a: u32,
        out_b: u32,
    ) -> Self {
        Self {
            kind: DecisionKind::FinishWithWalkover,
            reason_code: code.to_string(),
            updated_out_cycles_a: Some(out_a),
            updated_out_cycles_b: Some(out_b),
            ..Self::no_action(detail, ruleset_version)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EligibilityReason {
    Ok,
    MissingSymbol,
    SnapshotEmpty,
    SideANotInSnapshot,
    SideBNotInSnapshot,
    BothNotInSnapshot,
}

/// Explainable lineup eligibility, mainly consulted before a start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EligibilityResult {
    pub is_eligible: bool,
    pub reason: EligibilityReason,
    pub reason_detail: String,
    pub side_a_in_snapshot: bool,
    pub side_b_in_snapshot: bool,
    pub side_a_rank: Option<u32>,
    pub side_b_rank: Option<u32>,
    pub snapshot_time: DateTime<Utc>,
    pub ruleset_version: String,
}

impl EligibilityResult {
    pub fn eligible(
        snapshot_time: DateTime<Utc>,
        a_rank: Option<u32>,
        b_rank: Option<u32>,
        ruleset_version: &str,
    ) -> Self {
        Self {
            is_eligible: true,
            reason: EligibilityReason::Ok,
            reason_detail: String::new(),
            side_a_in_snapshot: true,
            side_b_in_snapshot: true,
            side_a_rank: a_rank,
            side_b_rank: b_rank,
            snapshot_time,
            ruleset_version: ruleset_version.to_string(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn not_eligible(
        reason: EligibilityReason,
        detail: impl Into<String>,
        a_in: bool,
        b_in: bool,
        a_rank: Option<u32>,
        b_rank: Option<u32>,
        snapshot_time: DateTime<Utc>,
        ruleset_version: &str,
    ) -> Self {
        Self {
            is_eligible: false,
            reason,
            reason_detail: detail.into(),
            side_a_in_snapshot: a_in,
            side_b_in_snapshot: b_in,
            side_a_rank: a_rank,
            side_b_rank: b_rank,
            snapshot_time,
            ruleset_version: ruleset_version.to_string(),
        }
    }
}
