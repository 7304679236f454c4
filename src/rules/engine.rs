//! The concrete rule engine: pre-start cancellation and post-start KO/WO.
//!
//! A single rule set exists today; `ruleset_version` is stamped on every
//! decision so persisted outcomes stay auditable if the rules ever change.

use chrono::{DateTime, Utc};

use crate::models::{GainerEntry, Snapshot};

use super::constants;
use super::decision::{Decision, EligibilityReason, EligibilityResult};

#[derive(Debug, Clone)]
pub struct MatchRuleEngine {
    out_confirm_cycles: u32,
    cancel_if_invalid_at_start: bool,
    ruleset_version: String,
}

impl Default for MatchRuleEngine {
    fn default() -> Self {
        Self::new(
            constants::DEFAULT_OUT_CONFIRM_CYCLES,
            constants::DEFAULT_CANCEL_IF_INVALID_AT_START,
            constants::DEFAULT_RULESET_VERSION,
        )
    }
}

impl MatchRuleEngine {
    pub fn new(
        out_confirm_cycles: u32,
        cancel_if_invalid_at_start: bool,
        ruleset_version: &str,
    ) -> Self {
        Self {
            out_confirm_cycles: out_confirm_cycles.max(1),
            cancel_if_invalid_at_start,
            ruleset_version: if ruleset_version.trim().is_empty() {
                constants::DEFAULT_RULESET_VERSION.to_string()
            } else {
                ruleset_version.to_string()
            },
        }
    }

    pub fn ruleset_version(&self) -> &str {
        &self.ruleset_version
    }

    /// Classify whether a lineup (A/B) could start against the given snapshot.
    /// Pure classification, no side effects.
    pub fn evaluate_eligibility(
        &self,
        symbol_a: &str,
        symbol_b: &str,
        snapshot: &Snapshot,
        now: DateTime<Utc>,
    ) -> EligibilityResult {
        if symbol_a.trim().is_empty() || symbol_b.trim().is_empty() {
            return EligibilityResult::not_eligible(
                EligibilityReason::MissingSymbol,
                format!("snapshot={now:?} missing symbol A='{symbol_a}' B='{symbol_b}'"),
                false,
                false,
                None,
                None,
                now,
                &self.ruleset_version,
            );
        }

        if snapshot.is_empty() {
            return EligibilityResult::not_eligible(
                EligibilityReason::SnapshotEmpty,
                format!("snapshot={now:?} ranked snapshot empty"),
                false,
                false,
                None,
                None,
                now,
                &self.ruleset_version,
            );
        }

        let a = find(snapshot, symbol_a);
        let b = find(snapshot, symbol_b);

        let a_in = a.is_some();
        let b_in = b.is_some();

        // Rank 0 means the producer had no rank; report it as absent.
        let a_rank = a.map(|e| e.rank).filter(|r| *r > 0);
        let b_rank = b.map(|e| e.rank).filter(|r| *r > 0);

        if a_in && b_in {
            return EligibilityResult::eligible(now, a_rank, b_rank, &self.ruleset_version);
        }

        let reason = match (a_in, b_in) {
            (false, false) => EligibilityReason::BothNotInSnapshot,
            (false, true) => EligibilityReason::SideANotInSnapshot,
            _ => EligibilityReason::SideBNotInSnapshot,
        };

        let detail = format!(
            "snapshot={now:?} A={symbol_a} in={a_in} rank={a_rank:?} | B={symbol_b} in={b_in} rank={b_rank:?}"
        );

        EligibilityResult::not_eligible(
            reason,
            detail,
            a_in,
            b_in,
            a_rank,
            b_rank,
            now,
            &self.ruleset_version,
        )
    }

    /// Decide what to do with a Pending match: Start, Cancel, or NoAction.
    pub fn evaluate_pending(
        &self,
        symbol_a: &str,
        symbol_b: &str,
        snapshot: &Snapshot,
        now: DateTime<Utc>,
    ) -> Decision {
        // An empty snapshot is an external-data outage, never grounds to cancel.
        if snapshot.is_empty() {
            return Decision::no_action(
                format!("snapshot={now:?} {}", constants::RC_SNAPSHOT_EMPTY),
                &self.ruleset_version,
            );
        }

        let eligibility = self.evaluate_eligibility(symbol_a, symbol_b, snapshot, now);

        if eligibility.is_eligible {
            return Decision::start(eligibility.reason_detail, &self.ruleset_version);
        }

        // Ambiguous or incomplete input: leave the match alone.
        if matches!(
            eligibility.reason,
            EligibilityReason::MissingSymbol | EligibilityReason::SnapshotEmpty
        ) {
            return Decision::no_action(
                format!(
                    "snapshot={now:?} eligibility={:?} detail={}",
                    eligibility.reason, eligibility.reason_detail
                ),
                &self.ruleset_version,
            );
        }

        if !self.cancel_if_invalid_at_start {
            return Decision::no_action(
                format!(
                    "snapshot={now:?} invalid lineup but cancel_if_invalid_at_start=false | {}",
                    eligibility.reason_detail
                ),
                &self.ruleset_version,
            );
        }

        let code = match (
            eligibility.side_a_in_snapshot,
            eligibility.side_b_in_snapshot,
        ) {
            (false, false) => constants::RC_LINEUP_INVALID_BOTH_OUT,
            (false, true) => constants::RC_LINEUP_INVALID_A_OUT,
            _ => constants::RC_LINEUP_INVALID_B_OUT,
        };

        Decision::cancel(
            code,
            format!("snapshot={now:?} {}", eligibility.reason_detail),
            &self.ruleset_version,
        )
    }

    /// Decide what to do with an Ongoing match.
    ///
    /// The hysteresis counters are persisted on the match; updated values are
    /// returned in the decision on every branch so the caller can commit them
    /// even on `NoAction`.
    #[allow(clippy::too_many_arguments)]
    pub fn evaluate_ongoing(
        &self,
        entity_a_id: i64,
        entity_b_id: i64,
        symbol_a: &str,
        symbol_b: &str,
        score_a: i64,
        score_b: i64,
        out_cycles_a: u32,
        out_cycles_b: u32,
        snapshot: &Snapshot,
        now: DateTime<Utc>,
    ) -> Decision {
        if snapshot.is_empty() {
            // No snapshot: never finish a match over an external failure.
            // Counters are echoed back unchanged.
            return Decision::no_action_with_counters(
                format!("snapshot={now:?} {}", constants::RC_SNAPSHOT_EMPTY),
                &self.ruleset_version,
                out_cycles_a,
                out_cycles_b,
            );
        }

        let a_in_now = is_in(snapshot, symbol_a);
        let b_in_now = is_in(snapshot, symbol_b);

        // Anti-flap counters
        let new_out_a = if a_in_now { 0 } else { out_cycles_a + 1 };
        let new_out_b = if b_in_now { 0 } else { out_cycles_b + 1 };

        let a_out_confirmed = new_out_a >= self.out_confirm_cycles;
        let b_out_confirmed = new_out_b >= self.out_confirm_cycles;

        if !a_out_confirmed && !b_out_confirmed {
            return Decision::no_action_with_counters(
                format!(
                    "snapshot={now:?} A_in={a_in_now} B_in={b_in_now} A_out_cycles={new_out_a} B_out_cycles={new_out_b}"
                ),
                &self.ruleset_version,
                new_out_a,
                new_out_b,
            );
        }

        // KO: A confirmed out, B still ranked
        if a_out_confirmed && !b_out_confirmed {
            return Decision::winner(
                entity_b_id,
                constants::RC_KO_A_OUT,
                format!(
                    "snapshot={now:?} A={symbol_a} out_cycles={new_out_a} (confirmed) | B={symbol_b} ok"
                ),
                &self.ruleset_version,
                new_out_a,
                new_out_b,
            );
        }

        // KO: B confirmed out, A still ranked
        if !a_out_confirmed && b_out_confirmed {
            return Decision::winner(
                entity_a_id,
                constants::RC_KO_B_OUT,
                format!(
                    "snapshot={now:?} B={symbol_b} out_cycles={new_out_b} (confirmed) | A={symbol_a} ok"
                ),
                &self.ruleset_version,
                new_out_a,
                new_out_b,
            );
        }

        // Both confirmed out: decide by score
        let detail = format!(
            "snapshot={now:?} both_out A_out={new_out_a} B_out={new_out_b} score={score_a}x{score_b}"
        );

        if score_a != score_b {
            let winner_id = if score_a > score_b {
                entity_a_id
            } else {
                entity_b_id
            };
            return Decision::winner(
                winner_id,
                constants::RC_BOTH_OUT_SCORE_DECISION,
                detail,
                &self.ruleset_version,
                new_out_a,
                new_out_b,
            );
        }

        Decision::walkover(
            constants::RC_BOTH_OUT_DRAW_WO,
            detail,
            &self.ruleset_version,
            new_out_a,
            new_out_b,
        )
    }
}

fn is_in(snapshot: &Snapshot, symbol: &str) -> bool {
    find(snapshot, symbol).is_some()
}

fn find<'a>(snapshot: &'a Snapshot, symbol: &str) -> Option<&'a GainerEntry> {
    if symbol.trim().is_empty() {
        return None;
    }
    snapshot
        .entries
        .iter()
        .find(|e| e.symbol.eq_ignore_ascii_case(symbol))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::decision::DecisionKind;
    use chrono::Utc;
    use std::collections::HashSet;

    fn snapshot_of(symbols: &[&str]) -> Snapshot {
        let entries: Vec<GainerEntry> = symbols
            .iter()
            .enumerate()
            .map(|(i, s)| GainerEntry {
                symbol: s.to_string(),
                rank: (i + 1) as u32,
                percent_change: 10.0 - i as f64,
            })
            .collect();
        let universe: HashSet<String> =
            entries.iter().map(|e| e.symbol.to_lowercase()).collect();
        Snapshot {
            taken_at: Utc::now(),
            entries,
            universe,
        }
    }

    fn engine() -> MatchRuleEngine {
        MatchRuleEngine::new(2, true, "test-rules")
    }

    #[test]
    fn test_eligibility_both_in() {
        let snap = snapshot_of(&["AAAUSDT", "BBBUSDT"]);
        let res = engine().evaluate_eligibility("aaausdt", "BBBUSDT", &snap, Utc::now());
        assert!(res.is_eligible);
        assert_eq!(res.side_a_rank, Some(1));
        assert_eq!(res.side_b_rank, Some(2));
    }

    #[test]
    fn test_eligibility_missing_symbol() {
        let snap = snapshot_of(&["AAAUSDT"]);
        let res = engine().evaluate_eligibility("", "AAAUSDT", &snap, Utc::now());
        assert!(!res.is_eligible);
        assert_eq!(res.reason, EligibilityReason::MissingSymbol);
    }

    #[test]
    fn test_eligibility_empty_snapshot() {
        let snap = Snapshot::empty(Utc::now());
        let res = engine().evaluate_eligibility("AAAUSDT", "BBBUSDT", &snap, Utc::now());
        assert!(!res.is_eligible);
        assert_eq!(res.reason, EligibilityReason::SnapshotEmpty);
    }

    #[test]
    fn test_eligibility_distinguishes_sides() {
        let snap = snapshot_of(&["AAAUSDT", "BBBUSDT"]);
        let e = engine();

        let res = e.evaluate_eligibility("XXXUSDT", "BBBUSDT", &snap, Utc::now());
        assert_eq!(res.reason, EligibilityReason::SideANotInSnapshot);

        let res = e.evaluate_eligibility("AAAUSDT", "XXXUSDT", &snap, Utc::now());
        assert_eq!(res.reason, EligibilityReason::SideBNotInSnapshot);

        let res = e.evaluate_eligibility("XXXUSDT", "YYYUSDT", &snap, Utc::now());
        assert_eq!(res.reason, EligibilityReason::BothNotInSnapshot);
    }

    #[test]
    fn test_pending_start_when_both_ranked() {
        let snap = snapshot_of(&["AAAUSDT", "BBBUSDT"]);
        let d = engine().evaluate_pending("AAAUSDT", "BBBUSDT", &snap, Utc::now());
        assert_eq!(d.kind, DecisionKind::StartMatch);
        assert_eq!(d.reason_code, constants::RC_LINEUP_OK);
        assert_eq!(d.ruleset_version, "test-rules");
    }

    #[test]
    fn test_pending_empty_snapshot_is_no_action() {
        let snap = Snapshot::empty(Utc::now());
        let d = engine().evaluate_pending("AAAUSDT", "BBBUSDT", &snap, Utc::now());
        assert_eq!(d.kind, DecisionKind::NoAction);
    }

    #[test]
    fn test_pending_cancel_distinguishes_sides() {
        let snap = snapshot_of(&["BBBUSDT", "CCCUSDT"]);
        let e = engine();

        let d = e.evaluate_pending("AAAUSDT", "BBBUSDT", &snap, Utc::now());
        assert_eq!(d.kind, DecisionKind::CancelMatch);
        assert_eq!(d.reason_code, constants::RC_LINEUP_INVALID_A_OUT);

        let d = e.evaluate_pending("BBBUSDT", "AAAUSDT", &snap, Utc::now());
        assert_eq!(d.reason_code, constants::RC_LINEUP_INVALID_B_OUT);

        let d = e.evaluate_pending("XXXUSDT", "YYYUSDT", &snap, Utc::now());
        assert_eq!(d.reason_code, constants::RC_LINEUP_INVALID_BOTH_OUT);
    }

    #[test]
    fn test_pending_flag_off_never_cancels() {
        let snap = snapshot_of(&["BBBUSDT"]);
        let lenient = MatchRuleEngine::new(2, false, "test-rules");
        let d = lenient.evaluate_pending("AAAUSDT", "BBBUSDT", &snap, Utc::now());
        assert_eq!(d.kind, DecisionKind::NoAction);
    }

    #[test]
    fn test_pending_missing_symbol_is_no_action_not_cancel() {
        let snap = snapshot_of(&["AAAUSDT"]);
        let d = engine().evaluate_pending("", "AAAUSDT", &snap, Utc::now());
        assert_eq!(d.kind, DecisionKind::NoAction);
    }

    #[test]
    fn test_ongoing_both_present_resets_counters() {
        let snap = snapshot_of(&["AAAUSDT", "BBBUSDT"]);
        let d = engine().evaluate_ongoing(
            1, 2, "AAAUSDT", "BBBUSDT", 3, 1, 5, 5, &snap, Utc::now(),
        );
        assert_eq!(d.kind, DecisionKind::NoAction);
        assert_eq!(d.updated_out_cycles_a, Some(0));
        assert_eq!(d.updated_out_cycles_b, Some(0));
    }

    #[test]
    fn test_ongoing_first_absence_is_no_action() {
        let snap = snapshot_of(&["BBBUSDT"]);
        let d = engine().evaluate_ongoing(
            1, 2, "AAAUSDT", "BBBUSDT", 0, 0, 0, 0, &snap, Utc::now(),
        );
        assert_eq!(d.kind, DecisionKind::NoAction);
        assert_eq!(d.updated_out_cycles_a, Some(1));
        assert_eq!(d.updated_out_cycles_b, Some(0));
    }

    #[test]
    fn test_ongoing_confirmed_absence_knocks_out() {
        let snap = snapshot_of(&["BBBUSDT"]);
        let d = engine().evaluate_ongoing(
            1, 2, "AAAUSDT", "BBBUSDT", 0, 0, 1, 0, &snap, Utc::now(),
        );
        assert_eq!(d.kind, DecisionKind::FinishWithWinner);
        assert_eq!(d.winner_entity_id, Some(2));
        assert_eq!(d.reason_code, constants::RC_KO_A_OUT);
        assert_eq!(d.updated_out_cycles_a, Some(2));
        assert_eq!(d.updated_out_cycles_b, Some(0));
    }

    #[test]
    fn test_ongoing_b_side_knockout() {
        let snap = snapshot_of(&["AAAUSDT"]);
        let d = engine().evaluate_ongoing(
            1, 2, "AAAUSDT", "BBBUSDT", 0, 0, 0, 1, &snap, Utc::now(),
        );
        assert_eq!(d.kind, DecisionKind::FinishWithWinner);
        assert_eq!(d.winner_entity_id, Some(1));
        assert_eq!(d.reason_code, constants::RC_KO_B_OUT);
    }

    #[test]
    fn test_ongoing_both_out_decided_by_score() {
        let snap = snapshot_of(&["CCCUSDT"]);
        let d = engine().evaluate_ongoing(
            1, 2, "AAAUSDT", "BBBUSDT", 5, 2, 2, 1, &snap, Utc::now(),
        );
        assert_eq!(d.kind, DecisionKind::FinishWithWinner);
        assert_eq!(d.winner_entity_id, Some(1));
        assert_eq!(d.reason_code, constants::RC_BOTH_OUT_SCORE_DECISION);
        assert_eq!(d.updated_out_cycles_a, Some(3));
        assert_eq!(d.updated_out_cycles_b, Some(2));
    }

    #[test]
    fn test_ongoing_both_out_tied_is_walkover() {
        let snap = snapshot_of(&["CCCUSDT"]);
        let d = engine().evaluate_ongoing(
            1, 2, "AAAUSDT", "BBBUSDT", 3, 3, 2, 1, &snap, Utc::now(),
        );
        assert_eq!(d.kind, DecisionKind::FinishWithWalkover);
        assert_eq!(d.winner_entity_id, None);
        assert_eq!(d.reason_code, constants::RC_BOTH_OUT_DRAW_WO);
    }

    #[test]
    fn test_ongoing_empty_snapshot_echoes_counters() {
        let snap = Snapshot::empty(Utc::now());
        let d = engine().evaluate_ongoing(
            1, 2, "AAAUSDT", "BBBUSDT", 4, 4, 7, 3, &snap, Utc::now(),
        );
        assert_eq!(d.kind, DecisionKind::NoAction);
        assert_eq!(d.updated_out_cycles_a, Some(7));
        assert_eq!(d.updated_out_cycles_b, Some(3));
    }

    #[test]
    fn test_hysteresis_monotone_while_absent() {
        let present = snapshot_of(&["AAAUSDT", "BBBUSDT"]);
        let absent = snapshot_of(&["BBBUSDT", "CCCUSDT"]);
        // Wide window so the sequence never terminates the match.
        let e = MatchRuleEngine::new(100, true, "test-rules");

        let mut out_a = 0;
        for expected in 1..=5 {
            let d = e.evaluate_ongoing(
                1, 2, "AAAUSDT", "BBBUSDT", 0, 0, out_a, 0, &absent, Utc::now(),
            );
            out_a = d.updated_out_cycles_a.unwrap();
            assert_eq!(out_a, expected);
        }

        let d = e.evaluate_ongoing(
            1, 2, "AAAUSDT", "BBBUSDT", 0, 0, out_a, 0, &present, Utc::now(),
        );
        assert_eq!(d.updated_out_cycles_a, Some(0));
    }

    #[test]
    fn test_confirm_cycles_clamped_to_one() {
        let e = MatchRuleEngine::new(0, true, "");
        // With the clamp, a single absence already confirms.
        let snap = snapshot_of(&["BBBUSDT"]);
        let d = e.evaluate_ongoing(1, 2, "AAAUSDT", "BBBUSDT", 0, 0, 0, 0, &snap, Utc::now());
        assert_eq!(d.kind, DecisionKind::FinishWithWinner);
        assert_eq!(d.ruleset_version, constants::DEFAULT_RULESET_VERSION);
    }
}
