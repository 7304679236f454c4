//! Deterministic match rule engine.
//!
//! Pure decision logic: no storage, no clock, no logging. The worker feeds
//! it snapshots and match state and persists whatever it decides.

pub mod constants;
pub mod decision;
pub mod engine;

pub use decision::{
    Decision, DecisionKind, EligibilityReason, EligibilityResult, WinnerSide,
};
pub use engine::MatchRuleEngine;
