//! Stable reason codes and rule defaults.
//!
//! These are audit identifiers, not display text. Changing one invalidates
//! the audit trail of every previously persisted decision.

pub const DEFAULT_RULESET_VERSION: &str = "v1.0.0";

pub const DEFAULT_OUT_CONFIRM_CYCLES: u32 = 2;
pub const DEFAULT_CANCEL_IF_INVALID_AT_START: bool = true;

// Pending
pub const RC_NO_ACTION: &str = "NO_ACTION";
pub const RC_LINEUP_OK: &str = "LINEUP_OK";
pub const RC_SNAPSHOT_EMPTY: &str = "SNAPSHOT_EMPTY";
pub const RC_MISSING_SYMBOL: &str = "MISSING_SYMBOL";
pub const RC_LINEUP_INVALID_A_OUT: &str = "LINEUP_INVALID_A_OUT";
pub const RC_LINEUP_INVALID_B_OUT: &str = "LINEUP_INVALID_B_OUT";
pub const RC_LINEUP_INVALID_BOTH_OUT: &str = "LINEUP_INVALID_BOTH_OUT";

// Ongoing (KO / finish)
pub const RC_KO_A_OUT: &str = "KO_A_OUT_OF_GAINERS";
pub const RC_KO_B_OUT: &str = "KO_B_OUT_OF_GAINERS";
pub const RC_BOTH_OUT_SCORE_DECISION: &str = "BOTH_OUT_SCORE_DECISION";
pub const RC_BOTH_OUT_DRAW_WO: &str = "BOTH_OUT_DRAW_WO";

// Applied by the worker, outside the engine
pub const RC_FILTERED_OUT: &str = "FILTERED_OUT";
pub const RC_FORCED_END_FILTERED_OUT: &str = "FORCED_END_FILTERED_OUT";
pub const RC_TIME_LIMIT: &str = "TIME_LIMIT";
