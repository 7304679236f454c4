//! Shared domain types and application configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Raw row from the Binance 24h ticker endpoint.
///
/// Numeric fields arrive as strings; keep them as strings and parse at the
/// snapshot boundary so one bad row cannot poison the whole response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerEntry {
    pub symbol: String,
    #[serde(rename = "priceChangePercent")]
    pub price_change_percent: String,
    #[serde(rename = "lastPrice", default)]
    pub last_price: String,
    #[serde(default)]
    pub count: u64,
    #[serde(rename = "quoteVolume", default)]
    pub quote_volume: String,
}

/// One ranked entry of a market snapshot. Rank is 1-based after filtering
/// and sorting by percent change descending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GainerEntry {
    pub symbol: String,
    pub rank: u32,
    pub percent_change: f64,
}

/// Ranked market snapshot for one reconciliation cycle.
///
/// `entries` is the truncated top-N that the rule engine and allocator see.
/// `universe` is every symbol that passed the liquidity/suffix filters before
/// truncation; the hygiene pass uses it to tell "temporarily bumped out of
/// the top-N" apart from "no longer a candidate at all".
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    pub entries: Vec<GainerEntry>,
    pub universe: HashSet<String>,
}

impl Snapshot {
    pub fn empty(taken_at: DateTime<Utc>) -> Self {
        Self {
            taken_at,
            entries: Vec::new(),
            universe: HashSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Match lifecycle states. Strictly forward-only:
/// `Pending -> {Ongoing, Cancelled}`, `Ongoing -> Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchStatus {
    Pending,
    Ongoing,
    Completed,
    Cancelled,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::Pending => "Pending",
            MatchStatus::Ongoing => "Ongoing",
            MatchStatus::Completed => "Completed",
            MatchStatus::Cancelled => "Cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(MatchStatus::Pending),
            "Ongoing" => Some(MatchStatus::Ongoing),
            "Completed" => Some(MatchStatus::Completed),
            "Cancelled" => Some(MatchStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, MatchStatus::Pending | MatchStatus::Ongoing)
    }
}

/// Persisted market entity (a tradable symbol and its last known movement).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub entity_id: i64,
    pub symbol: String,
    pub name: String,
    pub percentage_change: f64,
    pub last_updated: DateTime<Utc>,
}

/// One side of a match, joined with its entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchSide {
    pub entity_id: i64,
    pub symbol: String,
    pub percentage_change: f64,
}

/// A match row joined with both entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRecord {
    pub match_id: i64,
    pub side_a: MatchSide,
    pub side_b: MatchSide,
    pub status: MatchStatus,
    pub score_a: i64,
    pub score_b: i64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub out_cycles_a: u32,
    pub out_cycles_b: u32,
    pub winner_entity_id: Option<i64>,
    pub end_reason_code: Option<String>,
    pub end_reason_detail: Option<String>,
    pub ruleset_version: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MatchRecord {
    /// Unordered, case-insensitive pair key ("aaa|bbb").
    pub fn pair_key(&self) -> String {
        pair_key(&self.side_a.symbol, &self.side_b.symbol)
    }
}

/// Canonical unordered pair key for two symbols.
pub fn pair_key(a: &str, b: &str) -> String {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    if a <= b {
        format!("{a}|{b}")
    } else {
        format!("{b}|{a}")
    }
}

/// One health check entry for the worker status row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthItem {
    pub ok: bool,
    pub message: String,
}

/// Structured health map persisted (as JSON) with the heartbeat.
pub type WorkerHealth = HashMap<String, HealthItem>;

/// Best-effort operational heartbeat, one row per worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatusRecord {
    pub worker_name: String,
    pub last_heartbeat: DateTime<Utc>,
    pub last_cycle_start: Option<DateTime<Utc>>,
    pub last_cycle_end: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub status: String,
    pub health: WorkerHealth,
    pub updated_at: DateTime<Utc>,
}

/// Events pushed to WebSocket clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WsServerEvent {
    /// The reconciliation loop committed a cycle; pool state may have changed.
    PoolUpdated {
        server_time: DateTime<Utc>,
        cycle: u64,
        pending: i64,
        ongoing: i64,
    },
}

/// Application configuration, collected from the environment once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    pub ticker_url: String,
    pub cycle_interval_secs: u64,
    pub quote_suffix: String,
    pub snapshot_take: usize,
    pub min_trade_count: u64,
    pub min_quote_volume: f64,
    pub min_snapshot_size: usize,
    pub target_pending_matches: usize,
    pub target_ongoing_matches: usize,
    pub match_duration_minutes: i64,
    pub percent_per_goal: f64,
    pub max_goals_per_side: i64,
    pub out_confirm_cycles: u32,
    pub cancel_if_invalid_at_start: bool,
    pub ruleset_version: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        Ok(Self {
            database_path: env_or("DATABASE_PATH", "./cryptoversus.db"),
            port: parse_or("PORT", 8080),
            ticker_url: env_or(
                "BINANCE_TICKER_URL",
                "https://api.binance.com/api/v3/ticker/24hr",
            ),
            cycle_interval_secs: parse_or("CYCLE_INTERVAL_SECS", 60),
            quote_suffix: env_or("QUOTE_SUFFIX", "USDT"),
            snapshot_take: parse_or("SNAPSHOT_TAKE", 20),
            min_trade_count: parse_or("MIN_TRADE_COUNT", 1000),
            min_quote_volume: parse_or("MIN_QUOTE_VOLUME", 100_000.0),
            min_snapshot_size: parse_or("MIN_SNAPSHOT_SIZE", 4),
            target_pending_matches: parse_or("TARGET_PENDING_MATCHES", 3),
            target_ongoing_matches: parse_or("TARGET_ONGOING_MATCHES", 3),
            match_duration_minutes: parse_or("MATCH_DURATION_MINUTES", 90),
            percent_per_goal: parse_or("PERCENT_PER_GOAL", 2.0),
            max_goals_per_side: parse_or("MAX_GOALS_PER_SIDE", 7),
            out_confirm_cycles: parse_or("OUT_CONFIRM_CYCLES", 2),
            cancel_if_invalid_at_start: env_or("CANCEL_IF_INVALID_AT_START", "true")
                .eq_ignore_ascii_case("true"),
            ruleset_version: env_or("RULESET_VERSION", "v1.0.0"),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
