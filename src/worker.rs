//! Match reconciliation worker.
//!
//! Single logical worker: one cycle runs to completion (or failure) before
//! the next begins, so the pairing and promotion logic never races itself.
//! Every decision is recomputed from persisted state plus a fresh snapshot,
//! which makes a crashed cycle harmless: the next successful cycle re-derives
//! everything.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::allocator::select_pairs;
use crate::models::{
    Config, HealthItem, MatchRecord, MatchStatus, Snapshot, WorkerHealth, WorkerStatusRecord,
    WsServerEvent,
};
use crate::rules::{constants, DecisionKind, MatchRuleEngine};
use crate::scrapers::binance::{build_snapshot, GainersClient};
use crate::store::MatchStore;

pub const WORKER_NAME: &str = "match-worker";

/// Backoff after a cycle failure that looks like a network problem.
const TRANSIENT_BACKOFF_SECS: u64 = 30;
/// Backoff after any other cycle failure.
const DEFAULT_BACKOFF_SECS: u64 = 10;

/// What one committed cycle did, for logging and tests.
#[derive(Debug, Default, Clone)]
pub struct CycleReport {
    pub hygiene_cancelled: usize,
    pub hygiene_forced_ends: usize,
    pub created: usize,
    pub allocator_shortfall: usize,
    pub promoted: usize,
    pub cancelled_at_promotion: usize,
    pub finished: usize,
    pub timed_out: usize,
    pub pending: i64,
    pub ongoing: i64,
}

pub struct MatchWorker {
    config: Config,
    store: Arc<MatchStore>,
    engine: MatchRuleEngine,
    gainers: GainersClient,
    events: broadcast::Sender<WsServerEvent>,
}

impl MatchWorker {
    pub fn new(
        config: Config,
        store: Arc<MatchStore>,
        events: broadcast::Sender<WsServerEvent>,
    ) -> Result<Self> {
        let engine = MatchRuleEngine::new(
            config.out_confirm_cycles,
            config.cancel_if_invalid_at_start,
            &config.ruleset_version,
        );
        let gainers = GainersClient::new(&config.ticker_url)?;
        Ok(Self {
            config,
            store,
            engine,
            gainers,
            events,
        })
    }

    /// Run forever. A failed cycle is logged, recorded on the status row and
    /// retried after a backoff; it never takes the process down.
    pub async fn run(self) {
        info!(
            interval_secs = self.config.cycle_interval_secs,
            ruleset = self.engine.ruleset_version(),
            "Match worker started"
        );

        let mut cycle: u64 = 0;
        loop {
            cycle += 1;
            match self.run_cycle(cycle).await {
                Ok(Some(report)) => {
                    info!(
                        cycle,
                        created = report.created,
                        promoted = report.promoted,
                        finished = report.finished,
                        pending = report.pending,
                        ongoing = report.ongoing,
                        "Cycle committed"
                    );
                }
                Ok(None) => {
                    // Soft abort (data shortfall): nothing was mutated.
                }
                Err(e) => {
                    error!(cycle, error = ?e, "Cycle failed");
                    self.record_failure(&e);

                    let backoff = if is_transient_infra(&e) {
                        Duration::from_secs(TRANSIENT_BACKOFF_SECS)
                    } else {
                        Duration::from_secs(DEFAULT_BACKOFF_SECS)
                    };
                    tokio::time::sleep(backoff).await;
                }
            }

            tokio::time::sleep(Duration::from_secs(self.config.cycle_interval_secs)).await;
        }
    }

    /// One cycle: fetch, build snapshot, reconcile, notify.
    /// Returns Ok(None) when the cycle aborted cleanly before any mutation.
    async fn run_cycle(&self, cycle: u64) -> Result<Option<CycleReport>> {
        let cycle_start = Utc::now();
        self.record_status("Running", Some(cycle_start), None, None, None);

        let tickers = self
            .gainers
            .fetch_24h_tickers()
            .await
            .context("Snapshot acquisition failed")?;

        let now = Utc::now();
        let snapshot = build_snapshot(&tickers, &self.config, now);

        if snapshot.entries.len() < self.config.min_snapshot_size {
            // Upstream shortfall is a soft condition: abort before any
            // mutation, never cancel matches over it.
            warn!(
                qualified = snapshot.entries.len(),
                required = self.config.min_snapshot_size,
                "Snapshot too small, skipping cycle"
            );
            let mut health = WorkerHealth::new();
            health.insert(
                "binance".to_string(),
                HealthItem {
                    ok: false,
                    message: format!(
                        "snapshot shortfall: {} qualified, {} required",
                        snapshot.entries.len(),
                        self.config.min_snapshot_size
                    ),
                },
            );
            self.record_status("Idle", Some(cycle_start), Some(Utc::now()), None, Some(health));
            return Ok(None);
        }

        let report = self.reconcile(&snapshot, now)?;

        let _ = self.events.send(WsServerEvent::PoolUpdated {
            server_time: Utc::now(),
            cycle,
            pending: report.pending,
            ongoing: report.ongoing,
        });

        let mut health = WorkerHealth::new();
        health.insert(
            "binance".to_string(),
            HealthItem {
                ok: true,
                message: format!("{} ranked entries", snapshot.entries.len()),
            },
        );
        health.insert(
            "database".to_string(),
            HealthItem {
                ok: true,
                message: format!("{} pending / {} ongoing", report.pending, report.ongoing),
            },
        );
        let done = Utc::now();
        self.record_status("Idle", Some(cycle_start), Some(done), Some(done), Some(health));

        Ok(Some(report))
    }

    /// The synchronous reconciliation pass over one snapshot.
    ///
    /// Order matters: hygiene first (so replenishment sees the post-hygiene
    /// busy set), then replenishment (so promotion sees the refilled Pending
    /// pool), then promotion, then ongoing processing.
    pub fn reconcile(&self, snapshot: &Snapshot, now: DateTime<Utc>) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        self.store
            .upsert_gainers(&snapshot.entries, &self.config.quote_suffix, now)
            .context("Failed to persist snapshot entities")?;

        self.hygiene_pass(snapshot, now, &mut report)?;
        self.replenish_pending(snapshot, now, &mut report)?;
        self.promote_pending(snapshot, now, &mut report)?;
        self.process_ongoing(snapshot, now, &mut report)?;

        report.pending = self.store.count_by_status(MatchStatus::Pending)?;
        report.ongoing = self.store.count_by_status(MatchStatus::Ongoing)?;
        Ok(report)
    }

    /// Force out any active match whose pair is no longer in the candidate
    /// universe at all. Harsher than the engine's hysteresis on purpose:
    /// these symbols did not just slip down the ranking, they stopped
    /// qualifying. Running this twice against one snapshot is a no-op the
    /// second time.
    fn hygiene_pass(
        &self,
        snapshot: &Snapshot,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<()> {
        let ruleset = self.engine.ruleset_version();
        for m in self.store.active_matches()? {
            let a_in = snapshot.universe.contains(&m.side_a.symbol.to_lowercase());
            let b_in = snapshot.universe.contains(&m.side_b.symbol.to_lowercase());
            if a_in && b_in {
                continue;
            }
            let detail = format!(
                "snapshot={now:?} A={} in_universe={a_in} | B={} in_universe={b_in}",
                m.side_a.symbol, m.side_b.symbol
            );
            match m.status {
                MatchStatus::Pending => {
                    if self.store.cancel_match(
                        m.match_id,
                        now,
                        constants::RC_FILTERED_OUT,
                        &detail,
                        ruleset,
                    )? {
                        report.hygiene_cancelled += 1;
                        debug!(match_id = m.match_id, "Hygiene: cancelled pending match");
                    }
                }
                MatchStatus::Ongoing => {
                    if self.store.complete_match(
                        m.match_id,
                        now,
                        None,
                        constants::RC_FORCED_END_FILTERED_OUT,
                        &detail,
                        ruleset,
                    )? {
                        report.hygiene_forced_ends += 1;
                        debug!(match_id = m.match_id, "Hygiene: force-ended ongoing match");
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Refill the Pending pool up to its target using the allocator.
    fn replenish_pending(
        &self,
        snapshot: &Snapshot,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<()> {
        let pending = self.store.count_by_status(MatchStatus::Pending)? as usize;
        if pending >= self.config.target_pending_matches {
            return Ok(());
        }
        let deficit = self.config.target_pending_matches - pending;

        // Busy symbols and pair keys from the post-hygiene active pool.
        let active = self.store.active_matches()?;
        let mut busy: HashSet<String> = HashSet::new();
        let mut pairs: HashSet<String> = HashSet::new();
        for m in &active {
            busy.insert(m.side_a.symbol.to_lowercase());
            busy.insert(m.side_b.symbol.to_lowercase());
            pairs.insert(m.pair_key());
        }

        let chosen = select_pairs(snapshot, &busy, &pairs, deficit);
        if chosen.len() < deficit {
            // Soft degradation: run with fewer Pending matches until a
            // future snapshot has more symbol diversity.
            report.allocator_shortfall = deficit - chosen.len();
            warn!(
                deficit,
                chosen = chosen.len(),
                "Allocator could not fill the pending pool"
            );
        }

        for pair in chosen {
            let id = self
                .store
                .create_pending_match(&pair.a.symbol, &pair.b.symbol, now)?;
            report.created += 1;
            debug!(
                match_id = id,
                a = %pair.a.symbol,
                b = %pair.b.symbol,
                "Created pending match"
            );
        }
        Ok(())
    }

    /// Promote Pending matches to Ongoing until the target is met, applying
    /// engine decisions. Oversamples the Pending pool because some
    /// candidates will be cancelled instead of started.
    fn promote_pending(
        &self,
        snapshot: &Snapshot,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<()> {
        let ongoing = self.store.count_by_status(MatchStatus::Ongoing)? as usize;
        if ongoing >= self.config.target_ongoing_matches {
            return Ok(());
        }
        let deficit = self.config.target_ongoing_matches - ongoing;
        let candidates = self.store.pending_matches((deficit * 3).max(3))?;

        let mut promoted = 0usize;
        for m in candidates {
            if promoted >= deficit {
                break;
            }
            let decision =
                self.engine
                    .evaluate_pending(&m.side_a.symbol, &m.side_b.symbol, snapshot, now);
            match decision.kind {
                DecisionKind::StartMatch => {
                    if self
                        .store
                        .start_match(m.match_id, now, &decision.ruleset_version)?
                    {
                        promoted += 1;
                        report.promoted += 1;
                        info!(
                            match_id = m.match_id,
                            a = %m.side_a.symbol,
                            b = %m.side_b.symbol,
                            "Match started"
                        );
                    }
                }
                DecisionKind::CancelMatch => {
                    if self.store.cancel_match(
                        m.match_id,
                        now,
                        &decision.reason_code,
                        &decision.reason_detail,
                        &decision.ruleset_version,
                    )? {
                        report.cancelled_at_promotion += 1;
                        info!(
                            match_id = m.match_id,
                            reason = %decision.reason_code,
                            "Match cancelled before start"
                        );
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Recompute scores, apply engine decisions, and enforce the time limit
    /// for every Ongoing match.
    fn process_ongoing(
        &self,
        snapshot: &Snapshot,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<()> {
        for m in self.store.ongoing_matches()? {
            let pct_a = latest_percent(snapshot, &m.side_a.symbol, m.side_a.percentage_change);
            let pct_b = latest_percent(snapshot, &m.side_b.symbol, m.side_b.percentage_change);
            let (score_a, score_b) = compute_scores(
                pct_a,
                pct_b,
                self.config.percent_per_goal,
                self.config.max_goals_per_side,
            );
            if score_a != m.score_a || score_b != m.score_b {
                self.store.update_score(m.match_id, score_a, score_b)?;
            }

            let decision = self.engine.evaluate_ongoing(
                m.side_a.entity_id,
                m.side_b.entity_id,
                &m.side_a.symbol,
                &m.side_b.symbol,
                score_a,
                score_b,
                m.out_cycles_a,
                m.out_cycles_b,
                snapshot,
                now,
            );

            // Persist hysteresis state on every branch, including NoAction.
            if let (Some(out_a), Some(out_b)) =
                (decision.updated_out_cycles_a, decision.updated_out_cycles_b)
            {
                self.store.update_out_cycles(m.match_id, out_a, out_b)?;
            }

            match decision.kind {
                DecisionKind::FinishWithWinner | DecisionKind::FinishWithWalkover => {
                    if self.store.complete_match(
                        m.match_id,
                        now,
                        decision.winner_entity_id,
                        &decision.reason_code,
                        &decision.reason_detail,
                        &decision.ruleset_version,
                    )? {
                        report.finished += 1;
                        info!(
                            match_id = m.match_id,
                            reason = %decision.reason_code,
                            winner = ?decision.winner_entity_id,
                            "Match finished"
                        );
                    }
                }
                DecisionKind::NoAction => {
                    if self.past_time_limit(&m, now) {
                        self.force_time_limit_end(&m, score_a, score_b, now, report)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn past_time_limit(&self, m: &MatchRecord, now: DateTime<Utc>) -> bool {
        match m.start_time {
            Some(start) => {
                now - start >= ChronoDuration::minutes(self.config.match_duration_minutes)
            }
            None => false,
        }
    }

    /// Time-limit completion, independent of the engine. The higher score
    /// wins; a tied score ends with no winner.
    fn force_time_limit_end(
        &self,
        m: &MatchRecord,
        score_a: i64,
        score_b: i64,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<()> {
        let winner = match score_a.cmp(&score_b) {
            std::cmp::Ordering::Greater => Some(m.side_a.entity_id),
            std::cmp::Ordering::Less => Some(m.side_b.entity_id),
            std::cmp::Ordering::Equal => None,
        };
        let detail = format!(
            "started={:?} limit_minutes={} score={score_a}x{score_b}",
            m.start_time, self.config.match_duration_minutes
        );
        if self.store.complete_match(
            m.match_id,
            now,
            winner,
            constants::RC_TIME_LIMIT,
            &detail,
            self.engine.ruleset_version(),
        )? {
            report.finished += 1;
            report.timed_out += 1;
            info!(match_id = m.match_id, winner = ?winner, "Match ended on time limit");
        }
        Ok(())
    }

    fn record_status(
        &self,
        status: &str,
        cycle_start: Option<DateTime<Utc>>,
        cycle_end: Option<DateTime<Utc>>,
        success: Option<DateTime<Utc>>,
        health: Option<WorkerHealth>,
    ) {
        let previous = self.store.worker_status(WORKER_NAME).ok().flatten();
        let now = Utc::now();
        let record = WorkerStatusRecord {
            worker_name: WORKER_NAME.to_string(),
            last_heartbeat: now,
            last_cycle_start: cycle_start.or(previous.as_ref().and_then(|p| p.last_cycle_start)),
            last_cycle_end: cycle_end.or(previous.as_ref().and_then(|p| p.last_cycle_end)),
            last_success: success.or(previous.as_ref().and_then(|p| p.last_success)),
            last_error: previous.as_ref().and_then(|p| p.last_error.clone()),
            status: status.to_string(),
            health: health
                .or(previous.map(|p| p.health))
                .unwrap_or_default(),
            updated_at: now,
        };
        // Best-effort: the heartbeat must never fail a cycle.
        if let Err(e) = self.store.upsert_worker_status(&record) {
            warn!(error = ?e, "Failed to update worker status row");
        }
    }

    fn record_failure(&self, err: &anyhow::Error) {
        let previous = self.store.worker_status(WORKER_NAME).ok().flatten();
        let now = Utc::now();
        let record = WorkerStatusRecord {
            worker_name: WORKER_NAME.to_string(),
            last_heartbeat: now,
            last_cycle_start: previous.as_ref().and_then(|p| p.last_cycle_start),
            last_cycle_end: Some(now),
            last_success: previous.as_ref().and_then(|p| p.last_success),
            last_error: Some(format!("{err:#}")),
            status: "Error".to_string(),
            health: previous.map(|p| p.health).unwrap_or_default(),
            updated_at: now,
        };
        if let Err(e) = self.store.upsert_worker_status(&record) {
            warn!(error = ?e, "Failed to record cycle failure");
        }
    }
}

/// Score from the percent-change gap: `floor(|gap| / percent_per_goal)`
/// goals to the leader, capped, zero to the other side. Monotonic in the gap.
pub fn compute_scores(
    pct_a: f64,
    pct_b: f64,
    percent_per_goal: f64,
    max_goals_per_side: i64,
) -> (i64, i64) {
    if percent_per_goal <= 0.0 {
        return (0, 0);
    }
    let gap = pct_a - pct_b;
    let goals = ((gap.abs() / percent_per_goal).floor() as i64).min(max_goals_per_side);
    match gap.partial_cmp(&0.0) {
        Some(std::cmp::Ordering::Greater) => (goals, 0),
        Some(std::cmp::Ordering::Less) => (0, goals),
        _ => (0, 0),
    }
}

fn latest_percent(snapshot: &Snapshot, symbol: &str, fallback: f64) -> f64 {
    snapshot
        .entries
        .iter()
        .find(|e| e.symbol.eq_ignore_ascii_case(symbol))
        .map(|e| e.percent_change)
        .unwrap_or(fallback)
}

/// Network-ish failures get the longer backoff; everything else the short
/// one. Classification only affects retry pacing, never cycle state.
fn is_transient_infra(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(re) = cause.downcast_ref::<reqwest::Error>() {
            if re.is_connect() || re.is_timeout() || re.is_request() {
                return true;
            }
        }
        if cause.downcast_ref::<std::io::Error>().is_some() {
            return true;
        }
    }
    false
}
