//! End-to-end reconciliation cycle tests against a real SQLite store with
//! injected snapshots.

use chrono::{Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;

use cryptoversus_backend::models::{Config, GainerEntry, MatchStatus, Snapshot};
use cryptoversus_backend::store::MatchStore;
use cryptoversus_backend::worker::MatchWorker;

fn test_config() -> Config {
    Config {
        database_path: String::new(),
        port: 0,
        ticker_url: "http://127.0.0.1:1/ticker".to_string(),
        cycle_interval_secs: 60,
        quote_suffix: "USDT".to_string(),
        snapshot_take: 20,
        min_trade_count: 0,
        min_quote_volume: 0.0,
        min_snapshot_size: 2,
        target_pending_matches: 3,
        target_ongoing_matches: 3,
        match_duration_minutes: 90,
        percent_per_goal: 2.0,
        max_goals_per_side: 7,
        out_confirm_cycles: 2,
        cancel_if_invalid_at_start: true,
        ruleset_version: "test-rules".to_string(),
    }
}

fn worker_with(config: Config) -> (MatchWorker, Arc<MatchStore>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("matches.db");
    let store = Arc::new(MatchStore::new(db_path.to_str().unwrap()).expect("store"));
    let (tx, _rx) = broadcast::channel(16);
    let worker = MatchWorker::new(config, store.clone(), tx).expect("worker");
    (worker, store, dir)
}

/// Ranked snapshot from (symbol, percent) pairs, ranked in the given order.
/// The candidate universe covers the ranked entries plus `extra_universe`.
fn snapshot(ranked: &[(&str, f64)], extra_universe: &[&str]) -> Snapshot {
    let entries: Vec<GainerEntry> = ranked
        .iter()
        .enumerate()
        .map(|(i, (symbol, pct))| GainerEntry {
            symbol: symbol.to_string(),
            rank: (i + 1) as u32,
            percent_change: *pct,
        })
        .collect();
    let mut universe: HashSet<String> = entries.iter().map(|e| e.symbol.to_lowercase()).collect();
    for s in extra_universe {
        universe.insert(s.to_lowercase());
    }
    Snapshot {
        taken_at: Utc::now(),
        entries,
        universe,
    }
}

fn six_movers() -> Snapshot {
    snapshot(
        &[
            ("AAAUSDT", 12.0),
            ("BBBUSDT", 10.0),
            ("CCCUSDT", 8.0),
            ("DDDUSDT", 6.0),
            ("EEEUSDT", 4.0),
            ("FFFUSDT", 2.0),
        ],
        &[],
    )
}

fn assert_pool_invariants(store: &MatchStore) {
    let active = store.active_matches().expect("active matches");
    let mut symbols = HashSet::new();
    let mut pairs = HashSet::new();
    for m in &active {
        assert!(
            symbols.insert(m.side_a.symbol.to_lowercase()),
            "symbol {} appears in two active matches",
            m.side_a.symbol
        );
        assert!(
            symbols.insert(m.side_b.symbol.to_lowercase()),
            "symbol {} appears in two active matches",
            m.side_b.symbol
        );
        assert!(pairs.insert(m.pair_key()), "duplicate active pair");
    }
}

#[test]
fn first_cycle_fills_and_promotes_closest_pairs() {
    let (worker, store, _dir) = worker_with(test_config());
    let snap = six_movers();

    let report = worker.reconcile(&snap, Utc::now()).expect("cycle");

    // Replenishment fills the pending pool, promotion drains it into ongoing.
    assert_eq!(report.created, 3);
    assert_eq!(report.promoted, 3);
    assert_eq!(report.ongoing, 3);
    assert_pool_invariants(&store);

    // The greedy allocator pairs adjacent ranks, best rank first.
    let matches = store.recent_matches(10).expect("recent");
    let mut keys: Vec<String> = matches.iter().map(|m| m.pair_key()).collect();
    keys.sort();
    assert_eq!(
        keys,
        vec!["aaausdt|bbbusdt", "cccusdt|dddusdt", "eeeusdt|fffusdt"]
    );
}

#[test]
fn pool_invariants_hold_across_shifting_snapshots() {
    let (worker, store, _dir) = worker_with(test_config());

    let snapshots = [
        six_movers(),
        snapshot(
            &[
                ("CCCUSDT", 11.0),
                ("GGGUSDT", 9.0),
                ("AAAUSDT", 7.0),
                ("HHHUSDT", 5.0),
                ("BBBUSDT", 3.0),
            ],
            &["dddusdt", "eeeusdt", "fffusdt"],
        ),
        snapshot(
            &[("GGGUSDT", 9.0), ("HHHUSDT", 8.0), ("IIIUSDT", 7.0)],
            &["aaausdt", "bbbusdt", "cccusdt"],
        ),
    ];

    for snap in &snapshots {
        worker.reconcile(snap, Utc::now()).expect("cycle");
        assert_pool_invariants(&store);
    }
}

#[test]
fn ongoing_scores_follow_percent_gap() {
    let (worker, store, _dir) = worker_with(test_config());
    worker.reconcile(&six_movers(), Utc::now()).expect("cycle");

    // AAA (+12) vs BBB (+10): gap 2.0 at 2.0 percent/goal = 1 goal.
    let snap = six_movers();
    worker.reconcile(&snap, Utc::now()).expect("cycle");
    let matches = store.ongoing_matches().expect("ongoing");
    let m = matches
        .iter()
        .find(|m| m.pair_key() == "aaausdt|bbbusdt")
        .expect("pair exists");
    assert_eq!((m.score_a, m.score_b), (1, 0));
}

#[test]
fn hysteresis_knocks_out_after_confirm_cycles() {
    let (worker, store, _dir) = worker_with(test_config());
    worker.reconcile(&six_movers(), Utc::now()).expect("cycle");

    // AAA slips out of the ranked top-N but stays in the candidate universe,
    // so hygiene leaves the match alone and the hysteresis counters govern.
    let absent = snapshot(
        &[
            ("BBBUSDT", 10.0),
            ("CCCUSDT", 8.0),
            ("DDDUSDT", 6.0),
            ("EEEUSDT", 4.0),
            ("FFFUSDT", 2.0),
        ],
        &["aaausdt"],
    );

    // First absence: match continues, counter at 1.
    worker.reconcile(&absent, Utc::now()).expect("cycle");
    let m = store
        .ongoing_matches()
        .unwrap()
        .into_iter()
        .find(|m| m.pair_key() == "aaausdt|bbbusdt")
        .expect("still ongoing after one absence");
    assert_eq!((m.out_cycles_a, m.out_cycles_b), (1, 0));

    // Second consecutive absence: confirmed out, B wins by knockout.
    worker.reconcile(&absent, Utc::now()).expect("cycle");
    let m = store.match_by_id(m.match_id).unwrap().unwrap();
    assert_eq!(m.status, MatchStatus::Completed);
    assert_eq!(m.winner_entity_id, Some(m.side_b.entity_id));
    assert_eq!(m.end_reason_code.as_deref(), Some("KO_A_OUT_OF_GAINERS"));
    assert!(m.end_time.is_some());
}

#[test]
fn hygiene_ends_matches_that_left_the_universe_and_is_idempotent() {
    let (worker, store, _dir) = worker_with(test_config());
    worker.reconcile(&six_movers(), Utc::now()).expect("cycle");

    // AAA and BBB disappear from the candidate universe entirely. Replenish
    // and promote are starved (only the surviving four symbols are free), so
    // the forced ending is the only change to that pair.
    let shrunk = snapshot(
        &[
            ("CCCUSDT", 8.0),
            ("DDDUSDT", 6.0),
            ("EEEUSDT", 4.0),
            ("FFFUSDT", 2.0),
        ],
        &[],
    );

    let report = worker.reconcile(&shrunk, Utc::now()).expect("cycle");
    assert_eq!(report.hygiene_forced_ends, 1);

    let ended = store
        .recent_matches(10)
        .unwrap()
        .into_iter()
        .find(|m| m.pair_key() == "aaausdt|bbbusdt")
        .expect("match exists");
    assert_eq!(ended.status, MatchStatus::Completed);
    assert_eq!(ended.winner_entity_id, None);
    assert_eq!(
        ended.end_reason_code.as_deref(),
        Some("FORCED_END_FILTERED_OUT")
    );

    // Second pass over the same snapshot: no further hygiene changes.
    let report = worker.reconcile(&shrunk, Utc::now()).expect("cycle");
    assert_eq!(report.hygiene_forced_ends, 0);
    assert_eq!(report.hygiene_cancelled, 0);
    let after = store.match_by_id(ended.match_id).unwrap().unwrap();
    assert_eq!(after.end_time, ended.end_time);
    assert_pool_invariants(&store);
}

#[test]
fn pending_pair_dropped_from_universe_is_cancelled() {
    let mut config = test_config();
    // No promotion this run, so created pairs stay Pending.
    config.target_ongoing_matches = 0;
    let (worker, store, _dir) = worker_with(config);

    worker.reconcile(&six_movers(), Utc::now()).expect("cycle");
    assert_eq!(store.count_by_status(MatchStatus::Pending).unwrap(), 3);

    let shrunk = snapshot(
        &[
            ("AAAUSDT", 12.0),
            ("BBBUSDT", 10.0),
            ("CCCUSDT", 8.0),
            ("DDDUSDT", 6.0),
        ],
        &[],
    );
    let report = worker.reconcile(&shrunk, Utc::now()).expect("cycle");
    assert!(report.hygiene_cancelled >= 1);

    let cancelled = store
        .recent_matches(10)
        .unwrap()
        .into_iter()
        .find(|m| m.pair_key() == "eeeusdt|fffusdt")
        .expect("match exists");
    assert_eq!(cancelled.status, MatchStatus::Cancelled);
    assert_eq!(cancelled.end_reason_code.as_deref(), Some("FILTERED_OUT"));
    assert_pool_invariants(&store);
}

#[test]
fn time_limit_forces_completion_with_score_winner() {
    let mut config = test_config();
    config.match_duration_minutes = 0;
    let (worker, store, _dir) = worker_with(config);

    let t0 = Utc::now();
    worker.reconcile(&six_movers(), t0).expect("cycle");
    // Same snapshot, past the (zero-length) duration: every ongoing match is
    // cut off by the time limit even though the engine says NoAction.
    let report = worker
        .reconcile(&six_movers(), t0 + Duration::minutes(1))
        .expect("cycle");
    assert!(report.timed_out >= 1);

    let m = store
        .recent_matches(10)
        .unwrap()
        .into_iter()
        .find(|m| m.pair_key() == "aaausdt|bbbusdt")
        .expect("match exists");
    assert_eq!(m.status, MatchStatus::Completed);
    assert_eq!(m.end_reason_code.as_deref(), Some("TIME_LIMIT"));
    // AAA led on percent gap, so it takes the time-limit win.
    assert_eq!(m.winner_entity_id, Some(m.side_a.entity_id));
}

#[test]
fn allocator_shortfall_is_soft_and_reported() {
    let (worker, store, _dir) = worker_with(test_config());
    // Two symbols support exactly one pair; the target of three cannot be met.
    let thin = snapshot(&[("AAAUSDT", 5.0), ("BBBUSDT", 3.0)], &[]);
    let report = worker.reconcile(&thin, Utc::now()).expect("cycle");
    assert_eq!(report.created, 1);
    assert_eq!(report.allocator_shortfall, 2);
    assert_pool_invariants(&store);
}

#[test]
fn terminal_matches_keep_reason_codes() {
    let (worker, store, _dir) = worker_with(test_config());
    worker.reconcile(&six_movers(), Utc::now()).expect("cycle");
    let shrunk = snapshot(&[("CCCUSDT", 8.0), ("DDDUSDT", 6.0)], &[]);
    worker.reconcile(&shrunk, Utc::now()).expect("cycle");

    for m in store.recent_matches(50).unwrap() {
        if !m.status.is_active() {
            let code = m.end_reason_code.as_deref().unwrap_or("");
            assert!(!code.is_empty(), "terminal match without a reason code");
            assert_eq!(m.ruleset_version.as_deref(), Some("test-rules"));
        }
    }
}
