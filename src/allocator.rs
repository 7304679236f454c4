//! Pool allocator: greedy pairing over the ranked snapshot.
//!
//! Produces up to `deficit` new candidate pairs to refill the Pending pool.
//! The pairing is a deterministic greedy walk, not a global optimum: cheap,
//! order-sensitive, and adequate for snapshot sizes in the tens.

use std::collections::HashSet;
use tracing::debug;

use crate::models::{pair_key, GainerEntry, Snapshot};

/// Weight that makes rank distance dominate rank sum in the pair score.
const RANK_DISTANCE_WEIGHT: u64 = 1_000_000;

/// A pair of snapshot entries chosen for materialization as a Pending match.
#[derive(Debug, Clone)]
pub struct CandidatePair {
    pub a: GainerEntry,
    pub b: GainerEntry,
}

impl CandidatePair {
    pub fn key(&self) -> String {
        pair_key(&self.a.symbol, &self.b.symbol)
    }
}

/// Select up to `deficit` pairs from the ranked snapshot.
///
/// `busy_symbols` (lowercase) are symbols already committed to an active
/// match; `existing_pairs` are unordered pair keys of active matches. Both
/// are respected absolutely: no returned pair touches either set. Chosen
/// pairs mark their symbols busy immediately, so later candidates in the
/// same pass cannot reuse them.
pub fn select_pairs(
    snapshot: &Snapshot,
    busy_symbols: &HashSet<String>,
    existing_pairs: &HashSet<String>,
    deficit: usize,
) -> Vec<CandidatePair> {
    if deficit == 0 || snapshot.entries.len() < 2 {
        return Vec::new();
    }

    let entries = &snapshot.entries;

    // All unordered candidate pairs by rank position, minus already-active
    // pairs. Score: prefer close ranks, then higher-ranked (lower sum) pairs.
    let mut candidates: Vec<(u64, usize, usize)> = Vec::new();
    for i in 0..entries.len() {
        for j in (i + 1)..entries.len() {
            let key = pair_key(&entries[i].symbol, &entries[j].symbol);
            if existing_pairs.contains(&key) {
                continue;
            }
            let rank_i = entries[i].rank as u64;
            let rank_j = entries[j].rank as u64;
            let distance = rank_j.abs_diff(rank_i);
            let score = distance * RANK_DISTANCE_WEIGHT + rank_i + rank_j;
            candidates.push((score, i, j));
        }
    }

    candidates.sort_by_key(|(score, i, j)| (*score, *i, *j));

    let mut taken_symbols: HashSet<String> = busy_symbols.clone();
    let mut taken_pairs: HashSet<String> = existing_pairs.clone();
    let mut chosen = Vec::new();

    for (_, i, j) in candidates {
        if chosen.len() >= deficit {
            break;
        }
        let sym_a = entries[i].symbol.to_lowercase();
        let sym_b = entries[j].symbol.to_lowercase();
        if taken_symbols.contains(&sym_a) || taken_symbols.contains(&sym_b) {
            continue;
        }
        let key = pair_key(&sym_a, &sym_b);
        if !taken_pairs.insert(key) {
            continue;
        }
        taken_symbols.insert(sym_a);
        taken_symbols.insert(sym_b);
        chosen.push(CandidatePair {
            a: entries[i].clone(),
            b: entries[j].clone(),
        });
    }

    debug!(
        requested = deficit,
        chosen = chosen.len(),
        "Pool allocator pass complete"
    );

    chosen
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

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
        let universe = entries.iter().map(|e| e.symbol.to_lowercase()).collect();
        Snapshot {
            taken_at: Utc::now(),
            entries,
            universe,
        }
    }

    #[test]
    fn test_prefers_closest_highest_pair_first() {
        let snap = snapshot_of(&["AUSDT", "BUSDT", "CUSDT", "DUSDT"]);
        let pairs = select_pairs(&snap, &HashSet::new(), &HashSet::new(), 2);
        assert_eq!(pairs.len(), 2);
        // Ranks 1&2 first, then 3&4.
        assert_eq!(pairs[0].a.rank, 1);
        assert_eq!(pairs[0].b.rank, 2);
        assert_eq!(pairs[1].a.rank, 3);
        assert_eq!(pairs[1].b.rank, 4);
    }

    #[test]
    fn test_never_touches_busy_symbols() {
        let snap = snapshot_of(&["AUSDT", "BUSDT", "CUSDT", "DUSDT"]);
        let busy: HashSet<String> = ["busdt".to_string()].into_iter().collect();
        let pairs = select_pairs(&snap, &busy, &HashSet::new(), 3);
        for p in &pairs {
            assert_ne!(p.a.symbol, "BUSDT");
            assert_ne!(p.b.symbol, "BUSDT");
        }
        // Best remaining pair skips rank 2 entirely.
        assert_eq!(pairs[0].a.rank, 3);
        assert_eq!(pairs[0].b.rank, 4);
    }

    #[test]
    fn test_skips_existing_pairs() {
        let snap = snapshot_of(&["AUSDT", "BUSDT", "CUSDT"]);
        let existing: HashSet<String> =
            [pair_key("AUSDT", "BUSDT")].into_iter().collect();
        let pairs = select_pairs(&snap, &HashSet::new(), &existing, 1);
        assert_eq!(pairs.len(), 1);
        assert_ne!(pairs[0].key(), pair_key("AUSDT", "BUSDT"));
        // Next-best pair is 2&3 (distance 1, lower sum than 1&3).
        assert_eq!(pairs[0].a.rank, 2);
        assert_eq!(pairs[0].b.rank, 3);
    }

    #[test]
    fn test_symbols_marked_busy_within_one_pass() {
        let snap = snapshot_of(&["AUSDT", "BUSDT", "CUSDT"]);
        let pairs = select_pairs(&snap, &HashSet::new(), &HashSet::new(), 3);
        // Only one pair fits: once 1&2 are taken, rank 3 has no free partner.
        assert_eq!(pairs.len(), 1);
    }

    #[test]
    fn test_shortfall_is_soft() {
        let snap = snapshot_of(&["AUSDT"]);
        let pairs = select_pairs(&snap, &HashSet::new(), &HashSet::new(), 5);
        assert!(pairs.is_empty());
    }

    #[test]
    fn test_zero_deficit_returns_nothing() {
        let snap = snapshot_of(&["AUSDT", "BUSDT"]);
        assert!(select_pairs(&snap, &HashSet::new(), &HashSet::new(), 0).is_empty());
    }
}
