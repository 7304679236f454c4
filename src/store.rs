//! SQLite-backed match store.
//!
//! Single writer (the reconciliation worker); API readers see committed
//! state only. All multi-field match mutations are single UPDATE statements,
//! so one match's fields always commit together. Terminal and start
//! transitions carry a status guard in the WHERE clause, which keeps the
//! state machine forward-only even if a cycle is replayed.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, Row};
use std::sync::Arc;
use tracing::{info, warn};

use crate::models::{
    Entity, GainerEntry, MatchRecord, MatchSide, MatchStatus, WorkerStatusRecord,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS entities (
    entity_id INTEGER PRIMARY KEY,
    symbol TEXT NOT NULL UNIQUE COLLATE NOCASE,
    name TEXT NOT NULL,
    percentage_change REAL NOT NULL DEFAULT 0,
    last_updated TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS matches (
    match_id INTEGER PRIMARY KEY,
    entity_a_id INTEGER NOT NULL REFERENCES entities(entity_id),
    entity_b_id INTEGER NOT NULL REFERENCES entities(entity_id),
    status TEXT NOT NULL DEFAULT 'Pending',
    score_a INTEGER NOT NULL DEFAULT 0,
    score_b INTEGER NOT NULL DEFAULT 0,
    start_time TEXT,
    end_time TEXT,
    out_cycles_a INTEGER NOT NULL DEFAULT 0,
    out_cycles_b INTEGER NOT NULL DEFAULT 0,
    winner_entity_id INTEGER REFERENCES entities(entity_id),
    end_reason_code TEXT,
    end_reason_detail TEXT,
    ruleset_version TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_matches_status ON matches(status, created_at);
CREATE INDEX IF NOT EXISTS idx_matches_created ON matches(created_at DESC);

CREATE TABLE IF NOT EXISTS worker_status (
    worker_name TEXT PRIMARY KEY,
    last_heartbeat TEXT NOT NULL,
    last_cycle_start TEXT,
    last_cycle_end TEXT,
    last_success TEXT,
    last_error TEXT,
    status TEXT NOT NULL DEFAULT 'Idle',
    health_json TEXT NOT NULL DEFAULT '{}',
    updated_at TEXT NOT NULL
) WITHOUT ROWID;
"#;

const MATCH_SELECT: &str = r#"
SELECT m.match_id, m.status, m.score_a, m.score_b,
       m.start_time, m.end_time, m.out_cycles_a, m.out_cycles_b,
       m.winner_entity_id, m.end_reason_code, m.end_reason_detail,
       m.ruleset_version, m.created_at,
       ea.entity_id, ea.symbol, ea.percentage_change,
       eb.entity_id, eb.symbol, eb.percentage_change
FROM matches m
JOIN entities ea ON ea.entity_id = m.entity_a_id
JOIN entities eb ON eb.entity_id = m.entity_b_id
"#;

pub struct MatchStore {
    conn: Arc<Mutex<Connection>>,
}

impl MatchStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // locking handled by our own mutex

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let match_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM matches", [], |row| row.get(0))
            .unwrap_or(0);
        info!(
            "Match store initialized at {} ({} matches on record)",
            db_path, match_count
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ==========
    // Entities
    // ==========

    /// Upsert every snapshot entry as an entity, refreshing its last known
    /// percent change. One transaction per snapshot.
    pub fn upsert_gainers(
        &self,
        entries: &[GainerEntry],
        quote_suffix: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("Failed to begin transaction")?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO entities (symbol, name, percentage_change, last_updated)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(symbol) DO UPDATE SET
                     percentage_change = excluded.percentage_change,
                     last_updated = excluded.last_updated",
            )?;
            for e in entries {
                let name = e
                    .symbol
                    .strip_suffix(quote_suffix)
                    .unwrap_or(&e.symbol)
                    .to_string();
                stmt.execute(params![
                    e.symbol,
                    name,
                    e.percent_change,
                    now.to_rfc3339()
                ])?;
            }
        }
        tx.commit().context("Failed to commit gainer upsert")?;
        Ok(())
    }

    pub fn entity_by_symbol(&self, symbol: &str) -> Result<Option<Entity>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT entity_id, symbol, name, percentage_change, last_updated
             FROM entities WHERE symbol = ?1 COLLATE NOCASE",
        )?;
        let entity = stmt
            .query_row(params![symbol], row_to_entity)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(entity)
    }

    /// Latest stored gainers, strongest movers first.
    pub fn top_gainers(&self, limit: usize) -> Result<Vec<Entity>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT entity_id, symbol, name, percentage_change, last_updated
             FROM entities ORDER BY percentage_change DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_entity)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ==========
    // Matches
    // ==========

    /// Create a Pending match between two known entities.
    pub fn create_pending_match(
        &self,
        symbol_a: &str,
        symbol_b: &str,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let a = self
            .entity_by_symbol(symbol_a)?
            .with_context(|| format!("Unknown entity symbol {symbol_a}"))?;
        let b = self
            .entity_by_symbol(symbol_b)?
            .with_context(|| format!("Unknown entity symbol {symbol_b}"))?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO matches (entity_a_id, entity_b_id, status, created_at)
             VALUES (?1, ?2, 'Pending', ?3)",
            params![a.entity_id, b.entity_id, now.to_rfc3339()],
        )
        .context("Failed to insert match")?;
        Ok(conn.last_insert_rowid())
    }

    /// All Pending and Ongoing matches with both entities joined.
    pub fn active_matches(&self) -> Result<Vec<MatchRecord>> {
        self.query_matches(
            &format!("{MATCH_SELECT} WHERE m.status IN ('Pending','Ongoing') ORDER BY m.created_at, m.match_id"),
            &[],
        )
    }

    /// Oldest Pending matches first (promotion order).
    pub fn pending_matches(&self, limit: usize) -> Result<Vec<MatchRecord>> {
        self.query_matches(
            &format!("{MATCH_SELECT} WHERE m.status = 'Pending' ORDER BY m.created_at, m.match_id LIMIT ?1"),
            &[&(limit as i64)],
        )
    }

    pub fn ongoing_matches(&self) -> Result<Vec<MatchRecord>> {
        self.query_matches(
            &format!("{MATCH_SELECT} WHERE m.status = 'Ongoing' ORDER BY m.created_at, m.match_id"),
            &[],
        )
    }

    pub fn recent_matches(&self, limit: usize) -> Result<Vec<MatchRecord>> {
        self.query_matches(
            &format!("{MATCH_SELECT} ORDER BY m.created_at DESC, m.match_id DESC LIMIT ?1"),
            &[&(limit as i64)],
        )
    }

    pub fn count_by_status(&self, status: MatchStatus) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM matches WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn completed_since(&self, since: DateTime<Utc>) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM matches WHERE status = 'Completed' AND end_time >= ?1",
            params![since.to_rfc3339()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Pending -> Ongoing. Sets the start time exactly once, zeroes the
    /// hysteresis counters and clears any stale end-reason fields. Returns
    /// false when the row was not Pending (already promoted or terminal).
    pub fn start_match(
        &self,
        match_id: i64,
        start_time: DateTime<Utc>,
        ruleset_version: &str,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE matches SET
                 status = 'Ongoing',
                 start_time = ?2,
                 out_cycles_a = 0,
                 out_cycles_b = 0,
                 winner_entity_id = NULL,
                 end_reason_code = NULL,
                 end_reason_detail = NULL,
                 ruleset_version = ?3
             WHERE match_id = ?1 AND status = 'Pending'",
            params![match_id, start_time.to_rfc3339(), ruleset_version],
        )?;
        Ok(changed > 0)
    }

    /// Pending -> Cancelled with terminal audit fields.
    pub fn cancel_match(
        &self,
        match_id: i64,
        end_time: DateTime<Utc>,
        reason_code: &str,
        reason_detail: &str,
        ruleset_version: &str,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE matches SET
                 status = 'Cancelled',
                 end_time = ?2,
                 end_reason_code = ?3,
                 end_reason_detail = ?4,
                 ruleset_version = ?5
             WHERE match_id = ?1 AND status = 'Pending'",
            params![
                match_id,
                end_time.to_rfc3339(),
                reason_code,
                reason_detail,
                ruleset_version
            ],
        )?;
        Ok(changed > 0)
    }

    /// Ongoing -> Completed. `winner_entity_id` is None for walkovers and
    /// forced endings.
    #[allow(clippy::too_many_arguments)]
    pub fn complete_match(
        &self,
        match_id: i64,
        end_time: DateTime<Utc>,
        winner_entity_id: Option<i64>,
        reason_code: &str,
        reason_detail: &str,
        ruleset_version: &str,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE matches SET
                 status = 'Completed',
                 end_time = ?2,
                 winner_entity_id = ?3,
                 end_reason_code = ?4,
                 end_reason_detail = ?5,
                 ruleset_version = ?6
             WHERE match_id = ?1 AND status = 'Ongoing'",
            params![
                match_id,
                end_time.to_rfc3339(),
                winner_entity_id,
                reason_code,
                reason_detail,
                ruleset_version
            ],
        )?;
        Ok(changed > 0)
    }

    /// Score recompute while Ongoing; frozen once terminal via the guard.
    pub fn update_score(&self, match_id: i64, score_a: i64, score_b: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE matches SET score_a = ?2, score_b = ?3
             WHERE match_id = ?1 AND status = 'Ongoing'",
            params![match_id, score_a, score_b],
        )?;
        Ok(changed > 0)
    }

    /// Persist hysteresis counters (also on NoAction cycles).
    pub fn update_out_cycles(&self, match_id: i64, out_a: u32, out_b: u32) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE matches SET out_cycles_a = ?2, out_cycles_b = ?3
             WHERE match_id = ?1 AND status = 'Ongoing'",
            params![match_id, out_a, out_b],
        )?;
        Ok(changed > 0)
    }

    pub fn match_by_id(&self, match_id: i64) -> Result<Option<MatchRecord>> {
        let rows = self.query_matches(
            &format!("{MATCH_SELECT} WHERE m.match_id = ?1"),
            &[&match_id],
        )?;
        Ok(rows.into_iter().next())
    }

    fn query_matches(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<MatchRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params, row_to_match)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ==========
    // Worker status
    // ==========

    /// Best-effort heartbeat row; failure here must never fail a cycle.
    pub fn upsert_worker_status(&self, record: &WorkerStatusRecord) -> Result<()> {
        let health_json =
            serde_json::to_string(&record.health).unwrap_or_else(|_| "{}".to_string());
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO worker_status
                 (worker_name, last_heartbeat, last_cycle_start, last_cycle_end,
                  last_success, last_error, status, health_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(worker_name) DO UPDATE SET
                 last_heartbeat = excluded.last_heartbeat,
                 last_cycle_start = excluded.last_cycle_start,
                 last_cycle_end = excluded.last_cycle_end,
                 last_success = excluded.last_success,
                 last_error = excluded.last_error,
                 status = excluded.status,
                 health_json = excluded.health_json,
                 updated_at = excluded.updated_at",
            params![
                record.worker_name,
                record.last_heartbeat.to_rfc3339(),
                record.last_cycle_start.map(|t| t.to_rfc3339()),
                record.last_cycle_end.map(|t| t.to_rfc3339()),
                record.last_success.map(|t| t.to_rfc3339()),
                record.last_error,
                record.status,
                health_json,
                record.updated_at.to_rfc3339(),
            ],
        )
        .context("Failed to upsert worker status")?;
        Ok(())
    }

    pub fn worker_status(&self, worker_name: &str) -> Result<Option<WorkerStatusRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT worker_name, last_heartbeat, last_cycle_start, last_cycle_end,
                    last_success, last_error, status, health_json, updated_at
             FROM worker_status WHERE worker_name = ?1",
        )?;
        let record = stmt
            .query_row(params![worker_name], |row| {
                let health_json: String = row.get(7)?;
                Ok(WorkerStatusRecord {
                    worker_name: row.get(0)?,
                    last_heartbeat: parse_ts(&row.get::<_, String>(1)?)?,
                    last_cycle_start: parse_opt_ts(row.get::<_, Option<String>>(2)?)?,
                    last_cycle_end: parse_opt_ts(row.get::<_, Option<String>>(3)?)?,
                    last_success: parse_opt_ts(row.get::<_, Option<String>>(4)?)?,
                    last_error: row.get(5)?,
                    status: row.get(6)?,
                    health: serde_json::from_str(&health_json).unwrap_or_default(),
                    updated_at: parse_ts(&row.get::<_, String>(8)?)?,
                })
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(record)
    }
}

fn row_to_entity(row: &Row<'_>) -> rusqlite::Result<Entity> {
    Ok(Entity {
        entity_id: row.get(0)?,
        symbol: row.get(1)?,
        name: row.get(2)?,
        percentage_change: row.get(3)?,
        last_updated: parse_ts(&row.get::<_, String>(4)?)?,
    })
}

fn row_to_match(row: &Row<'_>) -> rusqlite::Result<MatchRecord> {
    let status_raw: String = row.get(1)?;
    let status = MatchStatus::parse(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown match status '{status_raw}'").into(),
        )
    })?;
    Ok(MatchRecord {
        match_id: row.get(0)?,
        status,
        score_a: row.get(2)?,
        score_b: row.get(3)?,
        start_time: parse_opt_ts(row.get::<_, Option<String>>(4)?)?,
        end_time: parse_opt_ts(row.get::<_, Option<String>>(5)?)?,
        out_cycles_a: row.get::<_, i64>(6)? as u32,
        out_cycles_b: row.get::<_, i64>(7)? as u32,
        winner_entity_id: row.get(8)?,
        end_reason_code: row.get(9)?,
        end_reason_detail: row.get(10)?,
        ruleset_version: row.get(11)?,
        created_at: parse_ts(&row.get::<_, String>(12)?)?,
        side_a: MatchSide {
            entity_id: row.get(13)?,
            symbol: row.get(14)?,
            percentage_change: row.get(15)?,
        },
        side_b: MatchSide {
            entity_id: row.get(16)?,
            symbol: row.get(17)?,
            percentage_change: row.get(18)?,
        },
    })
}

fn parse_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_opt_ts(raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(&s)).transpose()
}
