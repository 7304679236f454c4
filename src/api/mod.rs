//! Read-only dashboard API and WebSocket push channel.
//!
//! Everything here reads committed state; a request may observe the pool
//! mid-cycle and that is fine. Readers are advisory and never required for
//! the reconciliation loop's correctness.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Query, State},
    http::StatusCode,
    response::{Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

use crate::models::{Config, MatchRecord, MatchStatus, WorkerHealth, WsServerEvent};
use crate::store::MatchStore;
use crate::worker::WORKER_NAME;

/// Shared state for all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<MatchStore>,
    pub events: broadcast::Sender<WsServerEvent>,
    pub config: Config,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/matches", get(get_matches))
        .route("/api/matches/summary", get(get_match_summary))
        .route("/api/gainers", get(get_gainers))
        .route("/api/worker/status", get(get_worker_status))
        .route("/ws", get(websocket_handler))
        .with_state(state)
}

async fn health_check() -> &'static str {
    "CryptoVersus backend operational"
}

#[derive(Debug, Deserialize)]
pub struct MatchesQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct MatchDto {
    pub match_id: i64,
    pub side_a: String,
    pub side_b: String,
    pub score_a: i64,
    pub score_b: i64,
    pub status: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub elapsed_minutes: i64,
    pub remaining_minutes: i64,
    pub is_finished: bool,
    pub winner_entity_id: Option<i64>,
    pub end_reason_code: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MatchSummaryDto {
    pub pending: i64,
    pub ongoing: i64,
    pub completed_last_24h: i64,
    pub upcoming: Vec<MatchDto>,
    pub ongoing_list: Vec<MatchDto>,
}

#[derive(Debug, Serialize)]
pub struct TopGainerDto {
    pub symbol: String,
    pub name: String,
    pub percentage_change: f64,
    pub last_updated: DateTime<Utc>,
    pub rank: usize,
}

#[derive(Debug, Serialize)]
pub struct WorkerStatusDto {
    pub service_name: String,
    pub is_alive: bool,
    pub last_heartbeat: DateTime<Utc>,
    pub last_cycle_start: Option<DateTime<Utc>>,
    pub last_cycle_end: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub status: String,
    pub health: WorkerHealth,
    pub cycle_interval_seconds: u64,
    pub match_duration_minutes: i64,
}

async fn get_matches(
    State(state): State<AppState>,
    Query(params): Query<MatchesQuery>,
) -> Result<Json<Vec<MatchDto>>, StatusCode> {
    let limit = params.limit.unwrap_or(20).min(200);
    let matches = state.store.recent_matches(limit).map_err(|e| {
        warn!(error = ?e, "Failed to load recent matches");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    let now = Utc::now();
    Ok(Json(
        matches
            .iter()
            .map(|m| to_dto(m, now, state.config.match_duration_minutes))
            .collect(),
    ))
}

async fn get_match_summary(
    State(state): State<AppState>,
) -> Result<Json<MatchSummaryDto>, StatusCode> {
    let now = Utc::now();
    let duration = state.config.match_duration_minutes;
    let build = || -> anyhow::Result<MatchSummaryDto> {
        let pending = state.store.count_by_status(MatchStatus::Pending)?;
        let ongoing = state.store.count_by_status(MatchStatus::Ongoing)?;
        let completed_last_24h = state.store.completed_since(now - ChronoDuration::hours(24))?;
        let active = state.store.active_matches()?;
        let upcoming = active
            .iter()
            .filter(|m| m.status == MatchStatus::Pending)
            .map(|m| to_dto(m, now, duration))
            .collect();
        let ongoing_list = active
            .iter()
            .filter(|m| m.status == MatchStatus::Ongoing)
            .map(|m| to_dto(m, now, duration))
            .collect();
        Ok(MatchSummaryDto {
            pending,
            ongoing,
            completed_last_24h,
            upcoming,
            ongoing_list,
        })
    };
    build().map(Json).map_err(|e| {
        warn!(error = ?e, "Failed to build match summary");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

async fn get_gainers(
    State(state): State<AppState>,
) -> Result<Json<Vec<TopGainerDto>>, StatusCode> {
    let gainers = state
        .store
        .top_gainers(state.config.snapshot_take)
        .map_err(|e| {
            warn!(error = ?e, "Failed to load top gainers");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(Json(
        gainers
            .into_iter()
            .enumerate()
            .map(|(i, e)| TopGainerDto {
                symbol: e.symbol,
                name: e.name,
                percentage_change: e.percentage_change,
                last_updated: e.last_updated,
                rank: i + 1,
            })
            .collect(),
    ))
}

async fn get_worker_status(
    State(state): State<AppState>,
) -> Result<Json<WorkerStatusDto>, StatusCode> {
    let record = state
        .store
        .worker_status(WORKER_NAME)
        .map_err(|e| {
            warn!(error = ?e, "Failed to load worker status");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    // Alive means the heartbeat is newer than two cycle intervals.
    let stale_after = ChronoDuration::seconds((state.config.cycle_interval_secs * 2) as i64);
    let is_alive = Utc::now() - record.last_heartbeat < stale_after;

    Ok(Json(WorkerStatusDto {
        service_name: record.worker_name,
        is_alive,
        last_heartbeat: record.last_heartbeat,
        last_cycle_start: record.last_cycle_start,
        last_cycle_end: record.last_cycle_end,
        last_success: record.last_success,
        last_error: record.last_error,
        status: record.status,
        health: record.health,
        cycle_interval_seconds: state.config.cycle_interval_secs,
        match_duration_minutes: state.config.match_duration_minutes,
    }))
}

fn to_dto(m: &MatchRecord, now: DateTime<Utc>, duration_minutes: i64) -> MatchDto {
    let elapsed_minutes = match (m.start_time, m.end_time) {
        (Some(start), Some(end)) => (end - start).num_minutes().max(0),
        (Some(start), None) => (now - start).num_minutes().max(0),
        _ => 0,
    };
    let remaining_minutes = if m.status == MatchStatus::Ongoing {
        (duration_minutes - elapsed_minutes).max(0)
    } else {
        0
    };
    MatchDto {
        match_id: m.match_id,
        side_a: m.side_a.symbol.clone(),
        side_b: m.side_b.symbol.clone(),
        score_a: m.score_a,
        score_b: m.score_b,
        status: m.status.as_str().to_string(),
        start_time: m.start_time,
        end_time: m.end_time,
        elapsed_minutes,
        remaining_minutes,
        is_finished: !m.status.is_active(),
        winner_entity_id: m.winner_entity_id,
        end_reason_code: m.end_reason_code.clone(),
    }
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.events.subscribe();
    loop {
        tokio::select! {
            event = rx.recv() => {
                let Ok(event) = event else { break };
                let msg = serde_json::to_string(&event).unwrap_or_else(|e| {
                    warn!("Failed to serialize ws event: {}", e);
                    "{}".to_string()
                });
                if sender.send(Message::Text(msg)).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) if text == "ping" => {
                        let _ = sender.send(Message::Text("pong".to_string())).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}
