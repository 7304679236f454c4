//! CryptoVersus - market-driven match economy backend
//!
//! A reconciliation worker turns Binance top-gainer snapshots into a pool of
//! simulated matches; a small axum API exposes the committed state to
//! dashboards, with a WebSocket channel for cycle notifications.

use anyhow::{Context, Result};
use dotenv::dotenv;
use std::path::Path;
use std::sync::Arc;
use tokio::{net::TcpListener, sync::broadcast};
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cryptoversus_backend::{
    api::{router, AppState},
    models::{Config, WsServerEvent},
    store::MatchStore,
    worker::MatchWorker,
};

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        interval_secs = config.cycle_interval_secs,
        target_pending = config.target_pending_matches,
        target_ongoing = config.target_ongoing_matches,
        "CryptoVersus backend starting"
    );

    let store = Arc::new(MatchStore::new(&config.database_path)?);

    // Cycle notifications for WebSocket clients; best-effort only.
    let (event_tx, _event_rx) = broadcast::channel::<WsServerEvent>(256);

    let worker = MatchWorker::new(config.clone(), store.clone(), event_tx.clone())?;
    tokio::spawn(worker.run());

    let app_state = AppState {
        store,
        events: event_tx,
        config: config.clone(),
    };
    let app = router(app_state).layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("API server listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cryptoversus_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents), plus the crate directory so
    // running with --manifest-path from elsewhere still finds .env.
    let _ = dotenv();
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
