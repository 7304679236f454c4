//! Binance 24h ticker client and ranked snapshot builder.
//!
//! The ticker response is the only external market input: everything the
//! lifecycle controller does each cycle derives from one ranked snapshot
//! built here.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, warn};

use crate::models::{Config, GainerEntry, Snapshot, TickerEntry};

const FETCH_TIMEOUT_SECS: u64 = 10;

pub struct GainersClient {
    client: Client,
    ticker_url: String,
}

impl GainersClient {
    pub fn new(ticker_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
            .user_agent("CryptoVersus/1.0 (Match Worker)")
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            ticker_url: ticker_url.to_string(),
        })
    }

    /// Fetch the full 24h ticker list. A failure here aborts the cycle; the
    /// caller never mutates anything on a failed fetch.
    pub async fn fetch_24h_tickers(&self) -> Result<Vec<TickerEntry>> {
        let response = self
            .client
            .get(&self.ticker_url)
            .send()
            .await
            .context("Ticker request failed")?
            .error_for_status()
            .context("Ticker request returned error status")?;

        let tickers: Vec<TickerEntry> = response
            .json()
            .await
            .context("Failed to parse ticker response")?;

        debug!("Fetched {} ticker rows", tickers.len());
        Ok(tickers)
    }
}

/// Build the ranked snapshot for one cycle.
///
/// Filters to the quote suffix and liquidity thresholds, deduplicates, sorts
/// by percent change descending, truncates to the configured take size and
/// assigns 1-based ranks. The pre-truncation symbol set is kept as the
/// candidate universe for the hygiene pass.
pub fn build_snapshot(
    tickers: &[TickerEntry],
    config: &Config,
    taken_at: DateTime<Utc>,
) -> Snapshot {
    let mut seen: HashSet<String> = HashSet::new();
    let mut qualified: Vec<(String, f64)> = Vec::new();

    for t in tickers {
        if !t.symbol.ends_with(&config.quote_suffix) {
            continue;
        }
        if t.count < config.min_trade_count {
            continue;
        }
        let quote_volume: f64 = match t.quote_volume.parse() {
            Ok(v) => v,
            Err(_) => continue,
        };
        if quote_volume < config.min_quote_volume {
            continue;
        }
        let percent: f64 = match t.price_change_percent.parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(symbol = %t.symbol, raw = %t.price_change_percent, "Unparseable percent change, skipping");
                continue;
            }
        };
        // First occurrence wins on duplicate symbols.
        if !seen.insert(t.symbol.to_lowercase()) {
            continue;
        }
        qualified.push((t.symbol.clone(), percent));
    }

    let universe: HashSet<String> = qualified
        .iter()
        .map(|(s, _)| s.to_lowercase())
        .collect();

    qualified.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let entries: Vec<GainerEntry> = qualified
        .into_iter()
        .take(config.snapshot_take)
        .enumerate()
        .map(|(i, (symbol, percent_change))| GainerEntry {
            symbol,
            rank: (i + 1) as u32,
            percent_change,
        })
        .collect();

    Snapshot {
        taken_at,
        entries,
        universe,
    }
}
