// =============================================================================
// Aurora Stream — Main Entry Point
// =============================================================================
//
// Streams Hyperliquid order books and trades for the configured symbols and
// logs the top of book. Every watch loop owns its own retry policy: on a
// dropped connection it waits, reconnects and keeps polling.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use aurora_stream::{Exchange, Hyperliquid, StreamConfig, StreamError};

const CONFIG_PATH: &str = "stream_config.json";
const RETRY_DELAY: Duration = Duration::from_secs(5);

type Venue = Exchange<Hyperliquid>;

/// Back off after `e`, reconnecting first when the connection is gone.
async fn recover(exchange: &Venue, symbol: &str, stream: &str, e: &StreamError) {
    match e {
        StreamError::Timeout { .. } => {
            warn!(symbol, stream, "no update before deadline");
            return;
        }
        _ if e.is_retryable() => {
            error!(symbol, stream, error = %e, "stream lost — reconnecting in 5s");
            tokio::time::sleep(RETRY_DELAY).await;
            if let Err(e) = exchange.reconnect().await {
                error!(error = %e, "reconnect failed");
            }
        }
        _ => {
            error!(symbol, stream, error = %e, "stream error — retrying in 5s");
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Aurora Stream — Starting Up                       ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = StreamConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        StreamConfig::default()
    });
    config.apply_env();
    info!(config = ?config, "Configuration ready");

    // ── 2. Exchange ──────────────────────────────────────────────────────
    let adapter = Hyperliquid::from_symbols(&config.symbols);
    let exchange = Arc::new(Exchange::new(adapter, config)?);
    let symbols = exchange.markets().symbols();

    // ── 3. One-off REST snapshot per symbol ──────────────────────────────
    for symbol in &symbols {
        match exchange.fetch_order_book(symbol, Some(5)).await {
            Ok(book) => info!(
                symbol = %symbol,
                bid = ?book.bids.best(),
                ask = ?book.asks.best(),
                "REST snapshot"
            ),
            Err(e) => warn!(symbol = %symbol, error = %e, "REST snapshot failed"),
        }
    }

    // ── 4. Watch loops ───────────────────────────────────────────────────
    for symbol in &symbols {
        let ex = exchange.clone();
        let sym = symbol.clone();
        tokio::spawn(async move {
            loop {
                match ex.watch_order_book(&sym, Some(10), None).await {
                    Ok(book) => info!(
                        symbol = %sym,
                        bid = ?book.bids.best(),
                        ask = ?book.asks.best(),
                        spread = ?book.spread(),
                        "Order book"
                    ),
                    Err(e) => recover(&ex, &sym, "orderbook", &e).await,
                }
            }
        });

        let ex = exchange.clone();
        let sym = symbol.clone();
        tokio::spawn(async move {
            loop {
                match ex.watch_trades(&sym, None, Some(1), None).await {
                    Ok(trades) => {
                        if let Some(t) = trades.last() {
                            info!(symbol = %sym, side = ?t.side, price = t.price, amount = t.amount, "Trade");
                        }
                    }
                    Err(e) => recover(&ex, &sym, "trades", &e).await,
                }
            }
        });
    }

    info!(count = symbols.len(), "Market data streams launched");

    // ── 5. Rate-limit report (every 60 seconds) ──────────────────────────
    let report = exchange.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            info!(rate_limit = ?report.rate_limit(), "Rate limiter");
        }
    });

    info!("All streams running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — closing connections");
    exchange.close().await;

    info!("Aurora Stream shut down complete.");
    Ok(())
}
