// =============================================================================
// Aurora Depth Engine — Main Entry Point
// =============================================================================
//
// Boots the runtime config, the shared `AppState` (symbol registry, fan-out,
// multiplexer, autoscaler), seeds the configured symbol set, and starts the
// three background loops that keep the engine healthy: the upstream
// multiplexer's combined-stream connection, the per-symbol integrity tick,
// and the autoscaler evaluation. The HTTP/WebSocket surface is served
// alongside all of it until a Ctrl+C signals a graceful shutdown.
// =============================================================================

mod api;
mod app_state;
mod binance;
mod fanout;
mod market_data;
mod runtime_config;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::runtime_config::RuntimeConfig;

const RUNTIME_CONFIG_PATH: &str = "runtime_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Aurora Depth Engine starting up");

    let config = RuntimeConfig::from_env();
    info!(symbols = ?config.symbols, port = config.port, "runtime config loaded");

    let state = Arc::new(AppState::new(config));

    // Seed the initial active set. Each `ensure_symbol` spawns its
    // `SymbolActor` + `ResyncSupervisor` pair and registers the symbol with
    // the multiplexer; the supervisor kicks off the first snapshot fetch
    // itself (staggered — see `app_state::SNAPSHOT_STAGGER`).
    let initial_symbols = state.runtime_config.read().symbols.clone();
    for symbol in &initial_symbols {
        state.ensure_symbol(symbol);
    }
    info!(count = initial_symbols.len(), "seeded initial symbol set");

    // Upstream combined-stream connection: one task for the process.
    let mux = state.multiplexer.clone();
    tokio::spawn(async move {
        mux.run().await;
    });

    // Per-symbol integrity/liveness tick (spec §4.4/§4.9).
    let tick_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(1_000));
        loop {
            interval.tick().await;
            let now_ms = chrono::Utc::now().timestamp_millis();
            tick_state.tick_all_symbols(now_ms);
        }
    });

    // Autoscaler: averages live-uptime across the active set once a second
    // and trims or grows the budget accordingly (spec §4.10).
    let autoscaler_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(crate::market_data::autoscaler::tick_interval());
        loop {
            interval.tick().await;
            let now_ms = chrono::Utc::now().timestamp_millis();
            autoscaler_state.tick_autoscaler(now_ms);
        }
    });

    // Subscriber heartbeat sweep: disconnect anyone who hasn't ponged within
    // `clientStaleConnectionMs` (spec §4.8 / §6).
    let heartbeat_state = state.clone();
    tokio::spawn(async move {
        loop {
            let (heartbeat_interval_ms, stale_after_ms) = {
                let cfg = heartbeat_state.runtime_config.read();
                (cfg.client_heartbeat_interval_ms, cfg.client_stale_connection_ms)
            };
            tokio::time::sleep(Duration::from_millis(heartbeat_interval_ms)).await;
            heartbeat_state.fanout.sweep_stale(Duration::from_millis(stale_after_ms));
        }
    });

    // HTTP/WebSocket server.
    let server_state = state.clone();
    let bind_addr = server_state.runtime_config.read().bind_addr()?;
    tokio::spawn(async move {
        let app = api::rest::router(server_state);
        let listener = match tokio::net::TcpListener::bind(bind_addr).await {
            Ok(listener) => listener,
            Err(err) => {
                error!(error = %err, addr = %bind_addr, "failed to bind HTTP listener");
                return;
            }
        };
        info!(addr = %bind_addr, "HTTP server listening");
        if let Err(err) = axum::serve(listener, app).await {
            error!(error = %err, "HTTP server exited with an error");
        }
    });

    info!("all subsystems running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    if let Err(err) = state.runtime_config.read().save(RUNTIME_CONFIG_PATH) {
        error!(error = %err, "failed to save runtime config on shutdown");
    }

    info!("aurora depth engine shut down complete");
    Ok(())
}
