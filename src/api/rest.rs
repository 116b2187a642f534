// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Narrowed from the donor's dashboard-style `/api/v1/...` surface (state,
// positions, regime, decisions, feature-flags, control, trade-journal) down
// to the depth engine's own operational surface: liveness/readiness/metrics
// health probes, a per-symbol `/status`, a cached `/exchange-info`, and the
// `/stream` subscriber WebSocket mounted from `api::ws`. CORS origins come
// from `RuntimeConfig::allowed_origins` rather than the donor's blanket
// `Any`/`Any`/`Any`.
// =============================================================================

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::app_state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    let allowed_origins = state.runtime_config.read().allowed_origins.clone();
    let cors = build_cors(&allowed_origins);

    Router::new()
        .route("/health/liveness", get(liveness))
        .route("/health/readiness", get(readiness))
        .route("/health/metrics", get(metrics))
        .route("/status", get(status))
        .route("/exchange-info", get(exchange_info))
        .route("/stream", get(crate::api::ws::stream_handler))
        .layer(cors)
        .with_state(state)
}

fn build_cors(allowed_origins: &[String]) -> CorsLayer {
    let origin = if allowed_origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let origins: Vec<axum::http::HeaderValue> =
            allowed_origins.iter().filter_map(|o| o.parse().ok()).collect();
        AllowOrigin::list(origins)
    };
    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}

// =============================================================================
// GET /health/liveness — is the process up at all
// =============================================================================

#[derive(Serialize)]
struct LivenessResponse {
    ok: bool,
    uptime_ms: u64,
    last_data_received_at: Option<i64>,
}

async fn liveness(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(LivenessResponse {
        ok: true,
        uptime_ms: state.uptime_ms(),
        last_data_received_at: state.last_data_received_ms(),
    })
}

// =============================================================================
// GET /health/readiness — is the feed actually usable right now
// =============================================================================

#[derive(Serialize)]
struct ReadinessResponse {
    ok: bool,
    live_symbols: usize,
    degraded_symbols: usize,
    critical_symbols: usize,
    total_symbols: usize,
}

async fn readiness(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    use crate::market_data::dispatcher::IntegrityLevelWire;
    use crate::market_data::state_machine::SymbolState;

    let statuses = state.dispatcher.all_statuses();
    let total_symbols = statuses.len();
    let live_symbols = statuses.iter().filter(|s| matches!(s.state, SymbolState::Live)).count();
    let degraded_symbols = statuses
        .iter()
        .filter(|s| matches!(s.integrity, IntegrityLevelWire::Degraded))
        .count();
    let critical_symbols = statuses
        .iter()
        .filter(|s| matches!(s.integrity, IntegrityLevelWire::Critical))
        .count();

    let ok = total_symbols > 0 && live_symbols > 0;
    let status_code = if ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    (
        status_code,
        Json(ReadinessResponse {
            ok,
            live_symbols,
            degraded_symbols,
            critical_symbols,
            total_symbols,
        }),
    )
}

// =============================================================================
// GET /health/metrics — rolled-up rolling counters across active symbols
// =============================================================================

#[derive(Serialize)]
struct MetricsResponse {
    now_ms: i64,
    active_symbol_budget: usize,
    active_symbol_count: usize,
    desyncs_10s: usize,
    desyncs_60s: usize,
    snapshot_ok_60s: usize,
    snapshot_skip_60s: usize,
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let symbols = state.active_symbols();

    let mut desyncs_10s = 0;
    let mut desyncs_60s = 0;
    let mut snapshot_ok_60s = 0;
    let mut snapshot_skip_60s = 0;
    for symbol in &symbols {
        if let Some(counters) = state.symbol_counters(symbol) {
            desyncs_10s += counters.desyncs_10s(now_ms);
            desyncs_60s += counters.desyncs_60s(now_ms);
            snapshot_ok_60s += counters.snapshot_ok_60s(now_ms);
            snapshot_skip_60s += counters.snapshot_skip_60s(now_ms);
        }
    }

    Json(MetricsResponse {
        now_ms,
        active_symbol_budget: state.active_symbol_budget.get(),
        active_symbol_count: symbols.len(),
        desyncs_10s,
        desyncs_60s,
        snapshot_ok_60s,
        snapshot_skip_60s,
    })
}

// =============================================================================
// GET /status — per-symbol detail
// =============================================================================

#[derive(Serialize)]
struct SymbolStatusResponse {
    symbol: String,
    state: String,
    integrity: crate::market_data::dispatcher::IntegrityLevelWire,
    gap_count: u64,
    ewma_gap_ms: f64,
    bid_levels: usize,
    ask_levels: usize,
    last_update_id: u64,
    backoff_ms: Option<u64>,
    consecutive_errors: Option<u64>,
    desyncs_10s: usize,
    broadcasts_10s: usize,
}

#[derive(Serialize)]
struct StatusResponse {
    symbols: Vec<SymbolStatusResponse>,
    active_symbol_budget: usize,
    global_backoff_until_ms: i64,
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let symbols = state
        .dispatcher
        .all_statuses()
        .into_iter()
        .map(|s| {
            let backoff = state.symbol_backoff(&s.symbol);
            let counters = state.symbol_counters(&s.symbol);
            SymbolStatusResponse {
                symbol: s.symbol.clone(),
                state: s.state.to_string(),
                integrity: s.integrity,
                gap_count: s.gap_count,
                ewma_gap_ms: s.ewma_gap_ms,
                bid_levels: s.bid_levels,
                ask_levels: s.ask_levels,
                last_update_id: s.last_update_id,
                backoff_ms: backoff.as_ref().map(|b| b.current_ms()),
                consecutive_errors: backoff.as_ref().map(|b| b.consecutive_errors()),
                desyncs_10s: counters.as_ref().map(|c| c.desyncs_10s(now_ms)).unwrap_or(0),
                broadcasts_10s: counters.as_ref().map(|c| c.broadcasts_10s(now_ms)).unwrap_or(0),
            }
        })
        .collect();

    Json(StatusResponse {
        symbols,
        active_symbol_budget: state.active_symbol_budget.get(),
        global_backoff_until_ms: state.global_backoff.gate_until_ms(),
    })
}

// =============================================================================
// GET /exchange-info — cached venue symbol list
// =============================================================================

async fn exchange_info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.binance.get_exchange_info().await {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "exchange-info upstream call failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({"error": "upstream exchange-info request failed"})),
            )
                .into_response()
        }
    }
}
