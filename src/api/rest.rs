// =============================================================================
// Status API: Axum 0.7
// =============================================================================
//
// Read-only endpoints under `/api/v1/`. Nothing here can influence the
// pipeline: handlers only read the lifecycle state, the per-symbol stats and
// the candles already in storage.
//
// CORS is permissive; bind to loopback unless the port is firewalled.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::pipeline::{PipelineState, StateHandle};
use crate::stats::{StatsSnapshot, SymbolStats};
use crate::storage::CandleStore;
use crate::types::now_ms;

const DEFAULT_CANDLE_LIMIT: usize = 100;
const MAX_CANDLE_LIMIT: usize = 1_000;

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    pub state: StateHandle,
    pub stats: Arc<Vec<Arc<SymbolStats>>>,
    pub store: Arc<dyn CandleStore>,
}

impl ApiState {
    pub fn new(
        state: StateHandle,
        stats: Vec<Arc<SymbolStats>>,
        store: Arc<dyn CandleStore>,
    ) -> Self {
        Self {
            state,
            stats: Arc::new(stats),
            store,
        }
    }

    fn find(&self, symbol: &str) -> Option<&Arc<SymbolStats>> {
        self.stats.iter().find(|s| s.symbol() == symbol)
    }
}

// =============================================================================
// Router construction
// =============================================================================

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/stats", get(all_stats))
        .route("/api/v1/stats/*symbol", get(symbol_stats))
        .route("/api/v1/candles/*symbol", get(symbol_candles))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    pipeline: PipelineState,
    symbols: usize,
    ingesting: usize,
    server_time: i64,
}

async fn health(State(api): State<ApiState>) -> impl IntoResponse {
    let pipeline = *api.state.read();
    let resp = HealthResponse {
        status: if pipeline == PipelineState::Running { "ok" } else { "degraded" },
        pipeline,
        symbols: api.stats.len(),
        ingesting: api.stats.iter().filter(|s| s.ingest_alive()).count(),
        server_time: now_ms(),
    };
    Json(resp)
}

// =============================================================================
// Stats
// =============================================================================

async fn all_stats(State(api): State<ApiState>) -> impl IntoResponse {
    let snaps: Vec<StatsSnapshot> = api.stats.iter().map(|s| s.snapshot()).collect();
    Json(snaps)
}

/// `symbol` is the unified form with its slash, e.g. `/api/v1/stats/ETH/USDT`.
async fn symbol_stats(
    State(api): State<ApiState>,
    Path(symbol): Path<String>,
) -> impl IntoResponse {
    let wanted = symbol.to_uppercase();
    match api.find(&wanted) {
        Some(s) => Json(s.snapshot()).into_response(),
        None => unknown_symbol(&wanted),
    }
}

fn unknown_symbol(symbol: &str) -> axum::response::Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": format!("unknown symbol {symbol}") })),
    )
        .into_response()
}

// =============================================================================
// Candles
// =============================================================================

#[derive(Deserialize)]
struct CandleQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct CandleResponse {
    start_ms: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

/// Newest stored candles for one symbol, oldest first. `?limit=` defaults
/// to 100 and is capped at 1000.
async fn symbol_candles(
    State(api): State<ApiState>,
    Path(symbol): Path<String>,
    Query(q): Query<CandleQuery>,
) -> impl IntoResponse {
    let wanted = symbol.to_uppercase();
    if api.find(&wanted).is_none() {
        return unknown_symbol(&wanted);
    }
    let limit = q.limit.unwrap_or(DEFAULT_CANDLE_LIMIT).min(MAX_CANDLE_LIMIT);

    match api.store.recent_candles(&wanted, limit).await {
        Ok(rows) => {
            let candles: Vec<CandleResponse> = rows
                .into_iter()
                .map(|(start_ms, open, high, low, close, volume)| CandleResponse {
                    start_ms,
                    open,
                    high,
                    low,
                    close,
                    volume,
                })
                .collect();
            Json(candles).into_response()
        }
        Err(e) => {
            warn!(symbol = %wanted, error = %e, "candle query failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": "storage unavailable" })),
            )
                .into_response()
        }
    }
}
