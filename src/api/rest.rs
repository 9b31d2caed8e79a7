// =============================================================================
// REST API Endpoints (Axum 0.7)
// =============================================================================
//
// Market metadata and candles live under `/api/market/`, strategy compile and
// backtest under `/api/strategy/`. The two WebSocket feeds are mounted on the
// same router under `/stream/`.
//
// CORS is permissive: the charting frontend is served from another origin.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Json, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::error::ApiError;
use crate::market_data::candle_cache::CacheStats;
use crate::strategy::engine::CompiledStrategy;
use crate::strategy::{BacktestReport, StrategyPayload};
use crate::types::{CacheKey, PerpetualMarket, UnifiedCandle};

const INVALID_PAYLOAD: &str = "Invalid payload";

// =============================================================================
// Router construction
// =============================================================================

/// Build the full API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health))
        // ── Market ──────────────────────────────────────────────────
        .route("/api/market/intervals", get(intervals))
        .route("/api/market/perpetuals", get(perpetuals))
        .route("/api/market/candles", get(candles))
        // ── Strategy ────────────────────────────────────────────────
        .route("/api/strategy/compile", post(compile))
        .route("/api/strategy/backtest", post(backtest))
        // ── WebSocket feeds ─────────────────────────────────────────
        .route("/stream/market", get(crate::api::ws::market_socket))
        .route("/stream/strategy", get(crate::api::ws::strategy_socket))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    server_time: i64,
    uptime_secs: u64,
    live_streams: usize,
    cache: CacheStats,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        server_time: chrono::Utc::now().timestamp_millis(),
        uptime_secs: state.uptime_secs(),
        live_streams: state.streams.live_keys().len(),
        cache: state.cache.stats(),
    })
}

// =============================================================================
// Market metadata
// =============================================================================

#[derive(Serialize)]
struct IntervalsResponse {
    intervals: Vec<String>,
}

async fn intervals(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(IntervalsResponse {
        intervals: state.source.supported_intervals(),
    })
}

#[derive(Serialize)]
struct PerpetualsResponse {
    symbols: Vec<PerpetualMarket>,
}

async fn perpetuals(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(PerpetualsResponse {
        symbols: state.source.perpetual_markets(),
    })
}

// =============================================================================
// Candles
// =============================================================================

#[derive(Deserialize)]
struct CandlesQuery {
    symbol: String,
    interval: String,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct CandlesResponse {
    symbol: String,
    interval: String,
    candles: Vec<UnifiedCandle>,
}

async fn candles(
    State(state): State<Arc<AppState>>,
    query: Result<Query<CandlesQuery>, axum::extract::rejection::QueryRejection>,
) -> Result<Json<CandlesResponse>, ApiError> {
    let Query(query) = query.map_err(|_| ApiError::BadRequest(INVALID_PAYLOAD.into()))?;
    let limit = query.limit.unwrap_or(state.config.stream.default_limit);

    if query.symbol.is_empty()
        || query.interval.is_empty()
        || limit == 0
        || limit > state.config.stream.max_limit
    {
        return Err(ApiError::BadRequest(INVALID_PAYLOAD.into()));
    }

    let key = CacheKey::new(query.symbol, query.interval, limit);
    let candles = state.load_candles(&key).await?;

    Ok(Json(CandlesResponse {
        symbol: key.symbol,
        interval: key.interval,
        candles: candles.to_vec(),
    }))
}

// =============================================================================
// Strategy
// =============================================================================

async fn compile(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<StrategyPayload>, JsonRejection>,
) -> Result<Json<CompiledStrategy>, ApiError> {
    let Json(payload) = payload.map_err(|e| {
        warn!(error = %e, "rejected compile payload");
        ApiError::BadRequest(INVALID_PAYLOAD.into())
    })?;
    Ok(Json(state.engine.compile(payload)))
}

#[derive(Deserialize)]
struct BacktestRequest {
    strategy: StrategyPayload,
    symbol: String,
    interval: String,
    lookback: Option<usize>,
}

async fn backtest(
    State(state): State<Arc<AppState>>,
    request: Result<Json<BacktestRequest>, JsonRejection>,
) -> Result<Json<BacktestReport>, ApiError> {
    let Json(request) = request.map_err(|e| {
        warn!(error = %e, "rejected backtest payload");
        ApiError::BadRequest(INVALID_PAYLOAD.into())
    })?;

    let bounds = &state.config.backtest;
    let lookback = request.lookback.unwrap_or(bounds.default_lookback);
    if request.symbol.is_empty()
        || request.interval.is_empty()
        || !(bounds.min_lookback..=bounds.max_lookback).contains(&lookback)
    {
        return Err(ApiError::BadRequest(INVALID_PAYLOAD.into()));
    }

    let key = CacheKey::new(request.symbol, request.interval, lookback);
    let candles = state.load_candles(&key).await?;
    let report = state.engine.backtest(&request.strategy, &candles)?;

    info!(
        strategy_id = %report.strategy_id,
        key = %key,
        markers = report.markers.len(),
        "backtest served"
    );
    Ok(Json(report))
}

// =============================================================================
// Tests
// =============================================================================
