// =============================================================================
// Error taxonomy for the market core and its HTTP surface
// =============================================================================
//
// Upstream plumbing uses `anyhow` with context; the conditions callers need to
// distinguish are lifted into the enums below. Strategy configuration is never
// an error: malformed values are coerced to defaults during resolution.
// =============================================================================

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::types::CacheKey;

/// Failures originating from the upstream market source.
#[derive(Debug, thiserror::Error)]
pub enum MarketError {
    /// The REST snapshot fetch failed. Nothing was cached.
    #[error("upstream fetch failed for {key}: {reason}")]
    UpstreamFetch { key: CacheKey, reason: String },

    /// The kline socket errored or closed. Handled by reconnecting; never
    /// delivered to subscribers.
    #[error("upstream stream error for {key}: {reason}")]
    UpstreamStream { key: CacheKey, reason: String },

    /// A raw tick could not be normalised into a candle.
    #[error("malformed upstream message: {0}")]
    MalformedUpstreamMessage(String),
}

impl MarketError {
    pub fn fetch(key: &CacheKey, err: &anyhow::Error) -> Self {
        Self::UpstreamFetch {
            key: key.clone(),
            reason: format!("{err:#}"),
        }
    }
}

/// Backtest precondition failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BacktestError {
    #[error("not enough candles to backtest: have {have}, need {need}")]
    InsufficientData { have: usize, need: usize },
}

/// Errors returned by the REST handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("bad_request: {0}")]
    BadRequest(String),
    #[error("upstream_error: {0}")]
    Upstream(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg),
        };
        (status, axum::Json(json!({ "message": message }))).into_response()
    }
}

impl From<BacktestError> for ApiError {
    fn from(e: BacktestError) -> Self {
        Self::BadRequest(e.to_string())
    }
}

/// Every market failure surfaces as the same upstream message; the detail is
/// logged where the failure happened.
impl From<MarketError> for ApiError {
    fn from(_: MarketError) -> Self {
        Self::Upstream("Failed to load candles".to_string())
    }
}
