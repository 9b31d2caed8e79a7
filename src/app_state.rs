// =============================================================================
// Central Application State
// =============================================================================
//
// Built once in `main` and shared with every handler as `Arc<AppState>`.
// The market source is injected here, so tests can swap in a scripted one.
// Every subsystem manages its own interior mutability.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use tracing::warn;

use crate::error::MarketError;
use crate::market_data::candle_cache::CandleSeries;
use crate::market_data::{CandleCache, MarketSource, StreamManager};
use crate::runtime_config::RuntimeConfig;
use crate::strategy::StrategyEngine;
use crate::types::CacheKey;

pub struct AppState {
    pub config: RuntimeConfig,
    pub source: Arc<dyn MarketSource>,
    pub cache: Arc<CandleCache>,
    pub streams: Arc<StreamManager>,
    pub engine: StrategyEngine,
    started_at: Instant,
}

impl AppState {
    pub fn new(config: RuntimeConfig, source: Arc<dyn MarketSource>) -> Self {
        let cache = Arc::new(CandleCache::from_settings(&config.cache));
        let streams = Arc::new(StreamManager::new(
            Arc::clone(&source),
            Arc::clone(&cache),
            config.stream.reconnect,
        ));
        let engine = StrategyEngine::new(config.strategy);

        Self {
            config,
            source,
            cache,
            streams,
            engine,
            started_at: Instant::now(),
        }
    }

    /// Candles for `key`, served from the cache when fresh.
    pub async fn load_candles(&self, key: &CacheKey) -> Result<CandleSeries, MarketError> {
        self.cache
            .resolve(key, || {
                self.source
                    .fetch_candles(&key.symbol, &key.interval, key.limit)
            })
            .await
            .map_err(|e| {
                warn!(key = %key, error = %e, "candle fetch failed");
                MarketError::fetch(key, &e)
            })
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("bind_addr", &self.config.bind_addr)
            .field("cache", &self.cache)
            .field("streams", &self.streams)
            .finish()
    }
}
