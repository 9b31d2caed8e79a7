// =============================================================================
// Candle Cache: two-tier TTL read-through cache in front of the exchange
// =============================================================================
//
// Keyed by (symbol, interval, limit). The hot tier has a sub-second TTL and
// absorbs request bursts; the warm tier lives for seconds and absorbs churn
// across reconnects. A warm hit is promoted back into the hot tier.
//
// The warm tier is capped: after any insertion that pushes it over
// `warm_max_entries`, entries are evicted soonest-to-expire first. The hot tier
// has no cap; expired hot entries are pruned whenever a new one is written.
// =============================================================================

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::runtime_config::CacheSettings;
use crate::types::{CacheKey, UnifiedCandle};

/// Shared, immutable candle window. Cloning is a reference-count bump.
pub type CandleSeries = Arc<Vec<UnifiedCandle>>;

#[derive(Debug, Clone)]
struct CacheEntry {
    candles: CandleSeries,
    expires_at: Instant,
}

/// Hit/miss counters, exposed on the health endpoint.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hot_hits: u64,
    pub warm_hits: u64,
    pub misses: u64,
    pub hot_entries: usize,
    pub warm_entries: usize,
}

pub struct CandleCache {
    hot: RwLock<HashMap<CacheKey, CacheEntry>>,
    warm: RwLock<HashMap<CacheKey, CacheEntry>>,
    hot_ttl: Duration,
    warm_ttl: Duration,
    warm_max_entries: usize,
    hot_hits: AtomicU64,
    warm_hits: AtomicU64,
    misses: AtomicU64,
}

impl CandleCache {
    pub fn new(hot_ttl: Duration, warm_ttl: Duration, warm_max_entries: usize) -> Self {
        Self {
            hot: RwLock::new(HashMap::new()),
            warm: RwLock::new(HashMap::new()),
            hot_ttl,
            warm_ttl,
            warm_max_entries,
            hot_hits: AtomicU64::new(0),
            warm_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self::new(settings.hot_ttl(), settings.warm_ttl(), settings.warm_max_entries)
    }

    /// Return the cached candles for `key`, or run `loader` and cache its
    /// result in both tiers.
    ///
    /// Loader failures propagate to the caller and leave the cache untouched.
    pub async fn resolve<F, Fut>(&self, key: &CacheKey, loader: F) -> Result<CandleSeries>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<UnifiedCandle>>>,
    {
        if let Some(candles) = self.lookup(key, Instant::now()) {
            return Ok(candles);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "candle cache miss, loading from upstream");

        let candles: CandleSeries = Arc::new(loader().await?);
        self.store(key, candles.clone(), Instant::now());
        Ok(candles)
    }

    /// Push-only write used by live streams to keep both tiers warm.
    pub fn update(&self, key: &CacheKey, candles: CandleSeries) {
        self.store(key, candles, Instant::now());
    }

    /// Non-expired entry for `key`, checking hot then warm. A warm hit
    /// refreshes the hot tier.
    fn lookup(&self, key: &CacheKey, now: Instant) -> Option<CandleSeries> {
        if let Some(entry) = self.hot.read().get(key) {
            if entry.expires_at > now {
                self.hot_hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.candles.clone());
            }
        }

        let warm = self
            .warm
            .read()
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.candles.clone())?;

        self.warm_hits.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "candle cache warm hit, promoting to hot tier");
        self.hot.write().insert(
            key.clone(),
            CacheEntry {
                candles: warm.clone(),
                expires_at: expiry(now, self.hot_ttl),
            },
        );
        Some(warm)
    }

    fn store(&self, key: &CacheKey, candles: CandleSeries, now: Instant) {
        {
            let mut hot = self.hot.write();
            hot.retain(|_, entry| entry.expires_at > now);
            hot.insert(
                key.clone(),
                CacheEntry {
                    candles: candles.clone(),
                    expires_at: expiry(now, self.hot_ttl),
                },
            );
        }

        let mut warm = self.warm.write();
        warm.insert(
            key.clone(),
            CacheEntry {
                candles,
                expires_at: expiry(now, self.warm_ttl),
            },
        );
        Self::evict_overflow(&mut warm, self.warm_max_entries);
    }

    /// Drop soonest-to-expire entries until `map` is back within `cap`.
    fn evict_overflow(map: &mut HashMap<CacheKey, CacheEntry>, cap: usize) {
        if map.len() <= cap {
            return;
        }
        let overflow = map.len() - cap;
        let mut by_expiry: Vec<(Instant, CacheKey)> = map
            .iter()
            .map(|(key, entry)| (entry.expires_at, key.clone()))
            .collect();
        by_expiry.sort_by_key(|(expires_at, _)| *expires_at);

        for (_, key) in by_expiry.into_iter().take(overflow) {
            debug!(key = %key, "evicting warm candle cache entry");
            map.remove(&key);
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hot_hits: self.hot_hits.load(Ordering::Relaxed),
            warm_hits: self.warm_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            hot_entries: self.hot.read().len(),
            warm_entries: self.warm.read().len(),
        }
    }
}

/// `now + ttl`, saturating at a far-future instant when the TTL would
/// overflow the platform clock.
fn expiry(now: Instant, ttl: Duration) -> Instant {
    const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);
    now.checked_add(ttl)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

impl std::fmt::Debug for CandleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandleCache")
            .field("hot_ttl", &self.hot_ttl)
            .field("warm_ttl", &self.warm_ttl)
            .field("warm_max_entries", &self.warm_max_entries)
            .field("stats", &self.stats())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn candle(open_time: i64, close: f64) -> UnifiedCandle {
        UnifiedCandle {
            open_time,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            base_volume: 1.0,
            close_time: open_time + 59_999,
            quote_volume: close,
            trade_count: 1,
            taker_buy_base_volume: 0.5,
            taker_buy_quote_volume: close / 2.0,
        }
    }

    fn series(close: f64) -> CandleSeries {
        Arc::new(vec![candle(0, close)])
    }

    fn key(symbol: &str) -> CacheKey {
        CacheKey::new(symbol, "1m", 100)
    }

    #[tokio::test]
    async fn second_resolve_within_hot_ttl_hits_cache() {
        let cache = CandleCache::new(Duration::from_secs(60), Duration::from_secs(120), 8);
        let calls = AtomicUsize::new(0);
        let k = key("BTCUSDT");

        for _ in 0..2 {
            let candles = cache
                .resolve(&k, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(vec![candle(0, 10.0)])
                })
                .await
                .unwrap();
            assert_eq!(candles.len(), 1);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hot_hits, 1);
    }

    #[tokio::test]
    async fn loader_failure_is_not_cached() {
        let cache = CandleCache::new(Duration::from_secs(60), Duration::from_secs(120), 8);
        let k = key("ETHUSDT");

        let err = cache
            .resolve(&k, || async { Err(anyhow::anyhow!("exchange down")) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exchange down"));
        assert_eq!(cache.stats().warm_entries, 0);
        assert_eq!(cache.stats().hot_entries, 0);

        let candles = cache
            .resolve(&k, || async { Ok(vec![candle(0, 3.0)]) })
            .await
            .unwrap();
        assert!((candles[0].close - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn warm_hit_promotes_into_hot_tier() {
        let cache = CandleCache::new(Duration::from_millis(100), Duration::from_secs(5), 8);
        let k = key("BTCUSDT");
        let t0 = Instant::now();
        cache.store(&k, series(1.0), t0);

        // Past the hot TTL, still inside the warm TTL.
        let t1 = t0 + Duration::from_millis(500);
        assert!(cache.lookup(&k, t1).is_some());
        assert_eq!(cache.stats().warm_hits, 1);

        // The promotion refreshed the hot entry relative to t1.
        let t2 = t1 + Duration::from_millis(50);
        assert!(cache.lookup(&k, t2).is_some());
        assert_eq!(cache.stats().hot_hits, 1);
        assert_eq!(cache.stats().warm_hits, 1);
    }

    #[test]
    fn expired_in_both_tiers_is_a_miss() {
        let cache = CandleCache::new(Duration::from_millis(100), Duration::from_millis(200), 8);
        let k = key("BTCUSDT");
        let t0 = Instant::now();
        cache.store(&k, series(1.0), t0);
        assert!(cache.lookup(&k, t0 + Duration::from_millis(200)).is_none());
    }

    #[test]
    fn warm_overflow_evicts_soonest_to_expire() {
        let cache = CandleCache::new(Duration::from_millis(10), Duration::from_secs(5), 3);
        let t0 = Instant::now();
        let symbols = ["A", "B", "C", "D", "E"];
        for (i, sym) in symbols.iter().enumerate() {
            cache.store(&key(sym), series(i as f64), t0 + Duration::from_millis(i as u64 * 10));
        }

        let warm = cache.warm.read();
        assert_eq!(warm.len(), 3);
        assert!(!warm.contains_key(&key("A")));
        assert!(!warm.contains_key(&key("B")));
        for sym in ["C", "D", "E"] {
            assert!(warm.contains_key(&key(sym)), "{sym} should survive");
        }
    }

    #[test]
    fn refreshing_an_entry_protects_it_from_eviction() {
        let cache = CandleCache::new(Duration::from_millis(10), Duration::from_secs(5), 2);
        let t0 = Instant::now();
        cache.store(&key("A"), series(1.0), t0);
        cache.store(&key("B"), series(2.0), t0 + Duration::from_millis(10));
        // A is rewritten (as a live update would) and now expires last.
        cache.store(&key("A"), series(1.5), t0 + Duration::from_millis(20));
        cache.store(&key("C"), series(3.0), t0 + Duration::from_millis(30));

        let warm = cache.warm.read();
        assert_eq!(warm.len(), 2);
        assert!(warm.contains_key(&key("A")));
        assert!(!warm.contains_key(&key("B")));
        assert!(warm.contains_key(&key("C")));
    }

    #[test]
    fn update_overwrites_both_tiers() {
        let cache = CandleCache::new(Duration::from_secs(60), Duration::from_secs(120), 8);
        let k = key("SOLUSDT");
        cache.update(&k, series(1.0));
        cache.update(&k, series(2.0));
        let hit = cache.lookup(&k, Instant::now()).unwrap();
        assert!((hit[0].close - 2.0).abs() < f64::EPSILON);
        assert_eq!(cache.stats().warm_entries, 1);
    }

    #[test]
    fn keys_differing_only_by_limit_are_distinct() {
        let cache = CandleCache::new(Duration::from_secs(60), Duration::from_secs(120), 8);
        let a = CacheKey::new("BTCUSDT", "1m", 100);
        let b = CacheKey::new("BTCUSDT", "1m", 200);
        cache.update(&a, series(1.0));
        assert!(cache.lookup(&b, Instant::now()).is_none());
    }

    #[test]
    fn oversized_ttls_saturate_instead_of_overflowing() {
        let t = Instant::now();
        assert!(expiry(t, Duration::MAX) > t + Duration::from_secs(3600));
        assert!(expiry(t, Duration::from_millis(u64::MAX)) > t);

        let cache = CandleCache::new(Duration::MAX, Duration::MAX, 8);
        let k = key("BTCUSDT");
        let t0 = Instant::now();
        cache.store(&k, series(1.0), t0);

        assert!(cache.lookup(&k, t0 + Duration::from_secs(3600)).is_some());
        assert_eq!(cache.stats().hot_hits, 1);

        // Warm promotion computes a fresh hot expiry as well.
        cache.hot.write().clear();
        assert!(cache.lookup(&k, t0 + Duration::from_secs(7200)).is_some());
        assert_eq!(cache.stats().warm_hits, 1);
    }
}
