// =============================================================================
// Runtime Configuration: service settings loaded once at startup
// =============================================================================
//
// Every field carries `#[serde(default)]` so that a partial `config.json`
// (or none at all) still produces a complete configuration. A handful of
// deployment values can be overridden from the environment after loading.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::strategy::StrategyConfig;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_bind_addr() -> String {
    "0.0.0.0:8081".to_string()
}

fn default_rest_url() -> String {
    "https://api.binance.com".to_string()
}

fn default_ws_url() -> String {
    "wss://stream.binance.com:9443".to_string()
}

fn default_hot_ttl_ms() -> u64 {
    900
}

fn default_warm_ttl_ms() -> u64 {
    5_000
}

fn default_warm_max_entries() -> usize {
    32
}

fn default_stream_limit() -> usize {
    500
}

fn default_max_stream_limit() -> usize {
    1_000
}

fn default_lookback() -> usize {
    500
}

fn default_min_lookback() -> usize {
    100
}

fn default_max_lookback() -> usize {
    1_000
}

// =============================================================================
// Cache
// =============================================================================

/// TTLs and sizing for the two-tier candle cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Hot tier TTL. Short, absorbs request bursts.
    #[serde(default = "default_hot_ttl_ms")]
    pub hot_ttl_ms: u64,

    /// Warm tier TTL. Longer, absorbs churn across reconnects.
    #[serde(default = "default_warm_ttl_ms")]
    pub warm_ttl_ms: u64,

    /// Maximum number of warm entries before soonest-to-expire eviction.
    #[serde(default = "default_warm_max_entries")]
    pub warm_max_entries: usize,
}

impl CacheSettings {
    pub fn hot_ttl(&self) -> Duration {
        Duration::from_millis(self.hot_ttl_ms)
    }

    pub fn warm_ttl(&self) -> Duration {
        Duration::from_millis(self.warm_ttl_ms)
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            hot_ttl_ms: default_hot_ttl_ms(),
            warm_ttl_ms: default_warm_ttl_ms(),
            warm_max_entries: default_warm_max_entries(),
        }
    }
}

// =============================================================================
// Streams
// =============================================================================

/// Delay schedule applied after an upstream kline socket closes or errors.
///
/// Only one reconnect is ever pending per key regardless of policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ReconnectPolicy {
    /// Same delay before every attempt.
    Fixed { delay_ms: u64 },
    /// Doubles per consecutive failure, capped at `max_ms`. Resets once a
    /// connection is established.
    Exponential { base_ms: u64, max_ms: u64 },
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (0-based count of
    /// consecutive failures already seen).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Self::Exponential { base_ms, max_ms } => {
                let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
                Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
            }
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::Fixed { delay_ms: 5_000 }
    }
}

/// Live stream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Buffer length used when a subscriber does not ask for one.
    #[serde(default = "default_stream_limit")]
    pub default_limit: usize,

    /// Largest buffer a subscriber may request.
    #[serde(default = "default_max_stream_limit")]
    pub max_limit: usize,

    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            default_limit: default_stream_limit(),
            max_limit: default_max_stream_limit(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

// =============================================================================
// Backtest
// =============================================================================

/// Bounds on the candle history requested for a backtest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestSettings {
    #[serde(default = "default_lookback")]
    pub default_lookback: usize,

    #[serde(default = "default_min_lookback")]
    pub min_lookback: usize,

    #[serde(default = "default_max_lookback")]
    pub max_lookback: usize,
}

impl Default for BacktestSettings {
    fn default() -> Self {
        Self {
            default_lookback: default_lookback(),
            min_lookback: default_min_lookback(),
            max_lookback: default_max_lookback(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level configuration for the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Address the HTTP / WebSocket server binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Exchange REST base URL.
    #[serde(default = "default_rest_url")]
    pub rest_url: String,

    /// Exchange WebSocket stream base URL.
    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub stream: StreamSettings,

    /// Crossover defaults applied when a strategy payload omits a field.
    #[serde(default)]
    pub strategy: StrategyConfig,

    #[serde(default)]
    pub backtest: BacktestSettings,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            rest_url: default_rest_url(),
            ws_url: default_ws_url(),
            cache: CacheSettings::default(),
            stream: StreamSettings::default(),
            strategy: StrategyConfig::default(),
            backtest: BacktestSettings::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// Returns an error when the file is missing or invalid so the caller can
    /// fall back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            bind_addr = %config.bind_addr,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Apply `QFLOW_BIND_ADDR`, `BINANCE_REST_URL` and `BINANCE_WS_URL`
    /// overrides using the supplied lookup.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("QFLOW_BIND_ADDR").filter(|s| !s.trim().is_empty()) {
            self.bind_addr = addr.trim().to_string();
        }
        if let Some(url) = lookup("BINANCE_REST_URL").filter(|s| !s.trim().is_empty()) {
            self.rest_url = url.trim().trim_end_matches('/').to_string();
        }
        if let Some(url) = lookup("BINANCE_WS_URL").filter(|s| !s.trim().is_empty()) {
            self.ws_url = url.trim().trim_end_matches('/').to_string();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.bind_addr, "0.0.0.0:8081");
        assert_eq!(cfg.cache.hot_ttl_ms, 900);
        assert_eq!(cfg.cache.warm_ttl_ms, 5_000);
        assert_eq!(cfg.cache.warm_max_entries, 32);
        assert_eq!(cfg.stream.default_limit, 500);
        assert_eq!(cfg.stream.reconnect, ReconnectPolicy::Fixed { delay_ms: 5_000 });
        assert_eq!(cfg.strategy.short_period, 9);
        assert_eq!(cfg.strategy.long_period, 26);
        assert_eq!(cfg.backtest.min_lookback, 100);
        assert_eq!(cfg.backtest.max_lookback, 1_000);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.cache.hot_ttl_ms, 900);
        assert_eq!(cfg.rest_url, "https://api.binance.com");
        assert!((cfg.strategy.take_profit_pct - 0.03).abs() < f64::EPSILON);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{
            "cache": { "warm_max_entries": 4 },
            "stream": { "reconnect": { "mode": "exponential", "base_ms": 250, "max_ms": 8000 } }
        }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.cache.warm_max_entries, 4);
        assert_eq!(cfg.cache.warm_ttl_ms, 5_000);
        assert_eq!(
            cfg.stream.reconnect,
            ReconnectPolicy::Exponential { base_ms: 250, max_ms: 8_000 }
        );
        assert_eq!(cfg.stream.max_limit, 1_000);
    }

    #[test]
    fn fixed_policy_never_grows() {
        let policy = ReconnectPolicy::Fixed { delay_ms: 300 };
        assert_eq!(policy.delay(0), Duration::from_millis(300));
        assert_eq!(policy.delay(7), Duration::from_millis(300));
    }

    #[test]
    fn exponential_policy_doubles_and_caps() {
        let policy = ReconnectPolicy::Exponential { base_ms: 100, max_ms: 1_000 };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(4), Duration::from_millis(1_000));
        assert_eq!(policy.delay(90), Duration::from_millis(1_000));
    }

    #[test]
    fn env_overrides_are_applied() {
        let mut cfg = RuntimeConfig::default();
        cfg.apply_env(|name| match name {
            "QFLOW_BIND_ADDR" => Some("127.0.0.1:9000".to_string()),
            "BINANCE_REST_URL" => Some("http://localhost:8080/".to_string()),
            _ => None,
        });
        assert_eq!(cfg.bind_addr, "127.0.0.1:9000");
        assert_eq!(cfg.rest_url, "http://localhost:8080");
        assert_eq!(cfg.ws_url, "wss://stream.binance.com:9443");
    }
}
