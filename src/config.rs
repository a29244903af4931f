// =============================================================================
// Stream Configuration - endpoints, keepalive, cache sizes and rate budget
// =============================================================================
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry serde defaults so that an older or partial config
// file still loads.
//
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::market_data::CacheLimits;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_ws_url() -> String {
    "wss://api.hyperliquid.xyz/ws".to_string()
}

fn default_rest_url() -> String {
    "https://api.hyperliquid.xyz".to_string()
}

fn default_keepalive_ms() -> u64 {
    20_000
}

fn default_pong_timeout_factor() -> u32 {
    2
}

fn default_watch_timeout_ms() -> u64 {
    30_000
}

fn default_cache_limit() -> usize {
    1000
}

fn default_symbols() -> Vec<String> {
    vec!["BTC/USDC:USDC".to_string(), "ETH/USDC:USDC".to_string()]
}

fn default_capacity() -> f64 {
    1200.0
}

fn default_refill_per_sec() -> f64 {
    20.0
}

// =============================================================================
// RateLimitConfig
// =============================================================================

/// Token-bucket parameters for one venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_capacity")]
    pub capacity: f64,

    #[serde(default = "default_refill_per_sec")]
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_per_sec: default_refill_per_sec(),
        }
    }
}

// =============================================================================
// StreamConfig
// =============================================================================

#[derive(Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    // --- Endpoints -----------------------------------------------------------

    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    #[serde(default = "default_rest_url")]
    pub rest_url: String,

    // --- Liveness ------------------------------------------------------------

    /// Interval between application-level pings.
    #[serde(default = "default_keepalive_ms")]
    pub keepalive_ms: u64,

    /// The connection is declared dead after `factor × keepalive` without a pong.
    #[serde(default = "default_pong_timeout_factor")]
    pub pong_timeout_factor: u32,

    /// How long a watch call waits for the next update.
    #[serde(default = "default_watch_timeout_ms")]
    pub watch_timeout_ms: u64,

    // --- Cache sizes ---------------------------------------------------------

    #[serde(default = "default_cache_limit")]
    pub trades_limit: usize,

    #[serde(default = "default_cache_limit")]
    pub ohlcv_limit: usize,

    #[serde(default = "default_cache_limit")]
    pub orders_limit: usize,

    // --- Pacing --------------------------------------------------------------

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Weight charged per subscribe frame; `None` when the venue does not
    /// meter subscriptions.
    #[serde(default)]
    pub subscribe_cost: Option<u32>,

    // --- Scope ---------------------------------------------------------------

    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Account address for private channels.
    #[serde(default)]
    pub user: Option<String>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            rest_url: default_rest_url(),
            keepalive_ms: default_keepalive_ms(),
            pong_timeout_factor: default_pong_timeout_factor(),
            watch_timeout_ms: default_watch_timeout_ms(),
            trades_limit: default_cache_limit(),
            ohlcv_limit: default_cache_limit(),
            orders_limit: default_cache_limit(),
            rate_limit: RateLimitConfig::default(),
            subscribe_cost: None,
            symbols: default_symbols(),
            user: None,
        }
    }
}

/// Manual Debug so the account address never lands in logs verbatim.
impl std::fmt::Debug for StreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConfig")
            .field("ws_url", &self.ws_url)
            .field("rest_url", &self.rest_url)
            .field("keepalive_ms", &self.keepalive_ms)
            .field("pong_timeout_factor", &self.pong_timeout_factor)
            .field("watch_timeout_ms", &self.watch_timeout_ms)
            .field("trades_limit", &self.trades_limit)
            .field("ohlcv_limit", &self.ohlcv_limit)
            .field("orders_limit", &self.orders_limit)
            .field("rate_limit", &self.rate_limit)
            .field("subscribe_cost", &self.subscribe_cost)
            .field("symbols", &self.symbols)
            .field("user", &self.user.as_deref().map(redact))
            .finish()
    }
}

/// Keep the first six characters of an address.
pub(crate) fn redact(value: &str) -> String {
    let head: String = value.chars().take(6).collect();
    format!("{head}***")
}

impl StreamConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read stream config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse stream config from {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid stream config in {}", path.display()))?;

        info!(
            path = %path.display(),
            ws_url = %config.ws_url,
            symbols = ?config.symbols,
            "stream config loaded"
        );

        Ok(config)
    }

    /// Reject values the runtime cannot honour.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.keepalive_ms > 0, "keepalive_ms must be greater than zero");
        ensure!(self.watch_timeout_ms > 0, "watch_timeout_ms must be greater than zero");
        ensure!(
            self.rate_limit.capacity > 0.0 && self.rate_limit.refill_per_sec > 0.0,
            "rate_limit capacity and refill_per_sec must be positive"
        );
        Ok(())
    }

    /// Persist to `path` via a temporary sibling file and rename.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise stream config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "stream config saved (atomic)");
        Ok(())
    }

    /// Override fields from `AURORA_*` environment variables.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("AURORA_WS_URL") {
            self.ws_url = url;
        }
        if let Some(symbols) = lookup("AURORA_SYMBOLS") {
            self.symbols = symbols
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(user) = lookup("AURORA_USER") {
            self.user = Some(user).filter(|u| !u.is_empty());
        }
        if let Some(raw) = lookup("AURORA_KEEPALIVE_MS") {
            match raw.parse::<u64>() {
                Ok(ms) if ms > 0 => self.keepalive_ms = ms,
                _ => warn!(value = %raw, "ignoring invalid AURORA_KEEPALIVE_MS"),
            }
        }
    }

    // -------------------------------------------------------------------------
    // Derived values
    // -------------------------------------------------------------------------

    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        self.keepalive() * self.pong_timeout_factor.max(1)
    }

    pub fn watch_timeout(&self) -> Duration {
        Duration::from_millis(self.watch_timeout_ms)
    }

    pub fn cache_limits(&self) -> CacheLimits {
        CacheLimits {
            trades: self.trades_limit,
            ohlcv: self.ohlcv_limit,
            orders: self.orders_limit,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = StreamConfig::default();
        assert_eq!(cfg.keepalive(), Duration::from_secs(20));
        assert_eq!(cfg.pong_timeout(), Duration::from_secs(40));
        assert_eq!(cfg.cache_limits(), CacheLimits::default());
        assert!((cfg.rate_limit.capacity - 1200.0).abs() < f64::EPSILON);
        assert!(cfg.subscribe_cost.is_none());
        assert!(cfg.ws_url.starts_with("wss://"));
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let cfg: StreamConfig =
            serde_json::from_str(r#"{"keepalive_ms": 5000, "rate_limit": {"capacity": 10}}"#).unwrap();
        assert_eq!(cfg.keepalive_ms, 5000);
        assert_eq!(cfg.pong_timeout(), Duration::from_secs(10));
        assert!((cfg.rate_limit.capacity - 10.0).abs() < f64::EPSILON);
        assert!((cfg.rate_limit.refill_per_sec - 20.0).abs() < f64::EPSILON);
        assert_eq!(cfg.trades_limit, 1000);
    }

    #[test]
    fn save_then_load_is_atomic() {
        let dir = std::env::temp_dir().join(format!("aurora-stream-cfg-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("stream.json");

        let mut cfg = StreamConfig::default();
        cfg.symbols = vec!["SOL/USDC:USDC".into()];
        cfg.save(&path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = StreamConfig::load(&path).unwrap();
        assert_eq!(loaded.symbols, cfg.symbols);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn load_rejects_zero_keepalive() {
        let dir = std::env::temp_dir().join(format!("aurora-stream-zero-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("stream.json");
        std::fs::write(&path, r#"{"keepalive_ms": 0}"#).unwrap();

        let err = StreamConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("keepalive_ms"));
        std::fs::remove_dir_all(&dir).ok();

        assert!(StreamConfig::default().validate().is_ok());
    }

    #[test]
    fn load_missing_file_is_an_error() {
        assert!(StreamConfig::load("/nonexistent/aurora/stream.json").is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("AURORA_SYMBOLS", "BTC/USDC:USDC, SOL/USDC:USDC,"),
            ("AURORA_KEEPALIVE_MS", "nope"),
            ("AURORA_USER", "0xabcdef0123456789"),
        ]);
        let mut cfg = StreamConfig::default();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.symbols, vec!["BTC/USDC:USDC", "SOL/USDC:USDC"]);
        assert_eq!(cfg.keepalive_ms, 20_000);
        assert_eq!(cfg.user.as_deref(), Some("0xabcdef0123456789"));
        assert!(!format!("{cfg:?}").contains("0123456789"));
    }
}
