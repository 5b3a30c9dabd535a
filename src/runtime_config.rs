// =============================================================================
// Runtime Configuration — chart engine settings with atomic save
// =============================================================================
//
// Every tunable of the feed, stream, cache and renderer lives here. All fields
// carry `#[serde(default)]` so adding a field never breaks loading an older
// config file. Persistence uses an atomic tmp + rename pattern.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::feed::FeedSource;
use crate::indicators::IndicatorKind;
use crate::types::Interval;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_history_bars() -> u32 {
    500
}

fn default_max_cache_size() -> usize {
    50_000
}

fn default_base_delay_ms() -> u64 {
    5_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_price_threshold() -> f64 {
    0.001
}

fn default_volume_threshold() -> f64 {
    0.10
}

fn default_width() -> f64 {
    1280.0
}

fn default_height() -> f64 {
    720.0
}

fn default_refetch_debounce_ms() -> u64 {
    300
}

fn default_volume_ratio() -> f64 {
    0.2
}

fn default_indicators() -> Vec<IndicatorKind> {
    vec![
        IndicatorKind::Sma { period: 20 },
        IndicatorKind::Ema { period: 50 },
        IndicatorKind::Bollinger { period: 20, std_dev_mult: 2.0 },
        IndicatorKind::Rsi { period: 14 },
        IndicatorKind::Macd { fast: 12, slow: 26, signal: 9 },
    ]
}

// =============================================================================
// ReconnectConfig
// =============================================================================

/// Stream reconnect policy: `delay = base * 2^attempt`, optionally capped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Attempts before the connection is pinned to `Error`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Upper bound on a single delay. `None` = uncapped.
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_attempts: default_max_attempts(),
            max_delay_ms: None,
        }
    }
}

// =============================================================================
// CompressionConfig
// =============================================================================

/// Relative thresholds for overview thinning (0.001 = 0.1 %).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default = "default_price_threshold")]
    pub price_threshold: f64,

    #[serde(default = "default_volume_threshold")]
    pub volume_threshold: f64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            price_threshold: default_price_threshold(),
            volume_threshold: default_volume_threshold(),
        }
    }
}

// =============================================================================
// ChartSettings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartSettings {
    #[serde(default = "default_width")]
    pub width: f64,

    #[serde(default = "default_height")]
    pub height: f64,

    /// Logarithmic price axis.
    #[serde(default)]
    pub log_scale: bool,

    /// Quiet period after the last pan/zoom before history is re-fetched.
    #[serde(default = "default_refetch_debounce_ms")]
    pub refetch_debounce_ms: u64,

    /// Share of the price pane used by the volume histogram.
    #[serde(default = "default_volume_ratio")]
    pub volume_ratio: f64,

    #[serde(default = "default_indicators")]
    pub indicators: Vec<IndicatorKind>,
}

impl ChartSettings {
    pub fn refetch_debounce(&self) -> Duration {
        Duration::from_millis(self.refetch_debounce_ms)
    }
}

impl Default for ChartSettings {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            log_scale: false,
            refetch_debounce_ms: default_refetch_debounce_ms(),
            volume_ratio: default_volume_ratio(),
            indicators: default_indicators(),
        }
    }
}

// =============================================================================
// ChartConfig
// =============================================================================

/// Top-level configuration for the chart engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartConfig {
    /// Upstream exchange. Chooses the feed adapter once at startup.
    #[serde(default)]
    pub feed_source: FeedSource,

    #[serde(default = "default_symbol")]
    pub symbol: String,

    #[serde(default)]
    pub interval: Interval,

    /// Bars requested by the initial history fetch.
    #[serde(default = "default_history_bars")]
    pub history_bars: u32,

    /// Total candles kept across all cache entries.
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: usize,

    /// Per-request limit for history fetches. `None` leaves it to the
    /// transport.
    #[serde(default)]
    pub history_timeout_ms: Option<u64>,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub compression: CompressionConfig,

    #[serde(default)]
    pub chart: ChartSettings,
}

impl Default for ChartConfig {
    fn default() -> Self {
        Self {
            feed_source: FeedSource::default(),
            symbol: default_symbol(),
            interval: Interval::default(),
            history_bars: default_history_bars(),
            max_cache_size: default_max_cache_size(),
            history_timeout_ms: None,
            reconnect: ReconnectConfig::default(),
            compression: CompressionConfig::default(),
            chart: ChartSettings::default(),
        }
    }
}

impl ChartConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read chart config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse chart config from {}", path.display()))?;

        info!(
            path = %path.display(),
            feed = %config.feed_source,
            symbol = %config.symbol,
            interval = %config.interval,
            "chart config loaded"
        );

        Ok(config)
    }

    /// Persist to `path` using an atomic write (write `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise chart config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "chart config saved (atomic)");
        Ok(())
    }

    /// Apply `AURORA_FEED`, `AURORA_SYMBOL` and `AURORA_INTERVAL` overrides.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(feed) = std::env::var("AURORA_FEED") {
            self.feed_source = feed.parse().context("invalid AURORA_FEED")?;
        }
        if let Ok(symbol) = std::env::var("AURORA_SYMBOL") {
            let symbol = symbol.trim().to_uppercase();
            if !symbol.is_empty() {
                self.symbol = symbol;
            }
        }
        if let Ok(interval) = std::env::var("AURORA_INTERVAL") {
            self.interval = interval.parse().context("invalid AURORA_INTERVAL")?;
        }
        Ok(())
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
        let cfg = ChartConfig::default();
        assert_eq!(cfg.feed_source, FeedSource::Binance);
        assert_eq!(cfg.symbol, "BTCUSDT");
        assert_eq!(cfg.interval, Interval::M1);
        assert_eq!(cfg.reconnect.base_delay_ms, 5_000);
        assert_eq!(cfg.reconnect.max_attempts, 5);
        assert_eq!(cfg.reconnect.max_delay_ms, None);
        assert_eq!(cfg.history_timeout_ms, None);
        assert!((cfg.compression.price_threshold - 0.001).abs() < f64::EPSILON);
        assert!((cfg.compression.volume_threshold - 0.10).abs() < f64::EPSILON);
        assert_eq!(cfg.chart.indicators.len(), 5);
        assert!(!cfg.chart.log_scale);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: ChartConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, ChartConfig::default());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "feed_source": "kraken", "interval": "4h", "reconnect": { "max_attempts": 2 } }"#;
        let cfg: ChartConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.feed_source, FeedSource::Kraken);
        assert_eq!(cfg.interval, Interval::H4);
        assert_eq!(cfg.reconnect.max_attempts, 2);
        assert_eq!(cfg.reconnect.base_delay_ms, 5_000);
        assert_eq!(cfg.symbol, "BTCUSDT");
    }

    #[test]
    fn history_timeout_is_opt_in() {
        let cfg: ChartConfig = serde_json::from_str(r#"{ "history_timeout_ms": 2500 }"#).unwrap();
        assert_eq!(cfg.history_timeout_ms, Some(2_500));
        let cfg: ChartConfig = serde_json::from_str(r#"{ "symbol": "ETHUSDT" }"#).unwrap();
        assert_eq!(cfg.history_timeout_ms, None);
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = std::env::temp_dir().join(format!("aurora-chart-cfg-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("chart_config.json");

        let mut cfg = ChartConfig::default();
        cfg.symbol = "ETHUSDT".into();
        cfg.chart.log_scale = true;
        cfg.save(&path).unwrap();

        let loaded = ChartConfig::load(&path).unwrap();
        assert_eq!(loaded, cfg);
        assert!(!path.with_extension("json.tmp").exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn load_missing_file_is_error() {
        assert!(ChartConfig::load("/definitely/not/here.json").is_err());
    }
}
