// =============================================================================
// Shared types used across the Aurora chart engine
// =============================================================================

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MarketDataError, Result};

// =============================================================================
// Candle
// =============================================================================

/// A single OHLCV bar. `time` is the epoch-ms start of the half-open bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            time,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// `true` when all prices are finite, `low <= {open, close} <= high` and
    /// volume is non-negative.
    pub fn is_valid(&self) -> bool {
        let finite = [self.open, self.high, self.low, self.close, self.volume]
            .iter()
            .all(|v| v.is_finite());

        finite
            && self.volume >= 0.0
            && self.low <= self.open.min(self.close)
            && self.high >= self.open.max(self.close)
    }

    /// Bullish candles (close >= open) are drawn with the "up" colour.
    pub fn is_bullish(&self) -> bool {
        self.close >= self.open
    }
}

// =============================================================================
// Interval
// =============================================================================

/// Bucket width of a candle series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "1w")]
    W1,
}

impl Interval {
    pub const ALL: [Interval; 8] = [
        Self::M1,
        Self::M5,
        Self::M15,
        Self::M30,
        Self::H1,
        Self::H4,
        Self::D1,
        Self::W1,
    ];

    /// Bucket width in minutes.
    pub fn minutes(self) -> i64 {
        match self {
            Self::M1 => 1,
            Self::M5 => 5,
            Self::M15 => 15,
            Self::M30 => 30,
            Self::H1 => 60,
            Self::H4 => 240,
            Self::D1 => 1_440,
            Self::W1 => 10_080,
        }
    }

    pub fn duration_ms(self) -> i64 {
        self.minutes() * 60_000
    }

    /// Short code shared by most exchanges ("1m", "4h", "1d", ...).
    pub fn code(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
            Self::W1 => "1w",
        }
    }

    /// Reverse of [`Interval::minutes`].
    pub fn from_minutes(minutes: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|iv| iv.minutes() == minutes)
    }
}

impl Default for Interval {
    fn default() -> Self {
        Self::M1
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Interval {
    type Err = MarketDataError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        Self::ALL
            .into_iter()
            .find(|iv| iv.code() == trimmed)
            .ok_or_else(|| MarketDataError::Validation(format!("unsupported interval '{s}'")))
    }
}

// =============================================================================
// SeriesKey
// =============================================================================

/// Identity of one candle series: cache entry and subscription key.
#[derive(Debug, Clone, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub symbol: String,
    pub interval: Interval,
}

impl SeriesKey {
    /// Build a key, rejecting empty or malformed symbols.
    ///
    /// Symbols are upper-cased; letters, digits, `/`, `-` and `_` are allowed.
    pub fn new(symbol: &str, interval: Interval) -> Result<Self> {
        let symbol = symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return Err(MarketDataError::Validation("symbol must not be empty".into()));
        }
        if !symbol
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_'))
        {
            return Err(MarketDataError::Validation(format!(
                "symbol '{symbol}' contains unsupported characters"
            )));
        }
        Ok(Self { symbol, interval })
    }
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

// =============================================================================
// ConnectionState
// =============================================================================

/// Lifecycle of one upstream socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Retry budget exhausted; only a new subscribe re-arms the connection.
    Error,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Error => write!(f, "Error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candle_validity() {
        assert!(Candle::new(0, 10.0, 12.0, 9.0, 11.0, 5.0).is_valid());
        // close above high
        assert!(!Candle::new(0, 10.0, 12.0, 9.0, 13.0, 5.0).is_valid());
        // negative volume
        assert!(!Candle::new(0, 10.0, 12.0, 9.0, 11.0, -1.0).is_valid());
        assert!(!Candle::new(0, f64::NAN, 12.0, 9.0, 11.0, 1.0).is_valid());
    }

    #[test]
    fn interval_codes_roundtrip() {
        for iv in Interval::ALL {
            assert_eq!(iv.code().parse::<Interval>().unwrap(), iv);
            assert_eq!(Interval::from_minutes(iv.minutes()), Some(iv));
        }
        assert!("3m".parse::<Interval>().is_err());
        assert_eq!(Interval::H1.duration_ms(), 3_600_000);
    }

    #[test]
    fn series_key_normalises_and_validates() {
        let key = SeriesKey::new(" btcusdt ", Interval::M1).unwrap();
        assert_eq!(key.symbol, "BTCUSDT");
        assert_eq!(key.to_string(), "BTCUSDT@1m");

        assert!(matches!(
            SeriesKey::new("", Interval::M1),
            Err(MarketDataError::Validation(_))
        ));
        assert!(SeriesKey::new("BTC USDT", Interval::M1).is_err());
        assert!(SeriesKey::new("XBT/USD", Interval::H1).is_ok());
    }

    #[test]
    fn interval_serde_uses_codes() {
        let json = serde_json::to_string(&Interval::H4).unwrap();
        assert_eq!(json, "\"4h\"");
        let iv: Interval = serde_json::from_str("\"15m\"").unwrap();
        assert_eq!(iv, Interval::M15);
    }
}
