// =============================================================================
// Feed Adapters — one variant per upstream exchange
// =============================================================================
//
// An adapter owns everything exchange-specific: symbol spelling, interval
// codes, REST request shape, control-frame and update-frame schemas. The
// stream connection and the store never branch on the exchange; they only
// talk to `dyn FeedAdapter`, chosen once from configuration.
// =============================================================================

pub mod binance;
pub mod kraken;
pub mod rest;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{MarketDataError, Result};
use crate::types::{Candle, Interval, SeriesKey};

pub use binance::BinanceAdapter;
pub use kraken::KrakenAdapter;
pub use rest::{HistoryFetcher, RestHistoryClient};

/// Upstream exchange selected at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedSource {
    Binance,
    Kraken,
}

impl Default for FeedSource {
    fn default() -> Self {
        Self::Binance
    }
}

impl std::fmt::Display for FeedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Binance => write!(f, "binance"),
            Self::Kraken => write!(f, "kraken"),
        }
    }
}

impl std::str::FromStr for FeedSource {
    type Err = MarketDataError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binance" => Ok(Self::Binance),
            "kraken" => Ok(Self::Kraken),
            other => Err(MarketDataError::Validation(format!("unknown feed source '{other}'"))),
        }
    }
}

/// Build the adapter for `source`.
pub fn adapter_for(source: FeedSource) -> Arc<dyn FeedAdapter> {
    match source {
        FeedSource::Binance => Arc::new(BinanceAdapter::new()),
        FeedSource::Kraken => Arc::new(KrakenAdapter::new()),
    }
}

/// A REST call described as data, executed by a [`HistoryFetcher`].
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub key: SeriesKey,
    /// Requested range in epoch ms, inclusive on both ends.
    pub start: i64,
    pub end: i64,
    pub limit: u32,
}

/// One parsed OHLC update from a live frame.
#[derive(Debug, Clone, PartialEq)]
pub struct KlineUpdate {
    /// Symbol as spelled by the upstream (see [`FeedAdapter::normalize_symbol`]).
    pub upstream_symbol: String,
    pub interval: Interval,
    pub candle: Candle,
    /// `true` once the bucket is final.
    pub closed: bool,
}

/// Capability set every exchange variant provides.
pub trait FeedAdapter: Send + Sync + std::fmt::Debug {
    fn source(&self) -> FeedSource;

    /// Websocket endpoint serving every subscription of this source.
    fn ws_url(&self) -> &str;

    /// Map an application symbol ("BTCUSDT") to the upstream spelling.
    fn normalize_symbol(&self, symbol: &str) -> String;

    /// Describe the REST call returning bars of `key` in `[start, end]`.
    fn history_request(&self, key: &SeriesKey, start: i64, end: i64) -> Result<HistoryRequest>;

    /// Decode a REST response body into time-ordered candles (ms timestamps).
    fn parse_history(&self, request: &HistoryRequest, body: &serde_json::Value) -> Result<Vec<Candle>>;

    /// Decode one live frame. `Ok(None)` means "not an OHLC update" (acks,
    /// heartbeats, status events).
    fn parse_tick(&self, raw: &str) -> Result<Option<KlineUpdate>>;

    /// Control frame subscribing `keys`. `request_id` is echoed by upstreams
    /// that acknowledge requests.
    fn subscribe_frame(&self, keys: &[SeriesKey], request_id: u64) -> Result<String>;

    fn unsubscribe_frame(&self, keys: &[SeriesKey], request_id: u64) -> Result<String>;
}

// ---------------------------------------------------------------------------
// Shared parsing helpers
// ---------------------------------------------------------------------------

/// Exchanges send prices either as JSON strings or numbers.
pub(crate) fn parse_num(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| MarketDataError::Parse(format!("failed to parse {name} as f64: {s}"))),
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| MarketDataError::Parse(format!("field {name} is not a valid f64"))),
        _ => Err(MarketDataError::Parse(format!("field {name} has unexpected JSON type"))),
    }
}

/// Candle from the JSON open/high/low/close/volume fields of one row.
pub(crate) fn candle_from_fields(time: i64, fields: [&serde_json::Value; 5]) -> Result<Candle> {
    let [open, high, low, close, volume] = fields;
    checked(Candle::new(
        time,
        parse_num(open, "open")?,
        parse_num(high, "high")?,
        parse_num(low, "low")?,
        parse_num(close, "close")?,
        parse_num(volume, "volume")?,
    ))
}

/// Reject candles that break the OHLC invariant.
pub(crate) fn checked(candle: Candle) -> Result<Candle> {
    if candle.is_valid() {
        Ok(candle)
    } else {
        Err(MarketDataError::Parse(format!(
            "candle at {} violates OHLCV invariants",
            candle.time
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_source_parses_case_insensitively() {
        assert_eq!("Binance".parse::<FeedSource>().unwrap(), FeedSource::Binance);
        assert_eq!("kraken".parse::<FeedSource>().unwrap(), FeedSource::Kraken);
        assert!("coinbase".parse::<FeedSource>().is_err());
    }

    #[test]
    fn adapter_for_matches_source() {
        assert_eq!(adapter_for(FeedSource::Binance).source(), FeedSource::Binance);
        assert_eq!(adapter_for(FeedSource::Kraken).source(), FeedSource::Kraken);
    }

    #[test]
    fn parse_num_accepts_strings_and_numbers() {
        assert_eq!(parse_num(&serde_json::json!("1.5"), "x").unwrap(), 1.5);
        assert_eq!(parse_num(&serde_json::json!(2), "x").unwrap(), 2.0);
        assert!(parse_num(&serde_json::json!(null), "x").is_err());
        assert!(parse_num(&serde_json::json!("abc"), "x").is_err());
    }
}
