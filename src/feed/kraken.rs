// =============================================================================
// Kraken adapter — public OHLC REST + websocket v1 `ohlc` channel
// =============================================================================
//
// Kraken differs from Binance in every wire detail:
//   - pairs are spelled "XBT/USDT" on the socket and "XBTUSDT" over REST,
//   - intervals are integers in minutes,
//   - timestamps are seconds (REST: integer, socket: decimal strings),
//   - updates are positional arrays:
//       [chanId, [time, etime, open, high, low, close, vwap, volume, count], "ohlc-1", "XBT/USDT"]
//     where `etime` is the end of the bucket.
// =============================================================================

use serde_json::json;
use tracing::{debug, warn};

use super::{candle_from_fields, checked, parse_num, FeedAdapter, FeedSource, HistoryRequest, KlineUpdate};
use crate::error::{MarketDataError, Result};
use crate::types::{Candle, Interval, SeriesKey};

const REST_BASE: &str = "https://api.kraken.com";
const WS_URL: &str = "wss://ws.kraken.com";
/// Kraken returns at most 720 bars per OHLC call.
const MAX_BARS_PER_REQUEST: u32 = 720;

/// Quote currencies recognised when splitting an unslashed symbol. Longer
/// codes first so "USDT" wins over "USD".
const QUOTES: &[&str] = &["USDT", "USDC", "USD", "EUR", "GBP", "CAD", "JPY", "CHF", "AUD", "BTC", "ETH"];

#[derive(Debug, Clone)]
pub struct KrakenAdapter {
    rest_base: String,
    ws_url: String,
}

impl KrakenAdapter {
    pub fn new() -> Self {
        Self {
            rest_base: REST_BASE.to_string(),
            ws_url: WS_URL.to_string(),
        }
    }

    pub fn with_endpoints(rest_base: impl Into<String>, ws_url: impl Into<String>) -> Self {
        Self {
            rest_base: rest_base.into(),
            ws_url: ws_url.into(),
        }
    }

    fn asset_code(asset: &str) -> &str {
        match asset {
            "BTC" => "XBT",
            "DOGE" => "XDG",
            other => other,
        }
    }

    fn split_pair(symbol: &str) -> (String, String) {
        let upper = symbol.trim().to_uppercase();
        if let Some((base, quote)) = upper.split_once('/') {
            return (base.to_string(), quote.to_string());
        }
        for quote in QUOTES {
            if upper.len() > quote.len() && upper.ends_with(quote) {
                let base = &upper[..upper.len() - quote.len()];
                return (base.to_string(), (*quote).to_string());
            }
        }
        (upper, String::new())
    }

    /// REST pair spelling: "XBTUSDT".
    fn rest_pair(&self, symbol: &str) -> String {
        self.normalize_symbol(symbol).replace('/', "")
    }

    fn control_frame(&self, event: &str, keys: &[SeriesKey], request_id: u64) -> Result<String> {
        // Kraken scopes a subscription to one interval, so all keys of a frame
        // must share it. Callers batch per interval.
        let Some(first) = keys.first() else {
            return Err(MarketDataError::Validation("control frame needs at least one key".into()));
        };
        if keys.iter().any(|k| k.interval != first.interval) {
            return Err(MarketDataError::Validation(
                "kraken control frames cannot mix intervals".into(),
            ));
        }

        let pairs: Vec<String> = keys.iter().map(|k| self.normalize_symbol(&k.symbol)).collect();
        let frame = json!({
            "event": event,
            "reqid": request_id,
            "pair": pairs,
            "subscription": { "name": "ohlc", "interval": first.interval.minutes() },
        });
        Ok(serde_json::to_string(&frame)?)
    }
}

impl Default for KrakenAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedAdapter for KrakenAdapter {
    fn source(&self) -> FeedSource {
        FeedSource::Kraken
    }

    fn ws_url(&self) -> &str {
        &self.ws_url
    }

    fn normalize_symbol(&self, symbol: &str) -> String {
        let (base, quote) = Self::split_pair(symbol);
        if quote.is_empty() {
            return Self::asset_code(&base).to_string();
        }
        format!("{}/{}", Self::asset_code(&base), Self::asset_code(&quote))
    }

    fn history_request(&self, key: &SeriesKey, start: i64, end: i64) -> Result<HistoryRequest> {
        if start > end {
            return Err(MarketDataError::Validation(format!(
                "history range start {start} is after end {end}"
            )));
        }

        // `since` is exclusive on Kraken's side.
        let since_secs = (start / 1000 - 1).max(0);
        let bars = ((end - start) / key.interval.duration_ms() + 1).max(1);

        Ok(HistoryRequest {
            url: format!("{}/0/public/OHLC", self.rest_base),
            query: vec![
                ("pair".into(), self.rest_pair(&key.symbol)),
                ("interval".into(), key.interval.minutes().to_string()),
                ("since".into(), since_secs.to_string()),
            ],
            key: key.clone(),
            start,
            end,
            limit: bars.min(MAX_BARS_PER_REQUEST as i64) as u32,
        })
    }

    /// ```json
    /// { "error": [], "result": { "XXBTZUSD": [[1688671200, "o", "h", "l", "c", "vwap", "vol", 23], ...], "last": 1688672160 } }
    /// ```
    /// Kraken ignores an end bound, so rows past `request.end` are dropped here.
    fn parse_history(&self, request: &HistoryRequest, body: &serde_json::Value) -> Result<Vec<Candle>> {
        if let Some(errors) = body["error"].as_array() {
            if !errors.is_empty() {
                return Err(MarketDataError::Network(format!("kraken OHLC error: {errors:?}")));
            }
        }

        let result = body["result"]
            .as_object()
            .ok_or_else(|| MarketDataError::Parse("OHLC response missing result object".into()))?;

        // The result is keyed by Kraken's internal pair name ("XXBTZUSD"),
        // next to a scalar "last" cursor.
        let rows = result
            .iter()
            .find(|(name, v)| name.as_str() != "last" && v.is_array())
            .and_then(|(_, v)| v.as_array())
            .ok_or_else(|| MarketDataError::Parse("OHLC response has no row array".into()))?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(arr) = row.as_array().filter(|a| a.len() >= 7) else {
                warn!(key = %request.key, "skipping malformed OHLC row");
                continue;
            };

            let Some(time_secs) = arr[0].as_i64() else {
                warn!(key = %request.key, "skipping OHLC row without integer time");
                continue;
            };
            let time = time_secs * 1000;
            if time < request.start || time > request.end {
                continue;
            }

            // [5] is vwap
            match candle_from_fields(time, [&arr[1], &arr[2], &arr[3], &arr[4], &arr[6]]) {
                Ok(c) => candles.push(c),
                Err(e) => warn!(key = %request.key, time, error = %e, "dropping invalid OHLC row"),
            }
        }

        candles.sort_by_key(|c| c.time);
        Ok(candles)
    }

    fn parse_tick(&self, raw: &str) -> Result<Option<KlineUpdate>> {
        let root: serde_json::Value = serde_json::from_str(raw)?;

        // Object frames are events: heartbeat, systemStatus, subscriptionStatus.
        if let Some(event) = root.get("event").and_then(|e| e.as_str()) {
            if event == "subscriptionStatus" && root["status"].as_str() == Some("error") {
                warn!(message = %root["errorMessage"], "kraken rejected a subscription");
            } else if event != "heartbeat" {
                debug!(event, "kraken event frame");
            }
            return Ok(None);
        }

        let Some(arr) = root.as_array() else {
            return Err(MarketDataError::Parse("unexpected kraken frame shape".into()));
        };
        if arr.len() < 4 {
            return Err(MarketDataError::Parse(format!("kraken array frame has {} elements", arr.len())));
        }

        let channel = arr[arr.len() - 2]
            .as_str()
            .ok_or_else(|| MarketDataError::Parse("missing channel name".into()))?;
        let Some(minutes) = channel.strip_prefix("ohlc-") else {
            return Ok(None);
        };
        let interval = minutes
            .parse::<i64>()
            .ok()
            .and_then(Interval::from_minutes)
            .ok_or_else(|| MarketDataError::Parse(format!("unsupported ohlc channel {channel}")))?;

        let upstream_symbol = arr[arr.len() - 1]
            .as_str()
            .ok_or_else(|| MarketDataError::Parse("missing pair name".into()))?
            .to_uppercase();

        let fields = arr[1]
            .as_array()
            .filter(|f| f.len() >= 8)
            .ok_or_else(|| MarketDataError::Parse("ohlc payload is not a 9-field array".into()))?;

        let tick_secs = parse_num(&fields[0], "time")?;
        let end_secs = parse_num(&fields[1], "etime")?;
        let end_ms = (end_secs * 1000.0).round() as i64;
        let start_ms = end_ms - interval.duration_ms();

        let candle = checked(Candle::new(
            start_ms,
            parse_num(&fields[2], "open")?,
            parse_num(&fields[3], "high")?,
            parse_num(&fields[4], "low")?,
            parse_num(&fields[5], "close")?,
            // [6] is vwap
            parse_num(&fields[7], "volume")?,
        ))?;

        Ok(Some(KlineUpdate {
            upstream_symbol,
            interval,
            candle,
            closed: tick_secs >= end_secs,
        }))
    }

    fn subscribe_frame(&self, keys: &[SeriesKey], request_id: u64) -> Result<String> {
        self.control_frame("subscribe", keys, request_id)
    }

    fn unsubscribe_frame(&self, keys: &[SeriesKey], request_id: u64) -> Result<String> {
        self.control_frame("unsubscribe", keys, request_id)
    }
}
