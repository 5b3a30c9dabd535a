// =============================================================================
// Binance Spot adapter — kline REST + combined kline stream
// =============================================================================
//
// Binance sends numeric kline fields as JSON strings and timestamps in ms.
// Control frames are JSON-RPC style:
//   {"method":"SUBSCRIBE","params":["btcusdt@kline_1m"],"id":1}
// and acknowledged with {"result":null,"id":1}.
// =============================================================================

use serde_json::json;
use tracing::warn;

use super::{candle_from_fields, checked, parse_num, FeedAdapter, FeedSource, HistoryRequest, KlineUpdate};
use crate::error::{MarketDataError, Result};
use crate::types::{Candle, Interval, SeriesKey};

const REST_BASE: &str = "https://api.binance.com";
const WS_URL: &str = "wss://stream.binance.com:9443/stream";
/// Hard cap Binance applies to `/api/v3/klines`.
const MAX_KLINES_PER_REQUEST: u32 = 1000;

#[derive(Debug, Clone)]
pub struct BinanceAdapter {
    rest_base: String,
    ws_url: String,
}

impl BinanceAdapter {
    pub fn new() -> Self {
        Self {
            rest_base: REST_BASE.to_string(),
            ws_url: WS_URL.to_string(),
        }
    }

    /// Point the adapter at a different host (testnet, local mock).
    pub fn with_endpoints(rest_base: impl Into<String>, ws_url: impl Into<String>) -> Self {
        Self {
            rest_base: rest_base.into(),
            ws_url: ws_url.into(),
        }
    }

    fn stream_name(&self, key: &SeriesKey) -> String {
        format!(
            "{}@kline_{}",
            self.normalize_symbol(&key.symbol).to_lowercase(),
            key.interval.code()
        )
    }

    fn control_frame(&self, method: &str, keys: &[SeriesKey], request_id: u64) -> Result<String> {
        let params: Vec<String> = keys.iter().map(|k| self.stream_name(k)).collect();
        let frame = json!({ "method": method, "params": params, "id": request_id });
        Ok(serde_json::to_string(&frame)?)
    }
}

impl Default for BinanceAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedAdapter for BinanceAdapter {
    fn source(&self) -> FeedSource {
        FeedSource::Binance
    }

    fn ws_url(&self) -> &str {
        &self.ws_url
    }

    fn normalize_symbol(&self, symbol: &str) -> String {
        symbol
            .trim()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_uppercase()
    }

    fn history_request(&self, key: &SeriesKey, start: i64, end: i64) -> Result<HistoryRequest> {
        if start > end {
            return Err(MarketDataError::Validation(format!(
                "history range start {start} is after end {end}"
            )));
        }

        let bars = ((end - start) / key.interval.duration_ms() + 1).max(1);
        let limit = bars.min(MAX_KLINES_PER_REQUEST as i64) as u32;

        Ok(HistoryRequest {
            url: format!("{}/api/v3/klines", self.rest_base),
            query: vec![
                ("symbol".into(), self.normalize_symbol(&key.symbol)),
                ("interval".into(), key.interval.code().into()),
                ("startTime".into(), start.to_string()),
                ("endTime".into(), end.to_string()),
                ("limit".into(), limit.to_string()),
            ],
            key: key.clone(),
            start,
            end,
            limit,
        })
    }

    /// Array indices:
    ///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
    ///   [6] closeTime, ... (quote volume, trade count, taker volumes)
    fn parse_history(&self, request: &HistoryRequest, body: &serde_json::Value) -> Result<Vec<Candle>> {
        let raw = body
            .as_array()
            .ok_or_else(|| MarketDataError::Parse("klines response is not an array".into()))?;

        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let Some(arr) = entry.as_array() else {
                warn!(key = %request.key, "skipping kline entry that is not an array");
                continue;
            };
            if arr.len() < 6 {
                warn!(key = %request.key, "skipping malformed kline entry with {} elements", arr.len());
                continue;
            }

            let Some(open_time) = arr[0].as_i64() else {
                warn!(key = %request.key, "skipping kline entry without open time");
                continue;
            };

            match candle_from_fields(open_time, [&arr[1], &arr[2], &arr[3], &arr[4], &arr[5]]) {
                Ok(c) => candles.push(c),
                Err(e) => warn!(key = %request.key, time = open_time, error = %e, "dropping invalid historical kline"),
            }
        }

        candles.sort_by_key(|c| c.time);
        Ok(candles)
    }

    /// Accepts both the combined-stream envelope and a bare kline payload:
    /// ```json
    /// { "stream": "btcusdt@kline_1m", "data": { "e": "kline", "s": "BTCUSDT", "k": { ... } } }
    /// ```
    fn parse_tick(&self, raw: &str) -> Result<Option<KlineUpdate>> {
        let root: serde_json::Value = serde_json::from_str(raw)?;

        // Subscription acknowledgements: {"result":null,"id":1}
        if root.get("id").is_some() && (root.get("result").is_some() || root.get("error").is_some()) {
            if let Some(err) = root.get("error") {
                warn!(error = %err, "binance rejected a control frame");
            }
            return Ok(None);
        }

        let data = if root.get("data").is_some() {
            &root["data"]
        } else {
            &root
        };

        if data["e"].as_str() != Some("kline") {
            return Ok(None);
        }

        let upstream_symbol = data["s"]
            .as_str()
            .ok_or_else(|| MarketDataError::Parse("missing field s".into()))?
            .to_uppercase();

        let k = &data["k"];
        let interval = k["i"]
            .as_str()
            .ok_or_else(|| MarketDataError::Parse("missing field k.i".into()))?
            .parse::<Interval>()
            .map_err(|e| MarketDataError::Parse(e.to_string()))?;

        let open_time = k["t"]
            .as_i64()
            .ok_or_else(|| MarketDataError::Parse("missing field k.t".into()))?;

        let candle = checked(Candle::new(
            open_time,
            parse_num(&k["o"], "k.o")?,
            parse_num(&k["h"], "k.h")?,
            parse_num(&k["l"], "k.l")?,
            parse_num(&k["c"], "k.c")?,
            parse_num(&k["v"], "k.v")?,
        ))?;

        let closed = k["x"]
            .as_bool()
            .ok_or_else(|| MarketDataError::Parse("missing field k.x".into()))?;

        Ok(Some(KlineUpdate {
            upstream_symbol,
            interval,
            candle,
            closed,
        }))
    }

    fn subscribe_frame(&self, keys: &[SeriesKey], request_id: u64) -> Result<String> {
        self.control_frame("SUBSCRIBE", keys, request_id)
    }

    fn unsubscribe_frame(&self, keys: &[SeriesKey], request_id: u64) -> Result<String> {
        self.control_frame("UNSUBSCRIBE", keys, request_id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn key(sym: &str, iv: Interval) -> SeriesKey {
        SeriesKey::new(sym, iv).unwrap()
    }

    const KLINE_FRAME: &str = r#"{
        "stream": "btcusdt@kline_1m",
        "data": {
            "e": "kline",
            "s": "BTCUSDT",
            "k": {
                "t": 1700000000000,
                "T": 1700000059999,
                "i": "1m",
                "o": "37000.00",
                "h": "37050.00",
                "l": "36990.00",
                "c": "37020.00",
                "v": "123.456",
                "n": 1500,
                "x": false
            }
        }
    }"#;

    #[test]
    fn parse_combined_kline_frame() {
        let update = BinanceAdapter::new()
            .parse_tick(KLINE_FRAME)
            .expect("should parse")
            .expect("should be a kline");
        assert_eq!(update.upstream_symbol, "BTCUSDT");
        assert_eq!(update.interval, Interval::M1);
        assert_eq!(update.candle.time, 1_700_000_000_000);
        assert!((update.candle.close - 37020.0).abs() < f64::EPSILON);
        assert!(!update.closed);
    }

    #[test]
    fn ack_and_foreign_events_are_not_ticks() {
        let adapter = BinanceAdapter::new();
        assert_eq!(adapter.parse_tick(r#"{"result":null,"id":7}"#).unwrap(), None);
        assert_eq!(
            adapter
                .parse_tick(r#"{"stream":"btcusdt@trade","data":{"e":"trade","p":"1"}}"#)
                .unwrap(),
            None
        );
    }

    #[test]
    fn malformed_frames_are_parse_errors() {
        let adapter = BinanceAdapter::new();
        assert!(matches!(adapter.parse_tick("{not json"), Err(MarketDataError::Parse(_))));

        let missing_close = KLINE_FRAME.replace(r#""c": "37020.00","#, "");
        assert!(adapter.parse_tick(&missing_close).is_err());

        // high below close
        let inverted = KLINE_FRAME.replace("37050.00", "36000.00");
        assert!(adapter.parse_tick(&inverted).is_err());
    }

    #[test]
    fn control_frames_list_stream_names() {
        let adapter = BinanceAdapter::new();
        let frame = adapter
            .subscribe_frame(&[key("BTCUSDT", Interval::M1), key("ethusdt", Interval::H1)], 3)
            .unwrap();
        let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["method"], "SUBSCRIBE");
        assert_eq!(v["params"][0], "btcusdt@kline_1m");
        assert_eq!(v["params"][1], "ethusdt@kline_1h");
        assert_eq!(v["id"], 3);

        let frame = adapter.unsubscribe_frame(&[key("BTCUSDT", Interval::M1)], 4).unwrap();
        assert!(frame.contains("UNSUBSCRIBE"));
    }

    #[test]
    fn history_request_caps_limit() {
        let adapter = BinanceAdapter::new();
        let req = adapter
            .history_request(&key("BTCUSDT", Interval::M1), 0, 10_000 * 60_000)
            .unwrap();
        assert_eq!(req.limit, 1000);
        assert!(req.url.ends_with("/api/v3/klines"));
        assert!(req.query.contains(&("interval".to_string(), "1m".to_string())));

        assert!(adapter.history_request(&key("BTCUSDT", Interval::M1), 10, 0).is_err());
    }

    #[test]
    fn parse_history_rows() {
        let adapter = BinanceAdapter::new();
        let req = adapter.history_request(&key("BTCUSDT", Interval::M1), 0, 120_000).unwrap();
        let body = serde_json::json!([
            [60000, "2.0", "3.0", "1.5", "2.5", "10.0", 119999, "0", 1, "0", "0", "0"],
            [0, "1.0", "2.0", "0.5", "1.5", "5.0", 59999, "0", 1, "0", "0", "0"],
            ["bad"],
        ]);
        let candles = adapter.parse_history(&req, &body).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].time, 0);
        assert_eq!(candles[1].time, 60_000);
    }

    #[test]
    fn unparseable_numbers_drop_only_their_row() {
        let adapter = BinanceAdapter::new();
        let req = adapter.history_request(&key("BTCUSDT", Interval::M1), 0, 180_000).unwrap();
        let body = serde_json::json!([
            [0, "1.0", "2.0", "0.5", "1.5", "5.0", 59999, "0", 1, "0", "0", "0"],
            [60000, "abc", "3.0", "1.5", "2.5", "10.0", 119999, "0", 1, "0", "0", "0"],
            [120000, "2.0", "3.0", "1.5", "2.5", null, 179999, "0", 1, "0", "0", "0"],
            [180000, "2.5", "3.0", "2.0", "2.8", "7.0", 239999, "0", 1, "0", "0", "0"],
        ]);
        let candles = adapter.parse_history(&req, &body).unwrap();
        assert_eq!(candles.iter().map(|c| c.time).collect::<Vec<_>>(), vec![0, 180_000]);
    }
}
