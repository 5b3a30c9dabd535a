// =============================================================================
// Market-data error taxonomy
// =============================================================================
//
//   Network    — fetch / connect failure. Streams retry with backoff; one-shot
//                history fetches surface it to the caller.
//   Parse      — malformed wire frame. Logged and dropped at the boundary.
//   Validation — bad symbol / interval / range. Returned before any I/O.
//   Capacity   — cache pressure. Resolved internally by eviction.
// =============================================================================

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MarketDataError>;

/// Errors produced by the feed, stream and store layers.
///
/// `Clone` so a single failure can be delivered to every `on_error` listener
/// of a series.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MarketDataError {
    #[error("network error: {0}")]
    Network(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("cache capacity exceeded: {total} candles over budget {budget}")]
    Capacity { total: usize, budget: usize },
}

impl MarketDataError {
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

impl From<reqwest::Error> for MarketDataError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for MarketDataError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Network(err.to_string())
    }
}

impl From<serde_json::Error> for MarketDataError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}
