// =============================================================================
// Historical bar fetcher — executes adapter-built REST requests
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::{FeedAdapter, HistoryRequest};
use crate::error::{MarketDataError, Result};
use crate::types::Candle;

/// Anything able to turn a [`HistoryRequest`] into ordered candles. The store
/// depends on this trait so tests can substitute an in-memory source.
#[async_trait]
pub trait HistoryFetcher: Send + Sync {
    async fn fetch(&self, request: &HistoryRequest) -> Result<Vec<Candle>>;
}

/// `reqwest`-backed fetcher. Parsing is delegated to the adapter that built
/// the request.
#[derive(Clone)]
pub struct RestHistoryClient {
    adapter: Arc<dyn FeedAdapter>,
    client: reqwest::Client,
}

impl RestHistoryClient {
    /// `timeout` bounds each request; `None` keeps the transport default.
    pub fn new(adapter: Arc<dyn FeedAdapter>, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build()?;

        debug!(source = %adapter.source(), timeout = ?timeout, "RestHistoryClient initialised");
        Ok(Self { adapter, client })
    }
}

#[async_trait]
impl HistoryFetcher for RestHistoryClient {
    #[instrument(skip(self, request), fields(key = %request.key, start = request.start, end = request.end), name = "rest::fetch_history")]
    async fn fetch(&self, request: &HistoryRequest) -> Result<Vec<Candle>> {
        let resp = self
            .client
            .get(&request.url)
            .query(&request.query)
            .send()
            .await?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| MarketDataError::Network(format!("failed to read history response: {e}")))?;

        if !status.is_success() {
            return Err(MarketDataError::Network(format!(
                "GET {} returned {}: {}",
                request.url, status, body
            )));
        }

        let candles = self.adapter.parse_history(request, &body)?;
        debug!(count = candles.len(), "history fetched");
        Ok(candles)
    }
}

impl std::fmt::Debug for RestHistoryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestHistoryClient")
            .field("source", &self.adapter.source())
            .finish()
    }
}
