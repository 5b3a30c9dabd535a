// =============================================================================
// Aurora Chart — streaming market-data cache and candlestick chart engine
// =============================================================================

pub mod app_state;
pub mod error;
pub mod feed;
pub mod indicators;
pub mod market_data;
pub mod render;
pub mod runtime_config;
pub mod stream;
pub mod types;

pub use app_state::ChartApp;
pub use error::{MarketDataError, Result};
pub use runtime_config::ChartConfig;
pub use types::{Candle, ConnectionState, Interval, SeriesKey};
