pub mod series;
pub mod store;

pub use series::{compress, eviction_order, filter_range, merge_candles, CacheEntry, EvictionCandidate};
pub use store::{MarketDataStore, Subscription};
