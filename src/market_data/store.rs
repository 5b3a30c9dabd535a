// =============================================================================
// Market Data Store — authoritative per-(symbol, interval) candle cache
// =============================================================================
//
// Responsibilities:
//   - Serve history from cache when the requested range is covered, else
//     fetch through the feed adapter and merge.
//   - Merge live candles (last writer wins) and fan them out to listeners.
//   - Reference-count listeners per key to close upstream subscriptions.
//   - Record only the coverage a response proves: truncated pages are
//     followed up, and a live candle past a hole leaves the hole uncovered
//     until it is backfilled.
//   - Keep the total candle count under `max_cache_size` by evicting whole
//     entries, oldest range end first, never touching subscribed entries.
//
// Concurrency: one parking_lot RwLock guards entries + listeners. The lock is
// never held across an `.await` or while a listener callback runs, so a
// callback may freely call back into the store.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::series::{compress, eviction_order, merge_candles, CacheEntry, EvictionCandidate};
use crate::error::{MarketDataError, Result};
use crate::feed::{FeedAdapter, HistoryFetcher};
use crate::runtime_config::CompressionConfig;
use crate::stream::StreamControl;
use crate::types::{Candle, Interval, SeriesKey};

/// Upper bound on follow-up requests for one truncated history fetch.
const MAX_HISTORY_PAGES: usize = 64;

pub type UpdateCallback = Arc<dyn Fn(&Candle) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&MarketDataError) + Send + Sync>;

struct Listener {
    id: u64,
    active: Arc<AtomicBool>,
    on_update: UpdateCallback,
    on_error: ErrorCallback,
}

#[derive(Default)]
struct StoreInner {
    entries: HashMap<SeriesKey, CacheEntry>,
    listeners: HashMap<SeriesKey, Vec<Listener>>,
    /// Keys with a live-data hole whose backfill has been handed out.
    backfilling: HashSet<SeriesKey>,
}

impl StoreInner {
    fn total_candles(&self) -> usize {
        self.entries.values().map(CacheEntry::len).sum()
    }

    /// Drop entries until the budget holds. `merging` is pinned alongside
    /// every key that still has listeners.
    fn evict(&mut self, merging: &SeriesKey, budget: usize) {
        let candidates: Vec<EvictionCandidate> = self
            .entries
            .values()
            .map(|e| EvictionCandidate {
                key: e.key.clone(),
                len: e.len(),
                range_end: e.range_end,
                pinned: &e.key == merging
                    || self.listeners.get(&e.key).is_some_and(|l| !l.is_empty()),
            })
            .collect();

        for key in eviction_order(&candidates, budget) {
            if let Some(entry) = self.entries.remove(&key) {
                info!(key = %key, candles = entry.len(), range_end = entry.range_end, "cache entry evicted");
            }
        }

        let total = self.total_candles();
        if total > budget {
            let pressure = MarketDataError::Capacity { total, budget };
            warn!(error = %pressure, "cache over budget; remaining entries are pinned");
        }
    }

    fn callbacks_for(&self, key: &SeriesKey) -> Vec<(Arc<AtomicBool>, UpdateCallback)> {
        self.listeners
            .get(key)
            .map(|ls| {
                ls.iter()
                    .map(|l| (Arc::clone(&l.active), Arc::clone(&l.on_update)))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Constructor-injected cache service. Share it as `Arc<MarketDataStore>`.
pub struct MarketDataStore {
    adapter: Arc<dyn FeedAdapter>,
    fetcher: Arc<dyn HistoryFetcher>,
    stream: Option<Arc<dyn StreamControl>>,
    inner: RwLock<StoreInner>,
    max_cache_size: usize,
    compression: CompressionConfig,
    /// Bumped on every merge.
    version: AtomicU64,
    next_listener_id: AtomicU64,
}

impl MarketDataStore {
    pub fn new(
        adapter: Arc<dyn FeedAdapter>,
        fetcher: Arc<dyn HistoryFetcher>,
        stream: Option<Arc<dyn StreamControl>>,
        max_cache_size: usize,
        compression: CompressionConfig,
    ) -> Arc<Self> {
        info!(
            source = %adapter.source(),
            max_cache_size,
            live = stream.is_some(),
            "MarketDataStore initialised"
        );
        Arc::new(Self {
            adapter,
            fetcher,
            stream,
            inner: RwLock::new(StoreInner::default()),
            max_cache_size,
            compression,
            version: AtomicU64::new(0),
            next_listener_id: AtomicU64::new(1),
        })
    }

    // -------------------------------------------------------------------------
    // History
    // -------------------------------------------------------------------------

    /// Candles of `symbol`/`interval` with `start <= time <= end`.
    ///
    /// Served from cache without network access when the entry already covers
    /// the range. Network failures are returned to the caller unchanged.
    ///
    /// A page that fills the adapter's row limit only proves coverage up to
    /// its last candle; the rest of the range is requested again from there.
    pub async fn fetch_history(
        &self,
        symbol: &str,
        interval: Interval,
        start: i64,
        end: i64,
    ) -> Result<CacheEntry> {
        let key = SeriesKey::new(symbol, interval)?;
        if start > end {
            return Err(MarketDataError::Validation(format!(
                "history range start {start} is after end {end}"
            )));
        }

        if let Some(view) = self.cached_view(&key, start, end) {
            debug!(key = %key, start, end, candles = view.len(), "history served from cache");
            return Ok(view);
        }

        let bar = interval.duration_ms();
        let mut cursor = start;
        let mut covered_end = start;
        let mut candles = Vec::new();

        for page in 0..MAX_HISTORY_PAGES {
            let request = self.adapter.history_request(&key, cursor, end)?;
            let fetched = self.fetcher.fetch(&request).await?;
            let truncated = fetched.len() >= request.limit as usize;

            covered_end = match fetched.last() {
                Some(last) if truncated && last.time >= cursor && last.time.saturating_add(bar) <= end => {
                    last.time
                }
                _ => end,
            };
            debug!(
                key = %key,
                page,
                start = cursor,
                end = covered_end,
                fetched = fetched.len(),
                truncated,
                "history page fetched"
            );

            let view = self.merge_history(&key, &fetched, cursor, covered_end);
            candles.extend(view.candles);

            if covered_end >= end {
                break;
            }
            cursor = covered_end.saturating_add(bar);
        }

        if covered_end < end {
            warn!(key = %key, start, end, covered_end, "history paging stopped short of the requested end");
        }
        Ok(CacheEntry::new(key, candles, start, covered_end))
    }

    /// Fetch the span a live candle jumped over (see [`Self::apply_live`]).
    /// The key may report a new hole once this returns, whatever the outcome.
    pub async fn backfill_gap(&self, key: &SeriesKey, from: i64, to: i64) -> Result<CacheEntry> {
        info!(key = %key, from, to, "backfilling live data gap");
        let result = self.fetch_history(&key.symbol, key.interval, from, to).await;
        self.inner.write().backfilling.remove(key);
        result
    }

    fn cached_view(&self, key: &SeriesKey, start: i64, end: i64) -> Option<CacheEntry> {
        let inner = self.inner.read();
        inner
            .entries
            .get(key)
            .filter(|e| e.covers(start, end))
            .map(|e| e.view(start, end))
    }

    fn merge_history(&self, key: &SeriesKey, candles: &[Candle], start: i64, end: i64) -> CacheEntry {
        let mut inner = self.inner.write();

        let entry = inner
            .entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(key.clone(), Vec::new(), start, end));

        entry.candles = merge_candles(&entry.candles, candles);
        let bar = key.interval.duration_ms();
        if start <= entry.range_end.saturating_add(bar) && end.saturating_add(bar) >= entry.range_start {
            entry.range_start = entry.range_start.min(start);
            entry.range_end = entry.range_end.max(end);
        } else {
            // Disjoint fetch: only the new span is known to be complete.
            debug!(key = %key, start, end, "history range disjoint from cached coverage");
            entry.range_start = start;
            entry.range_end = end;
        }
        let view = entry.view(start, end);

        self.version.fetch_add(1, Ordering::SeqCst);
        inner.evict(key, self.max_cache_size);
        view
    }

    // -------------------------------------------------------------------------
    // Live updates
    // -------------------------------------------------------------------------

    /// Register a live listener. The most recent cached candle, if any, is
    /// replayed to `on_update` before this returns.
    ///
    /// Every subscribe is forwarded upstream, so a stream that gave up on its
    /// retries re-arms; the stream ignores keys it already carries.
    #[must_use = "dropping the Subscription unsubscribes immediately"]
    pub fn subscribe<U, E>(self: &Arc<Self>, key: SeriesKey, on_update: U, on_error: E) -> Subscription
    where
        U: Fn(&Candle) + Send + Sync + 'static,
        E: Fn(&MarketDataError) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let active = Arc::new(AtomicBool::new(true));
        let on_update: UpdateCallback = Arc::new(on_update);

        let (count, latest) = {
            let mut inner = self.inner.write();
            let latest = inner.entries.get(&key).and_then(|e| e.last().copied());
            let listeners = inner.listeners.entry(key.clone()).or_default();
            listeners.push(Listener {
                id,
                active: Arc::clone(&active),
                on_update: Arc::clone(&on_update),
                on_error: Arc::new(on_error),
            });
            (listeners.len(), latest)
        };

        debug!(key = %key, listener = id, listeners = count, "listener subscribed");
        if let Some(stream) = &self.stream {
            stream.subscribe(&key);
        }

        if let Some(candle) = latest {
            on_update(&candle);
        }

        Subscription {
            id,
            key,
            active,
            store: Arc::downgrade(self),
        }
    }

    fn remove_listener(&self, key: &SeriesKey, id: u64) {
        let last = {
            let mut inner = self.inner.write();
            let Some(listeners) = inner.listeners.get_mut(key) else {
                return;
            };
            let before = listeners.len();
            listeners.retain(|l| l.id != id);
            let removed = listeners.len() < before;
            let empty = listeners.is_empty();
            if empty {
                inner.listeners.remove(key);
            }
            removed && empty
        };

        debug!(key = %key, listener = id, last, "listener unsubscribed");
        if last {
            if let Some(stream) = &self.stream {
                stream.unsubscribe(key);
            }
        }
    }

    /// Merge one live candle and notify the key's listeners.
    ///
    /// Coverage only grows when the candle is contiguous with it. A candle
    /// further ahead (e.g. after a reconnect) leaves the hole uncovered and
    /// returns it as `(covered_end, candle.time)`, once per key until
    /// [`Self::backfill_gap`] has run.
    pub fn apply_live(&self, key: &SeriesKey, candle: Candle) -> Option<(i64, i64)> {
        if !candle.is_valid() {
            warn!(key = %key, time = candle.time, "dropping invalid live candle");
            return None;
        }

        let (gap, callbacks) = {
            let mut guard = self.inner.write();
            let inner = &mut *guard;
            let entry = inner
                .entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::new(key.clone(), Vec::new(), candle.time, candle.time));
            entry.candles = merge_candles(&entry.candles, std::slice::from_ref(&candle));

            let mut gap = None;
            if candle.time <= entry.range_end.saturating_add(key.interval.duration_ms()) {
                entry.range_end = entry.range_end.max(candle.time);
            } else if inner.backfilling.insert(key.clone()) {
                debug!(key = %key, covered_end = entry.range_end, time = candle.time, "live candle past covered range");
                gap = Some((entry.range_end, candle.time));
            }

            self.version.fetch_add(1, Ordering::SeqCst);
            inner.evict(key, self.max_cache_size);
            (gap, inner.callbacks_for(key))
        };

        for (active, on_update) in callbacks {
            if active.load(Ordering::SeqCst) {
                on_update(&candle);
            }
        }
        gap
    }

    /// Deliver `error` to every listener of `keys` (e.g. stream retries
    /// exhausted).
    pub fn notify_error(&self, keys: &[SeriesKey], error: &MarketDataError) {
        let callbacks: Vec<(Arc<AtomicBool>, ErrorCallback)> = {
            let inner = self.inner.read();
            keys.iter()
                .filter_map(|k| inner.listeners.get(k))
                .flatten()
                .map(|l| (Arc::clone(&l.active), Arc::clone(&l.on_error)))
                .collect()
        };

        warn!(keys = keys.len(), listeners = callbacks.len(), error = %error, "notifying listeners of error");
        for (active, on_error) in callbacks {
            if active.load(Ordering::SeqCst) {
                on_error(error);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    /// Snapshot of a full cache entry.
    pub fn entry(&self, key: &SeriesKey) -> Option<CacheEntry> {
        self.inner.read().entries.get(key).cloned()
    }

    /// Thinned copy of an entry for overview rendering. Not for indicators.
    pub fn compressed(&self, key: &SeriesKey) -> Option<CacheEntry> {
        self.inner
            .read()
            .entries
            .get(key)
            .map(|e| compress(e, &self.compression))
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn total_candles(&self) -> usize {
        self.inner.read().total_candles()
    }

    pub fn listener_count(&self, key: &SeriesKey) -> usize {
        self.inner.read().listeners.get(key).map_or(0, Vec::len)
    }

    pub fn adapter(&self) -> &Arc<dyn FeedAdapter> {
        &self.adapter
    }
}

impl std::fmt::Debug for MarketDataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("MarketDataStore")
            .field("source", &self.adapter.source())
            .field("entries", &inner.entries.len())
            .field("listeners", &inner.listeners.len())
            .field("version", &self.version())
            .finish()
    }
}

// =============================================================================
// Subscription guard
// =============================================================================

/// Live-listener handle. Delivery stops as soon as [`Subscription::unsubscribe`]
/// is called or the guard is dropped; both are idempotent.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    key: SeriesKey,
    active: Arc<AtomicBool>,
    store: Weak<MarketDataStore>,
}

impl Subscription {
    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(store) = self.store.upgrade() {
            store.remove_listener(&self.key, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

// =============================================================================
// Tests
// =============================================================================
