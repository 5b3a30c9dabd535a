// =============================================================================
// Candle series operations — merge, range filter, thinning, eviction order
// =============================================================================
//
// All functions here are pure. The store calls them while holding its write
// lock, so a merge is observed either entirely or not at all.
// =============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::runtime_config::CompressionConfig;
use crate::types::{Candle, SeriesKey};

/// Cached candles of one series together with the time range they cover.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: SeriesKey,
    /// Strictly increasing by `time`.
    pub candles: Vec<Candle>,
    pub range_start: i64,
    pub range_end: i64,
}

impl CacheEntry {
    pub fn new(key: SeriesKey, candles: Vec<Candle>, range_start: i64, range_end: i64) -> Self {
        Self {
            key,
            candles,
            range_start,
            range_end,
        }
    }

    /// `true` when `[start, end]` lies inside the covered range.
    pub fn covers(&self, start: i64, end: i64) -> bool {
        self.range_start <= start && end <= self.range_end
    }

    /// Copy of this entry restricted to candles with `start <= time <= end`.
    pub fn view(&self, start: i64, end: i64) -> CacheEntry {
        CacheEntry {
            key: self.key.clone(),
            candles: filter_range(&self.candles, start, end).to_vec(),
            range_start: start.max(self.range_start),
            range_end: end.min(self.range_end),
        }
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// Union of two series keyed by `time`. On collision the incoming candle
/// replaces the existing one; within `incoming`, later elements win.
///
/// `merge(a, a) == a` for any valid series, and merging disjoint batches is
/// order-independent.
pub fn merge_candles(existing: &[Candle], incoming: &[Candle]) -> Vec<Candle> {
    if incoming.is_empty() {
        return existing.to_vec();
    }

    // Live updates almost always land on or after the last bar.
    if let (Some(last), true) = (existing.last(), is_strictly_increasing(incoming)) {
        if incoming[0].time > last.time {
            let mut merged = Vec::with_capacity(existing.len() + incoming.len());
            merged.extend_from_slice(existing);
            merged.extend_from_slice(incoming);
            return merged;
        }
        if incoming.len() == 1 && incoming[0].time == last.time {
            let mut merged = existing.to_vec();
            if let Some(slot) = merged.last_mut() {
                *slot = incoming[0];
            }
            return merged;
        }
    }

    let mut by_time: BTreeMap<i64, Candle> = existing.iter().map(|c| (c.time, *c)).collect();
    for candle in incoming {
        by_time.insert(candle.time, *candle);
    }
    by_time.into_values().collect()
}

fn is_strictly_increasing(candles: &[Candle]) -> bool {
    candles.windows(2).all(|w| w[0].time < w[1].time)
}

/// Sub-slice with `start <= time <= end`. `candles` must be sorted.
pub fn filter_range(candles: &[Candle], start: i64, end: i64) -> &[Candle] {
    if start > end {
        return &[];
    }
    let lo = candles.partition_point(|c| c.time < start);
    let hi = candles.partition_point(|c| c.time <= end);
    &candles[lo..hi.max(lo)]
}

// ---------------------------------------------------------------------------
// Compression
// ---------------------------------------------------------------------------

/// Lossy thinning for long-range overview rendering. Keeps the first and last
/// candle plus every candle whose close moved by more than
/// `price_threshold` or whose volume moved by more than `volume_threshold`
/// (both relative) against its predecessor.
///
/// Never feed the result to indicator computation.
pub fn compress(entry: &CacheEntry, config: &CompressionConfig) -> CacheEntry {
    let candles = &entry.candles;
    if candles.len() <= 2 {
        return entry.clone();
    }

    let mut kept = Vec::with_capacity(candles.len() / 2 + 2);
    kept.push(candles[0]);

    for pair in candles[..candles.len() - 1].windows(2) {
        let (prev, cur) = (&pair[0], &pair[1]);
        if relative_change(prev.close, cur.close) > config.price_threshold
            || relative_change(prev.volume, cur.volume) > config.volume_threshold
        {
            kept.push(*cur);
        }
    }

    if let Some(last) = candles.last() {
        kept.push(*last);
    }

    CacheEntry {
        key: entry.key.clone(),
        candles: kept,
        range_start: entry.range_start,
        range_end: entry.range_end,
    }
}

fn relative_change(prev: f64, cur: f64) -> f64 {
    if prev == 0.0 {
        if cur == 0.0 {
            0.0
        } else {
            f64::INFINITY
        }
    } else {
        ((cur - prev) / prev).abs()
    }
}

// ---------------------------------------------------------------------------
// Eviction
// ---------------------------------------------------------------------------

/// What the eviction planner needs to know about one cache entry.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub key: SeriesKey,
    pub len: usize,
    pub range_end: i64,
    /// Active subscriptions or the entry currently being merged.
    pub pinned: bool,
}

/// Keys to drop, in order, so the total candle count falls to `budget` or
/// below. Oldest `range_end` goes first; pinned entries are never chosen, so
/// the budget may remain exceeded.
pub fn eviction_order(candidates: &[EvictionCandidate], budget: usize) -> Vec<SeriesKey> {
    let mut total: usize = candidates.iter().map(|c| c.len).sum();
    if total <= budget {
        return Vec::new();
    }

    let mut evictable: Vec<&EvictionCandidate> = candidates.iter().filter(|c| !c.pinned).collect();
    evictable.sort_by(|a, b| a.range_end.cmp(&b.range_end).then_with(|| a.key.cmp(&b.key)));

    let mut order = Vec::new();
    for candidate in evictable {
        if total <= budget {
            break;
        }
        total -= candidate.len;
        order.push(candidate.key.clone());
    }
    order
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
