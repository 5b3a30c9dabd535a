// =============================================================================
// Viewport — visible time/price window and its pixel mapping
// =============================================================================
//
//   x = area.x + (time - time.start) / span * area.width
//   y = area.bottom - (f(price) - f(min)) / (f(max) - f(min)) * area.height
//
// with f = identity (linear) or ln (logarithmic). `to_pixel` and `to_domain`
// are exact inverses of each other. Gestures (pan, zoom) only move the time
// window and clamp it to the range the cache actually holds.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{MarketDataError, Result};

/// Smallest price representable on a log axis.
const LOG_FLOOR: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PriceScale {
    #[default]
    Linear,
    Log,
}

/// Pixel rectangle, origin top-left.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width: width.max(1.0),
            height: height.max(1.0),
        }
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.x && x <= self.right() && y >= self.y && y <= self.bottom()
    }
}

/// Non-empty `[start, end]` window in epoch ms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    pub fn new(start: i64, end: i64) -> Result<Self> {
        if start >= end {
            return Err(MarketDataError::Validation(format!(
                "time range start {start} must be before end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn span(&self) -> i64 {
        self.end - self.start
    }

    pub fn contains(&self, t: i64) -> bool {
        t >= self.start && t <= self.end
    }

    /// Shift (and if necessary shrink) `self` so it lies inside `bounds`.
    pub fn clamp_to(self, bounds: TimeRange) -> TimeRange {
        if self.span() >= bounds.span() {
            return bounds;
        }
        let shift = if self.start < bounds.start {
            bounds.start - self.start
        } else if self.end > bounds.end {
            bounds.end - self.end
        } else {
            0
        };
        TimeRange {
            start: self.start + shift,
            end: self.end + shift,
        }
    }
}

// =============================================================================
// Viewport
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Viewport {
    time: TimeRange,
    price_min: f64,
    price_max: f64,
    area: Rect,
    scale: PriceScale,
}

impl Viewport {
    pub fn new(time: TimeRange, area: Rect, scale: PriceScale) -> Self {
        let mut vp = Self {
            time,
            price_min: 0.0,
            price_max: 1.0,
            area,
            scale,
        };
        vp.set_price_range(1.0, 2.0);
        vp
    }

    pub fn time_range(&self) -> TimeRange {
        self.time
    }

    pub fn price_range(&self) -> (f64, f64) {
        (self.price_min, self.price_max)
    }

    pub fn area(&self) -> Rect {
        self.area
    }

    pub fn scale(&self) -> PriceScale {
        self.scale
    }

    pub fn set_time_range(&mut self, time: TimeRange) {
        self.time = time;
    }

    pub fn set_area(&mut self, area: Rect) {
        self.area = area;
    }

    pub fn set_scale(&mut self, scale: PriceScale) {
        self.scale = scale;
        let (lo, hi) = (self.price_min, self.price_max);
        self.set_price_range(lo, hi);
    }

    /// Set the visible value range. Degenerate or inverted input is widened
    /// so the mapping stays invertible.
    pub fn set_price_range(&mut self, min: f64, max: f64) {
        let (mut lo, mut hi) = if min <= max { (min, max) } else { (max, min) };
        if !lo.is_finite() || !hi.is_finite() {
            return;
        }
        if self.scale == PriceScale::Log {
            lo = lo.max(LOG_FLOOR);
            hi = hi.max(lo);
        }
        if hi - lo <= f64::EPSILON * hi.abs().max(1.0) {
            let pad = (hi.abs() * 0.01).max(1e-9);
            hi += pad;
            lo = match self.scale {
                PriceScale::Log => (lo - pad).max(LOG_FLOOR),
                PriceScale::Linear => lo - pad,
            };
        }
        self.price_min = lo;
        self.price_max = hi;
    }

    /// Fit the value range to `[lo, hi]` with `padding` (fraction of the span)
    /// above and below.
    pub fn fit_price(&mut self, lo: f64, hi: f64, padding: f64) {
        match self.scale {
            PriceScale::Linear => {
                let pad = (hi - lo).abs() * padding;
                self.set_price_range(lo - pad, hi + pad);
            }
            PriceScale::Log => {
                let (l, h) = (lo.max(LOG_FLOOR).ln(), hi.max(LOG_FLOOR).ln());
                let pad = (h - l).abs() * padding;
                self.set_price_range((l - pad).exp(), (h + pad).exp());
            }
        }
    }

    /// Same time axis, different pixel area and value range (indicator
    /// sub-panes and the volume histogram).
    pub fn pane(&self, area: Rect, value_min: f64, value_max: f64) -> Viewport {
        let mut vp = Viewport {
            time: self.time,
            price_min: 0.0,
            price_max: 1.0,
            area,
            scale: PriceScale::Linear,
        };
        vp.set_price_range(value_min, value_max);
        vp
    }

    // -------------------------------------------------------------------------
    // Transforms
    // -------------------------------------------------------------------------

    fn project(&self, price: f64) -> f64 {
        match self.scale {
            PriceScale::Linear => price,
            PriceScale::Log => price.max(LOG_FLOOR).ln(),
        }
    }

    fn unproject(&self, v: f64) -> f64 {
        match self.scale {
            PriceScale::Linear => v,
            PriceScale::Log => v.exp(),
        }
    }

    pub fn time_to_x(&self, time: i64) -> f64 {
        let ratio = (time - self.time.start) as f64 / self.time.span() as f64;
        self.area.x + ratio * self.area.width
    }

    pub fn x_to_time(&self, x: f64) -> i64 {
        let ratio = (x - self.area.x) / self.area.width;
        self.time.start + (ratio * self.time.span() as f64).round() as i64
    }

    pub fn price_to_y(&self, price: f64) -> f64 {
        let lo = self.project(self.price_min);
        let hi = self.project(self.price_max);
        let norm = (self.project(price) - lo) / (hi - lo);
        self.area.bottom() - norm * self.area.height
    }

    pub fn y_to_price(&self, y: f64) -> f64 {
        let lo = self.project(self.price_min);
        let hi = self.project(self.price_max);
        let norm = (self.area.bottom() - y) / self.area.height;
        self.unproject(lo + norm * (hi - lo))
    }

    pub fn to_pixel(&self, time: i64, price: f64) -> (f64, f64) {
        (self.time_to_x(time), self.price_to_y(price))
    }

    pub fn to_domain(&self, x: f64, y: f64) -> (i64, f64) {
        (self.x_to_time(x), self.y_to_price(y))
    }

    /// Width in pixels of `duration_ms` at the current zoom.
    pub fn span_to_width(&self, duration_ms: i64) -> f64 {
        duration_ms as f64 / self.time.span() as f64 * self.area.width
    }

    // -------------------------------------------------------------------------
    // Gestures
    // -------------------------------------------------------------------------

    /// Drag by `dx` pixels (positive = content moves right, i.e. earlier
    /// times come into view). Returns `true` if the window moved.
    pub fn pan_pixels(&mut self, dx: f64, bounds: Option<TimeRange>) -> bool {
        let ms_per_px = self.time.span() as f64 / self.area.width;
        let delta = (dx * ms_per_px).round() as i64;
        let moved = TimeRange {
            start: self.time.start - delta,
            end: self.time.end - delta,
        };
        self.apply(moved, bounds)
    }

    /// Scale the window by `factor` (<1 zooms in) keeping the time under `x`
    /// fixed. The span never drops below `min_span`.
    pub fn zoom_at(&mut self, x: f64, factor: f64, min_span: i64, bounds: Option<TimeRange>) -> bool {
        if !(factor.is_finite() && factor > 0.0) {
            return false;
        }
        let anchor = self.x_to_time(x);
        let span = self.time.span() as f64;
        let ratio = ((anchor - self.time.start) as f64 / span).clamp(0.0, 1.0);

        let new_span = ((span * factor).round() as i64).max(min_span.max(1));
        let start = anchor - (new_span as f64 * ratio).round() as i64;
        let zoomed = TimeRange {
            start,
            end: start + new_span,
        };
        self.apply(zoomed, bounds)
    }

    fn apply(&mut self, next: TimeRange, bounds: Option<TimeRange>) -> bool {
        let next = match bounds {
            Some(b) => next.clamp_to(b),
            None => next,
        };
        let changed = next != self.time;
        self.time = next;
        changed
    }
}

// =============================================================================
// LinkedTimeAxis — one time window shared by several charts
// =============================================================================

/// Shared time window. Every chart holding a clone re-syncs when `version`
/// moves, so a pan on one redraws all of them in lockstep.
#[derive(Debug, Clone)]
pub struct LinkedTimeAxis {
    range: Arc<RwLock<TimeRange>>,
    version: Arc<AtomicU64>,
}

impl LinkedTimeAxis {
    pub fn new(range: TimeRange) -> Self {
        Self {
            range: Arc::new(RwLock::new(range)),
            version: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn get(&self) -> TimeRange {
        *self.range.read()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Store `range` and return the new version.
    pub fn publish(&self, range: TimeRange) -> u64 {
        let mut guard = self.range.write();
        if *guard == range {
            return self.version();
        }
        *guard = range;
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn vp(scale: PriceScale) -> Viewport {
        let mut v = Viewport::new(
            TimeRange::new(0, 1_000).unwrap(),
            Rect::new(0.0, 0.0, 100.0, 200.0),
            scale,
        );
        v.set_price_range(10.0, 1_000.0);
        v
    }

    #[test]
    fn time_range_rejects_empty_windows() {
        assert!(TimeRange::new(5, 5).is_err());
        assert!(TimeRange::new(6, 5).is_err());
        assert_eq!(TimeRange::new(0, 10).unwrap().span(), 10);
    }

    #[test]
    fn linear_mapping_is_affine() {
        let v = vp(PriceScale::Linear);
        assert_eq!(v.to_pixel(0, 10.0), (0.0, 200.0));
        assert_eq!(v.to_pixel(1_000, 1_000.0), (100.0, 0.0));
        let (x, y) = v.to_pixel(500, 505.0);
        assert!((x - 50.0).abs() < 1e-9 && (y - 100.0).abs() < 1e-9);
    }

    #[test]
    fn log_mapping_puts_geometric_mean_in_the_middle() {
        let v = vp(PriceScale::Log);
        // sqrt(10 * 1000) = 100
        assert!((v.price_to_y(100.0) - 100.0).abs() < 1e-9);
        assert!((v.price_to_y(10.0) - 200.0).abs() < 1e-9);
    }

    #[test]
    fn to_domain_inverts_to_pixel() {
        for scale in [PriceScale::Linear, PriceScale::Log] {
            let v = vp(scale);
            for (t, p) in [(0, 10.0), (250, 42.0), (999, 731.5)] {
                let (x, y) = v.to_pixel(t, p);
                let (t2, p2) = v.to_domain(x, y);
                assert_eq!(t2, t);
                assert!((p2 - p).abs() < 1e-6, "{scale:?}: {p2} vs {p}");
            }
        }
    }

    #[test]
    fn degenerate_price_range_is_widened() {
        let mut v = vp(PriceScale::Linear);
        v.set_price_range(50.0, 50.0);
        let (lo, hi) = v.price_range();
        assert!(lo < 50.0 && hi > 50.0);
        assert!(v.price_to_y(50.0).is_finite());
    }

    #[test]
    fn pan_translates_and_clamps_to_bounds() {
        let mut v = vp(PriceScale::Linear);
        let bounds = TimeRange::new(-500, 1_200).unwrap();

        // 10 px at 10 ms/px = 100 ms earlier.
        assert!(v.pan_pixels(10.0, Some(bounds)));
        assert_eq!(v.time_range(), TimeRange { start: -100, end: 900 });

        v.pan_pixels(1_000.0, Some(bounds));
        assert_eq!(v.time_range(), TimeRange { start: -500, end: 500 });
        assert!(!v.pan_pixels(10.0, Some(bounds)));

        v.pan_pixels(-1_000.0, Some(bounds));
        assert_eq!(v.time_range(), TimeRange { start: 200, end: 1_200 });
    }

    #[test]
    fn zoom_keeps_cursor_time_fixed() {
        let mut v = vp(PriceScale::Linear);
        let before = v.x_to_time(25.0);
        assert!(v.zoom_at(25.0, 0.5, 10, None));
        assert_eq!(v.time_range().span(), 500);
        assert_eq!(v.x_to_time(25.0), before);
    }

    #[test]
    fn zoom_respects_min_span_and_bounds() {
        let mut v = vp(PriceScale::Linear);
        v.zoom_at(50.0, 0.0001, 100, None);
        assert_eq!(v.time_range().span(), 100);

        let bounds = TimeRange::new(0, 2_000).unwrap();
        v.zoom_at(50.0, 1_000.0, 100, Some(bounds));
        assert_eq!(v.time_range(), bounds);
    }

    #[test]
    fn sub_pane_shares_time_axis() {
        let v = vp(PriceScale::Log);
        let pane = v.pane(Rect::new(0.0, 200.0, 100.0, 50.0), 0.0, 100.0);
        assert_eq!(pane.time_to_x(300), v.time_to_x(300));
        assert_eq!(pane.price_to_y(0.0), 250.0);
        assert_eq!(pane.scale(), PriceScale::Linear);
    }

    #[test]
    fn linked_axis_versions_changes_only() {
        let axis = LinkedTimeAxis::new(TimeRange::new(0, 10).unwrap());
        let other = axis.clone();
        let v1 = axis.version();

        let v2 = axis.publish(TimeRange::new(5, 15).unwrap());
        assert_eq!(v2, v1 + 1);
        assert_eq!(other.get(), TimeRange { start: 5, end: 15 });
        assert_eq!(other.version(), v2);

        assert_eq!(axis.publish(TimeRange::new(5, 15).unwrap()), v2);
    }
}
