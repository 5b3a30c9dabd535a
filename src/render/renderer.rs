// =============================================================================
// Chart Renderer — dirty-flag, once-per-frame candlestick renderer
// =============================================================================
//
// Inputs (`set_candles`, `set_indicators`, `set_drawings`, `resize`,
// `set_viewport`, cursor and gesture calls) only update state and raise the
// dirty flag. `on_animation_frame` paints at most once per call, so a burst
// of merges between two frames costs a single redraw.
//
// Paint order per frame:
//   clear → grid/axes → candles → volume → indicators → drawings → crosshair
//
// Zero candles is a normal state: the frame shows a loading message.
// =============================================================================

use std::time::Instant;

use chrono::{TimeZone, Utc};
use tracing::{debug, trace};

use super::canvas::{Canvas, Layer, TextAlign, Theme};
use super::drawing::Drawing;
use super::gesture::{plan_refetch, RefetchDebouncer, RefetchRequest};
use super::viewport::{LinkedTimeAxis, PriceScale, Rect, TimeRange, Viewport};
use crate::indicators::{IndicatorOutput, LineStyle, Pane};
use crate::market_data::filter_range;
use crate::runtime_config::ChartSettings;
use crate::types::{Candle, Interval};

const AXIS_WIDTH: f64 = 64.0;
const AXIS_HEIGHT: f64 = 22.0;
const SUB_PANE_RATIO: f64 = 0.2;
const DEFAULT_VISIBLE_BARS: i64 = 120;
const MIN_VISIBLE_BARS: i64 = 10;
const PRICE_PADDING: f64 = 0.05;
const GRID_TICKS: usize = 6;
const BODY_RATIO: f64 = 0.7;

const MINUTE_MS: i64 = 60_000;
const DAY_MS: i64 = 86_400_000;
const TIME_STEPS: [i64; 13] = [
    MINUTE_MS,
    5 * MINUTE_MS,
    15 * MINUTE_MS,
    30 * MINUTE_MS,
    60 * MINUTE_MS,
    120 * MINUTE_MS,
    240 * MINUTE_MS,
    360 * MINUTE_MS,
    720 * MINUTE_MS,
    DAY_MS,
    2 * DAY_MS,
    7 * DAY_MS,
    30 * DAY_MS,
];

/// Pixel layout of one frame.
#[derive(Debug, Clone, PartialEq)]
struct Layout {
    price: Rect,
    volume: Rect,
    panes: Vec<Rect>,
    chart_width: f64,
    plot_bottom: f64,
}

pub struct ChartRenderer {
    theme: Theme,
    interval: Interval,
    viewport: Viewport,
    volume_ratio: f64,
    width: f64,
    height: f64,

    candles: Vec<Candle>,
    indicators: Vec<IndicatorOutput>,
    drawings: Vec<Drawing>,
    cursor: Option<(f64, f64)>,
    status: Option<String>,

    /// Keep the newest candle in view as data arrives.
    follow_latest: bool,
    dirty: bool,
    frames: u64,

    linked: Option<(LinkedTimeAxis, u64)>,
    debouncer: RefetchDebouncer,
}

impl ChartRenderer {
    pub fn new(settings: &ChartSettings, interval: Interval) -> Self {
        let width = settings.width.max(AXIS_WIDTH + 1.0);
        let height = settings.height.max(AXIS_HEIGHT + 1.0);
        let scale = if settings.log_scale {
            PriceScale::Log
        } else {
            PriceScale::Linear
        };
        let placeholder = TimeRange {
            start: 0,
            end: DEFAULT_VISIBLE_BARS * interval.duration_ms(),
        };
        let area = Rect::new(0.0, 0.0, width - AXIS_WIDTH, height - AXIS_HEIGHT);

        Self {
            theme: Theme::default(),
            interval,
            viewport: Viewport::new(placeholder, area, scale),
            volume_ratio: settings.volume_ratio.clamp(0.0, 0.5),
            width,
            height,
            candles: Vec::new(),
            indicators: Vec::new(),
            drawings: Vec::new(),
            cursor: None,
            status: None,
            follow_latest: true,
            dirty: true,
            frames: 0,
            linked: None,
            debouncer: RefetchDebouncer::new(settings.refetch_debounce()),
        }
    }

    // -------------------------------------------------------------------------
    // Inputs
    // -------------------------------------------------------------------------

    /// Replace the candle series. Redraws only if the visible slice changed
    /// or the window follows the newest candle.
    pub fn set_candles(&mut self, candles: Vec<Candle>) {
        let before = self.viewport.time_range();
        let old = std::mem::replace(&mut self.candles, candles);

        if old.is_empty() || self.follow_latest {
            if let Some(window) = self.latest_window(old.is_empty()) {
                if window != before {
                    self.viewport.set_time_range(window);
                    self.publish_range();
                    self.dirty = true;
                }
            }
        }

        let lead = self.bar_ms();
        if filter_range(&old, before.start - lead, before.end)
            != filter_range(&self.candles, before.start - lead, before.end)
        {
            self.dirty = true;
        }
    }

    /// Indicator outputs, index-aligned with the candles last passed to
    /// [`set_candles`](Self::set_candles).
    pub fn set_indicators(&mut self, indicators: Vec<IndicatorOutput>) {
        self.indicators = indicators;
        self.dirty = true;
    }

    pub fn set_drawings(&mut self, drawings: Vec<Drawing>) {
        self.drawings = drawings;
        self.dirty = true;
    }

    pub fn resize(&mut self, width: f64, height: f64) {
        let width = width.max(AXIS_WIDTH + 1.0);
        let height = height.max(AXIS_HEIGHT + 1.0);
        if width != self.width || height != self.height {
            self.width = width;
            self.height = height;
            self.dirty = true;
        }
    }

    /// Show exactly `range`.
    pub fn set_viewport(&mut self, range: TimeRange) {
        self.viewport.set_time_range(range);
        self.follow_latest = self.data_bounds().is_some_and(|b| range.end >= b.end);
        self.publish_range();
        self.dirty = true;
    }

    pub fn set_log_scale(&mut self, log: bool) {
        let scale = if log { PriceScale::Log } else { PriceScale::Linear };
        if scale != self.viewport.scale() {
            self.viewport.set_scale(scale);
            self.dirty = true;
        }
    }

    pub fn set_cursor(&mut self, cursor: Option<(f64, f64)>) {
        if cursor != self.cursor {
            self.cursor = cursor;
            self.dirty = true;
        }
    }

    /// Persistent banner (e.g. connection lost). `None` hides it.
    pub fn set_status(&mut self, status: Option<String>) {
        if status != self.status {
            self.status = status;
            self.dirty = true;
        }
    }

    /// Share the time window with other charts.
    pub fn link_time_axis(&mut self, axis: LinkedTimeAxis) {
        let range = axis.get();
        let version = axis.version();
        self.viewport.set_time_range(range);
        self.linked = Some((axis, version));
        self.dirty = true;
    }

    // -------------------------------------------------------------------------
    // Gestures
    // -------------------------------------------------------------------------

    /// Drag by `dx` pixels. Returns `true` if the window moved.
    pub fn pan(&mut self, dx: f64, now: Instant) -> bool {
        let bounds = self.data_bounds();
        if !self.viewport.pan_pixels(dx, bounds) {
            return false;
        }
        self.after_gesture(now);
        true
    }

    /// Zoom around pixel column `x`; `factor < 1` zooms in.
    pub fn zoom(&mut self, x: f64, factor: f64, now: Instant) -> bool {
        let bounds = self.data_bounds();
        let min_span = MIN_VISIBLE_BARS * self.bar_ms();
        if !self.viewport.zoom_at(x, factor, min_span, bounds) {
            return false;
        }
        self.after_gesture(now);
        true
    }

    fn after_gesture(&mut self, now: Instant) {
        let range = self.viewport.time_range();
        self.follow_latest = self.data_bounds().is_some_and(|b| range.end >= b.end);
        self.publish_range();
        self.debouncer.on_gesture(now, range);
        self.dirty = true;
    }

    /// History to fetch once the last gesture has settled.
    pub fn poll_refetch(&mut self, now: Instant) -> Option<RefetchRequest> {
        let settled = self.debouncer.poll(now)?;
        let plan = plan_refetch(settled, self.data_bounds(), self.bar_ms());
        if let Some(req) = &plan {
            debug!(start = req.start, end = req.end, older = req.older, "gesture settled, refetch planned");
        }
        plan
    }

    // -------------------------------------------------------------------------
    // Frame
    // -------------------------------------------------------------------------

    /// Paint if anything changed since the last frame. Returns `true` if a
    /// frame was drawn.
    pub fn on_animation_frame(&mut self, canvas: &mut dyn Canvas) -> bool {
        self.sync_linked();
        if !self.dirty {
            return false;
        }
        self.render(canvas);
        self.dirty = false;
        self.frames += 1;
        true
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn viewport(&self) -> &Viewport {
        &self.viewport
    }

    pub fn visible_range(&self) -> TimeRange {
        self.viewport.time_range()
    }

    /// Cached span `[first.time, last.time + interval]`.
    pub fn data_bounds(&self) -> Option<TimeRange> {
        let first = self.candles.first()?;
        let last = self.candles.last()?;
        TimeRange::new(first.time, last.time + self.bar_ms()).ok()
    }

    pub fn visible_candles(&self) -> &[Candle] {
        let range = self.viewport.time_range();
        filter_range(&self.candles, range.start - self.bar_ms(), range.end)
    }

    fn bar_ms(&self) -> i64 {
        self.interval.duration_ms()
    }

    fn latest_window(&self, initial: bool) -> Option<TimeRange> {
        let bounds = self.data_bounds()?;
        let span = if initial {
            DEFAULT_VISIBLE_BARS * self.bar_ms()
        } else {
            self.viewport.time_range().span()
        };
        let window = TimeRange {
            start: bounds.end - span,
            end: bounds.end,
        };
        Some(window.clamp_to(bounds))
    }

    fn publish_range(&mut self) {
        let range = self.viewport.time_range();
        if let Some((axis, seen)) = &mut self.linked {
            *seen = axis.publish(range);
        }
    }

    fn sync_linked(&mut self) {
        let Some((axis, seen)) = &mut self.linked else {
            return;
        };
        let version = axis.version();
        if version == *seen {
            return;
        }
        *seen = version;
        let range = axis.get();
        if range != self.viewport.time_range() {
            self.viewport.set_time_range(range);
            self.dirty = true;
        }
    }

    fn layout(&self) -> Layout {
        let chart_width = self.width - AXIS_WIDTH;
        let plot_bottom = self.height - AXIS_HEIGHT;
        let separate = self.indicators.iter().filter(|o| o.pane() == Pane::Separate).count();

        // Price pane keeps at least 40% of the plot.
        let pane_h = if separate == 0 {
            0.0
        } else {
            (plot_bottom * SUB_PANE_RATIO).min(plot_bottom * 0.6 / separate as f64)
        };
        let price_h = plot_bottom - pane_h * separate as f64;
        let price = Rect::new(0.0, 0.0, chart_width, price_h);
        let volume_h = price.height * self.volume_ratio;
        let volume = Rect::new(0.0, price.bottom() - volume_h, chart_width, volume_h);
        let panes = (0..separate)
            .map(|i| Rect::new(0.0, price_h + pane_h * i as f64, chart_width, pane_h))
            .collect();

        Layout {
            price,
            volume,
            panes,
            chart_width,
            plot_bottom,
        }
    }

    fn render(&mut self, canvas: &mut dyn Canvas) {
        canvas.clear(self.width, self.height, self.theme.background);
        let layout = self.layout();
        self.viewport.set_area(layout.price);

        if self.candles.is_empty() {
            canvas.begin_layer(Layer::Grid);
            let message = self.status.as_deref().unwrap_or("Loading…");
            canvas.text(
                layout.chart_width / 2.0,
                layout.plot_bottom / 2.0,
                message,
                self.theme.status_text,
                TextAlign::Center,
            );
            trace!("rendered empty chart");
            return;
        }

        let (lo, hi) = self.visible_indices();
        self.fit_price(lo, hi);

        self.draw_grid(canvas, &layout);
        self.draw_candles(canvas, lo, hi);
        self.draw_volume(canvas, &layout, lo, hi);
        self.draw_indicators(canvas, &layout, lo, hi);

        canvas.begin_layer(Layer::Drawings);
        for drawing in &self.drawings {
            drawing.render(&self.viewport, canvas);
        }

        self.draw_crosshair(canvas, &layout);
        trace!(visible = hi - lo, frame = self.frames + 1, "chart frame rendered");
    }

    /// Index range `[lo, hi)` of candles overlapping the window.
    fn visible_indices(&self) -> (usize, usize) {
        let range = self.viewport.time_range();
        let lead = self.bar_ms();
        let lo = self.candles.partition_point(|c| c.time < range.start - lead);
        let hi = self.candles.partition_point(|c| c.time <= range.end);
        (lo, hi.max(lo))
    }

    fn fit_price(&mut self, lo: usize, hi: usize) {
        let visible = &self.candles[lo..hi];
        if visible.is_empty() {
            return;
        }
        let mut min = visible.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
        let mut max = visible.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);

        for out in self.indicators.iter().filter(|o| o.pane() == Pane::Overlay) {
            if let Some((a, b)) = out.value_range(lo, hi) {
                min = min.min(a);
                max = max.max(b);
            }
        }
        self.viewport.fit_price(min, max, PRICE_PADDING);
    }

    fn bar_center(&self, vp: &Viewport, time: i64) -> f64 {
        vp.time_to_x(time) + vp.span_to_width(self.bar_ms()) / 2.0
    }

    // -------------------------------------------------------------------------
    // Layers
    // -------------------------------------------------------------------------

    fn draw_grid(&self, canvas: &mut dyn Canvas, layout: &Layout) {
        canvas.begin_layer(Layer::Grid);
        let vp = &self.viewport;
        let (pmin, pmax) = vp.price_range();

        for price in price_ticks(pmin, pmax, GRID_TICKS, vp.scale()) {
            let y = vp.price_to_y(price);
            canvas.line((0.0, y), (layout.chart_width, y), self.theme.grid, 1.0, false);
            canvas.text(
                layout.chart_width + 4.0,
                y,
                &format_price(price),
                self.theme.axis_text,
                TextAlign::Left,
            );
        }

        let (ticks, step) = time_ticks(vp.time_range(), GRID_TICKS);
        for t in ticks {
            let x = vp.time_to_x(t);
            canvas.line((x, 0.0), (x, layout.plot_bottom), self.theme.grid, 1.0, false);
            canvas.text(
                x,
                self.height - 6.0,
                &format_time_label(t, step),
                self.theme.axis_text,
                TextAlign::Center,
            );
        }

        for pane in &layout.panes {
            canvas.line((0.0, pane.y), (layout.chart_width, pane.y), self.theme.axis_text, 1.0, false);
        }
    }

    fn draw_candles(&self, canvas: &mut dyn Canvas, lo: usize, hi: usize) {
        canvas.begin_layer(Layer::Candles);
        let vp = &self.viewport;
        let body_w = (vp.span_to_width(self.bar_ms()) * BODY_RATIO).max(1.0);

        for c in &self.candles[lo..hi] {
            let x = self.bar_center(vp, c.time);
            let color = if c.is_bullish() {
                self.theme.candle_up
            } else {
                self.theme.candle_down
            };
            canvas.line((x, vp.price_to_y(c.high)), (x, vp.price_to_y(c.low)), color, 1.0, false);

            let (y_open, y_close) = (vp.price_to_y(c.open), vp.price_to_y(c.close));
            let top = y_open.min(y_close);
            let height = (y_open - y_close).abs().max(1.0);
            canvas.fill_rect(x - body_w / 2.0, top, body_w, height, color);
        }
    }

    fn draw_volume(&self, canvas: &mut dyn Canvas, layout: &Layout, lo: usize, hi: usize) {
        canvas.begin_layer(Layer::Volume);
        let visible = &self.candles[lo..hi];
        let max_volume = visible.iter().map(|c| c.volume).fold(0.0, f64::max);
        if max_volume <= 0.0 || self.volume_ratio <= 0.0 {
            return;
        }

        let vp = self.viewport.pane(layout.volume, 0.0, max_volume);
        let bar_w = (vp.span_to_width(self.bar_ms()) * BODY_RATIO).max(1.0);
        for c in visible {
            let x = self.bar_center(&vp, c.time);
            let y = vp.price_to_y(c.volume);
            let color = if c.is_bullish() {
                self.theme.volume_up
            } else {
                self.theme.volume_down
            };
            canvas.fill_rect(x - bar_w / 2.0, y, bar_w, layout.volume.bottom() - y, color);
        }
    }

    fn draw_indicators(&self, canvas: &mut dyn Canvas, layout: &Layout, lo: usize, hi: usize) {
        canvas.begin_layer(Layer::Indicators);
        let mut panes = layout.panes.iter();

        for (i, out) in self.indicators.iter().enumerate() {
            let vp = match out.pane() {
                Pane::Overlay => self.viewport.clone(),
                Pane::Separate => {
                    let Some(area) = panes.next() else {
                        continue;
                    };
                    let (min, max) = out
                        .kind
                        .fixed_range()
                        .or_else(|| out.value_range(lo, hi))
                        .unwrap_or((0.0, 1.0));
                    let vp = self.viewport.pane(*area, min, max);
                    canvas.text(
                        area.x + 4.0,
                        area.y + 12.0,
                        &out.kind.label(),
                        self.theme.axis_text,
                        TextAlign::Left,
                    );
                    vp
                }
            };

            for (j, line) in out.lines.iter().enumerate() {
                let color = self.theme.series[(i + j) % self.theme.series.len()];
                self.draw_series(canvas, &vp, &line.values, line.style, lo, hi, color);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn draw_series(
        &self,
        canvas: &mut dyn Canvas,
        vp: &Viewport,
        values: &[f64],
        style: LineStyle,
        lo: usize,
        hi: usize,
        color: &str,
    ) {
        let hi = hi.min(values.len());
        if lo >= hi {
            return;
        }

        if style == LineStyle::Histogram {
            let zero = vp.price_to_y(0.0);
            let bar_w = (vp.span_to_width(self.bar_ms()) * BODY_RATIO).max(1.0);
            for (c, &v) in self.candles[lo..hi].iter().zip(&values[lo..hi]) {
                if v.is_finite() {
                    let x = self.bar_center(vp, c.time);
                    let y = vp.price_to_y(v);
                    canvas.fill_rect(x - bar_w / 2.0, y.min(zero), bar_w, (y - zero).abs(), color);
                }
            }
            return;
        }

        // NaN breaks the line into separate runs.
        let dashed = style == LineStyle::Dashed;
        let mut run: Vec<(f64, f64)> = Vec::new();
        for (c, &v) in self.candles[lo..hi].iter().zip(&values[lo..hi]) {
            if v.is_finite() {
                run.push((self.bar_center(vp, c.time), vp.price_to_y(v)));
            } else if !run.is_empty() {
                if run.len() > 1 {
                    canvas.polyline(&run, color, 1.5, dashed);
                }
                run.clear();
            }
        }
        if run.len() > 1 {
            canvas.polyline(&run, color, 1.5, dashed);
        }
    }

    fn draw_crosshair(&self, canvas: &mut dyn Canvas, layout: &Layout) {
        canvas.begin_layer(Layer::Crosshair);

        if let Some(status) = &self.status {
            canvas.text(layout.chart_width - 4.0, 14.0, status, self.theme.status_text, TextAlign::Right);
        }

        let Some((x, y)) = self.cursor else {
            return;
        };
        if !(0.0..=layout.chart_width).contains(&x) || !(0.0..=layout.plot_bottom).contains(&y) {
            return;
        }

        let theme = &self.theme;
        canvas.line((x, 0.0), (x, layout.plot_bottom), theme.crosshair, 1.0, true);
        canvas.line((0.0, y), (layout.chart_width, y), theme.crosshair, 1.0, true);

        let (time, price) = self.viewport.to_domain(x, y);
        if layout.price.contains(x, y) {
            canvas.fill_rect(layout.chart_width, y - 9.0, AXIS_WIDTH, 18.0, theme.tooltip_bg);
            canvas.text(layout.chart_width + 4.0, y, &format_price(price), theme.axis_text, TextAlign::Left);
        }

        if let Some(c) = self.nearest_candle(time) {
            let tip = format!(
                "{}  O {}  H {}  L {}  C {}  V {:.2}",
                format_time_label(c.time, 0),
                format_price(c.open),
                format_price(c.high),
                format_price(c.low),
                format_price(c.close),
                c.volume
            );
            canvas.fill_rect(0.0, 0.0, layout.chart_width.min(420.0), 20.0, theme.tooltip_bg);
            canvas.text(4.0, 14.0, &tip, theme.axis_text, TextAlign::Left);
        }
    }

    fn nearest_candle(&self, time: i64) -> Option<&Candle> {
        let idx = self.candles.partition_point(|c| c.time <= time);
        let before = idx.checked_sub(1).and_then(|i| self.candles.get(i));
        let after = self.candles.get(idx);
        match (before, after) {
            // Inside the bucket that starts at `before`.
            (Some(b), _) if time < b.time + self.bar_ms() => Some(b),
            (Some(b), Some(a)) => Some(if time - b.time <= a.time - time { b } else { a }),
            (b, a) => b.or(a),
        }
    }
}

impl std::fmt::Debug for ChartRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChartRenderer")
            .field("interval", &self.interval)
            .field("candles", &self.candles.len())
            .field("indicators", &self.indicators.len())
            .field("drawings", &self.drawings.len())
            .field("range", &self.viewport.time_range())
            .field("dirty", &self.dirty)
            .finish()
    }
}

// =============================================================================
// Axis ticks & labels
// =============================================================================

/// Round-number price ticks inside `[min, max]`. On a log axis ticks are
/// evenly spaced in log space.
pub fn price_ticks(min: f64, max: f64, target: usize, scale: PriceScale) -> Vec<f64> {
    if !(min.is_finite() && max.is_finite()) || max <= min || target == 0 {
        return Vec::new();
    }
    match scale {
        PriceScale::Linear => {
            let step = nice_step((max - min) / target as f64);
            let first = (min / step).ceil() as i64;
            let last = (max / step).floor() as i64;
            (first..=last).map(|i| i as f64 * step).collect()
        }
        PriceScale::Log => {
            if min <= 0.0 {
                return Vec::new();
            }
            let (l, h) = (min.ln(), max.ln());
            (0..=target)
                .map(|i| (l + (h - l) * i as f64 / target as f64).exp())
                .collect()
        }
    }
}

fn nice_step(raw: f64) -> f64 {
    let magnitude = 10f64.powf(raw.log10().floor());
    let norm = raw / magnitude;
    let nice = if norm <= 1.0 {
        1.0
    } else if norm <= 2.0 {
        2.0
    } else if norm <= 5.0 {
        5.0
    } else {
        10.0
    };
    nice * magnitude
}

/// Tick times aligned to a calendar-friendly step, plus that step.
pub fn time_ticks(range: TimeRange, target: usize) -> (Vec<i64>, i64) {
    let span = range.span();
    let target = target.max(1) as i64;
    let step = TIME_STEPS
        .iter()
        .copied()
        .find(|s| span / s <= target)
        .unwrap_or(TIME_STEPS[TIME_STEPS.len() - 1]);

    let mut t = range.start.div_euclid(step) * step;
    if t < range.start {
        t += step;
    }
    let mut ticks = Vec::new();
    while t <= range.end {
        ticks.push(t);
        t += step;
    }
    (ticks, step)
}

/// UTC label: date for day-sized steps, clock time below that, both when
/// `step == 0`.
pub fn format_time_label(ms: i64, step: i64) -> String {
    let Some(dt) = Utc.timestamp_millis_opt(ms).single() else {
        return ms.to_string();
    };
    if step == 0 {
        dt.format("%Y-%m-%d %H:%M").to_string()
    } else if step >= DAY_MS {
        dt.format("%Y-%m-%d").to_string()
    } else {
        dt.format("%H:%M").to_string()
    }
}

pub fn format_price(price: f64) -> String {
    if price.abs() >= 1.0 {
        format!("{price:.2}")
    } else {
        format!("{price:.6}")
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::IndicatorKind;
    use crate::render::canvas::{DrawCommand, RecordingCanvas};
    use crate::render::drawing::{ChartPoint, DrawingKind, DrawingStyle};
    use std::time::Duration;

    const BAR: i64 = 60_000;

    fn candles(n: i64) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let open = 100.0 + i as f64;
                let close = if i % 2 == 0 { open + 0.5 } else { open - 0.5 };
                Candle::new(i * BAR, open, open + 1.0, open - 1.0, close, 10.0 + i as f64)
            })
            .collect()
    }

    fn renderer() -> ChartRenderer {
        ChartRenderer::new(&ChartSettings::default(), Interval::M1)
    }

    #[test]
    fn empty_data_renders_loading_state() {
        let mut r = renderer();
        let mut canvas = RecordingCanvas::new();
        assert!(r.on_animation_frame(&mut canvas));
        assert!(canvas.texts().iter().any(|t| t.starts_with("Loading")));
        assert!(canvas.in_layer(Layer::Candles).is_empty());
    }

    #[test]
    fn frame_paints_layers_in_order() {
        let mut r = renderer();
        let data = candles(50);
        let kinds = ChartSettings::default().indicators;
        r.set_indicators(crate::indicators::compute_all(&kinds, &data));
        r.set_candles(data);
        r.set_drawings(vec![Drawing::new(
            DrawingKind::HorizontalLine,
            vec![ChartPoint::new(0, 110.0)],
            DrawingStyle::default(),
        )
        .unwrap()]);

        let mut canvas = RecordingCanvas::new();
        r.on_animation_frame(&mut canvas);
        assert!(matches!(canvas.commands()[0], DrawCommand::Clear { .. }));
        assert_eq!(
            canvas.layers(),
            vec![
                Layer::Grid,
                Layer::Candles,
                Layer::Volume,
                Layer::Indicators,
                Layer::Drawings,
                Layer::Crosshair
            ]
        );
        // Wick + body per candle.
        assert_eq!(canvas.in_layer(Layer::Candles).len(), 100);
        assert_eq!(canvas.in_layer(Layer::Drawings).len(), 1);
    }

    #[test]
    fn candle_colour_follows_direction() {
        let mut r = renderer();
        r.set_candles(candles(2));
        let mut canvas = RecordingCanvas::new();
        r.on_animation_frame(&mut canvas);

        let bodies: Vec<&str> = canvas
            .in_layer(Layer::Candles)
            .into_iter()
            .filter_map(|c| match c {
                DrawCommand::FillRect { color, .. } => Some(color.as_str()),
                _ => None,
            })
            .collect();
        let theme = Theme::default();
        assert_eq!(bodies, vec![theme.candle_up, theme.candle_down]);
    }

    #[test]
    fn redraws_are_coalesced_per_frame() {
        let mut r = renderer();
        let mut canvas = RecordingCanvas::new();
        let mut data = candles(10);
        r.set_candles(data.clone());
        for close in [101.0, 102.0, 103.0] {
            data[9].close = close;
            r.set_candles(data.clone());
        }
        assert!(r.on_animation_frame(&mut canvas));
        assert!(!r.on_animation_frame(&mut canvas));
        assert_eq!(canvas.frames(), 1);
        assert_eq!(r.frames(), 1);
    }

    #[test]
    fn change_outside_visible_window_does_not_redraw() {
        let mut r = renderer();
        let mut canvas = RecordingCanvas::new();
        let mut data = candles(300);
        r.set_candles(data.clone());
        r.on_animation_frame(&mut canvas);

        // Default window shows the newest 120 bars; bar 0 is far off-screen.
        data[0].close = 99.0;
        r.set_candles(data.clone());
        assert!(!r.is_dirty());

        data[299].close = 500.0;
        data[299].high = 501.0;
        r.set_candles(data);
        assert!(r.is_dirty());
    }

    #[test]
    fn window_follows_new_candles_until_user_pans_away() {
        let mut r = renderer();
        r.set_candles(candles(200));
        assert_eq!(r.visible_range().end, 200 * BAR);

        r.set_candles(candles(201));
        assert_eq!(r.visible_range().end, 201 * BAR);

        assert!(r.pan(100.0, Instant::now()));
        let parked = r.visible_range();
        r.set_candles(candles(202));
        assert_eq!(r.visible_range(), parked);
    }

    #[test]
    fn pan_clamps_and_settles_into_older_history_request() {
        let mut r = renderer();
        r.set_candles(candles(200));
        let t0 = Instant::now();

        assert!(r.pan(1e9, t0));
        assert_eq!(r.visible_range().start, 0);
        assert_eq!(r.poll_refetch(t0), None);

        let req = r.poll_refetch(t0 + Duration::from_millis(400)).unwrap();
        assert!(req.older);
        assert_eq!(req.end, 0);
        assert!(req.start < 0);
        assert_eq!(r.poll_refetch(t0 + Duration::from_secs(2)), None);
    }

    #[test]
    fn zoom_respects_minimum_bars() {
        let mut r = renderer();
        r.set_candles(candles(200));
        r.zoom(100.0, 1e-6, Instant::now());
        assert_eq!(r.visible_range().span(), MIN_VISIBLE_BARS * BAR);
    }

    #[test]
    fn linked_charts_pan_in_lockstep() {
        let axis = LinkedTimeAxis::new(TimeRange::new(0, 120 * BAR).unwrap());
        let mut price = renderer();
        let mut rsi = renderer();
        price.link_time_axis(axis.clone());
        rsi.link_time_axis(axis);
        price.set_candles(candles(300));
        rsi.set_candles(candles(300));

        let mut canvas = RecordingCanvas::new();
        price.on_animation_frame(&mut canvas);
        rsi.on_animation_frame(&mut canvas);

        assert!(price.pan(50.0, Instant::now()));
        assert!(rsi.on_animation_frame(&mut canvas));
        assert_eq!(rsi.visible_range(), price.visible_range());
    }

    #[test]
    fn rsi_pane_uses_fixed_scale() {
        let mut r = renderer();
        let data = candles(60);
        r.set_indicators(vec![IndicatorKind::Rsi { period: 14 }.compute(&data)]);
        r.set_candles(data);
        let mut canvas = RecordingCanvas::new();
        r.on_animation_frame(&mut canvas);

        let layout = r.layout();
        assert_eq!(layout.panes.len(), 1);
        assert!(canvas.texts().contains(&"RSI(14)"));
        for cmd in canvas.in_layer(Layer::Indicators) {
            if let DrawCommand::Polyline { points, .. } = cmd {
                for &(_, y) in points {
                    assert!(y >= layout.panes[0].y - 1e-9 && y <= layout.panes[0].bottom() + 1e-9);
                }
            }
        }
    }

    #[test]
    fn crosshair_shows_tooltip_and_status() {
        let mut r = renderer();
        r.set_candles(candles(50));
        r.set_status(Some("Disconnected".into()));
        r.set_cursor(Some((300.0, 200.0)));
        let mut canvas = RecordingCanvas::new();
        r.on_animation_frame(&mut canvas);

        let texts = canvas.texts();
        assert!(texts.contains(&"Disconnected"));
        assert!(texts.iter().any(|t| t.contains(" O ") && t.contains(" V ")));
    }

    #[test]
    fn log_scale_toggle_redraws() {
        let mut r = renderer();
        let mut canvas = RecordingCanvas::new();
        r.on_animation_frame(&mut canvas);
        r.set_log_scale(true);
        assert!(r.is_dirty());
        assert_eq!(r.viewport().scale(), PriceScale::Log);
    }

    #[test]
    fn nice_price_ticks() {
        assert_eq!(
            price_ticks(0.0, 100.0, 5, PriceScale::Linear),
            vec![0.0, 20.0, 40.0, 60.0, 80.0, 100.0]
        );
        let log = price_ticks(10.0, 1000.0, 2, PriceScale::Log);
        assert_eq!(log.len(), 3);
        assert!((log[1] - 100.0).abs() < 1e-9);
        assert!(price_ticks(5.0, 5.0, 5, PriceScale::Linear).is_empty());
    }

    #[test]
    fn time_ticks_align_to_calendar_steps() {
        let (ticks, step) = time_ticks(TimeRange::new(0, 3_600_000).unwrap(), 6);
        assert_eq!(step, 15 * MINUTE_MS);
        assert_eq!(ticks.len(), 5);
        assert_eq!(format_time_label(ticks[1], step), "00:15");
        assert_eq!(format_time_label(0, DAY_MS), "1970-01-01");
        assert_eq!(format_time_label(0, 0), "1970-01-01 00:00");
    }
}
