// =============================================================================
// Chart Application Root — Aurora Chart Engine
// =============================================================================
//
// Owns one chart end to end: the market-data store, the live stream handle,
// the renderer and the shared time axis. Everything is constructor-injected;
// `connect` wires the real network pieces, `with_parts` lets tests build an
// isolated instance around fakes.
//
// Data path:
//   StreamConnection ─events─▶ forward_events ─▶ MarketDataStore (merge)
//   MarketDataStore.version ─▶ on_animation_frame ─▶ indicators ─▶ renderer
//
// The frame loop never awaits. History re-fetches planned by the renderer
// run on spawned tasks and land in the store like any other merge.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::feed::{adapter_for, RestHistoryClient};
use crate::indicators::{compute_all, IndicatorKind};
use crate::market_data::{MarketDataStore, Subscription};
use crate::render::{
    Canvas, ChartRenderer, Drawing, LinkedTimeAxis, RefetchRequest, TimeRange,
};
use crate::runtime_config::ChartConfig;
use crate::stream::{StreamConnection, StreamEvent, StreamHandle};
use crate::types::{ConnectionState, SeriesKey};

/// Pump stream events into the store until the connection task goes away.
/// Holes the live feed skipped over are backfilled on spawned tasks.
pub async fn forward_events(store: Arc<MarketDataStore>, mut events: mpsc::UnboundedReceiver<StreamEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Candle { key, candle, closed } => {
                trace!(key = %key, time = candle.time, closed, "live candle");
                if let Some((from, to)) = store.apply_live(&key, candle) {
                    let store = Arc::clone(&store);
                    tokio::spawn(async move {
                        if let Err(e) = store.backfill_gap(&key, from, to).await {
                            warn!(key = %key, from, to, error = %e, "live gap backfill failed");
                        }
                    });
                }
            }
            StreamEvent::State(state) => {
                info!(state = ?state, "stream connection state changed");
            }
            StreamEvent::Exhausted { keys, error } => {
                warn!(keys = keys.len(), error = %error, "live stream gave up, notifying listeners");
                store.notify_error(&keys, &error);
            }
        }
    }
    debug!("stream event channel closed");
}

pub struct ChartApp {
    config: ChartConfig,
    key: SeriesKey,
    store: Arc<MarketDataStore>,
    stream: Option<StreamHandle>,
    renderer: ChartRenderer,
    time_axis: LinkedTimeAxis,
    drawings: Vec<Drawing>,

    subscription: Option<Subscription>,
    /// Store version last pulled into the renderer.
    seen_version: u64,
    live_updates: Arc<AtomicU64>,
    last_error: Arc<RwLock<Option<String>>>,
    refetch: Option<JoinHandle<()>>,
}

impl ChartApp {
    /// Build the live wiring for `config`: adapter, REST client, stream task
    /// and the event pump. Must be called inside a tokio runtime.
    pub fn connect(config: ChartConfig) -> anyhow::Result<Self> {
        let key = SeriesKey::new(&config.symbol, config.interval).context("invalid chart symbol")?;
        let adapter = adapter_for(config.feed_source);
        let timeout = config.history_timeout_ms.map(Duration::from_millis);
        let fetcher =
            RestHistoryClient::new(Arc::clone(&adapter), timeout).context("failed to build history client")?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = StreamConnection::spawn(Arc::clone(&adapter), config.reconnect.clone(), events_tx);

        let store = MarketDataStore::new(
            adapter,
            Arc::new(fetcher),
            Some(Arc::new(handle.clone())),
            config.max_cache_size,
            config.compression.clone(),
        );
        tokio::spawn(forward_events(Arc::clone(&store), events_rx));

        info!(feed = %config.feed_source, key = %key, "chart connected");
        Ok(Self::with_parts(config, key, store, Some(handle)))
    }

    pub fn with_parts(
        config: ChartConfig,
        key: SeriesKey,
        store: Arc<MarketDataStore>,
        stream: Option<StreamHandle>,
    ) -> Self {
        let mut renderer = ChartRenderer::new(&config.chart, key.interval);
        let time_axis = LinkedTimeAxis::new(renderer.visible_range());
        renderer.link_time_axis(time_axis.clone());

        Self {
            config,
            key,
            store,
            stream,
            renderer,
            time_axis,
            drawings: Vec::new(),
            subscription: None,
            seen_version: 0,
            live_updates: Arc::new(AtomicU64::new(0)),
            last_error: Arc::new(RwLock::new(None)),
            refetch: None,
        }
    }

    // ── Data ────────────────────────────────────────────────────────────

    /// Fetch the configured number of bars up to now.
    pub async fn load_initial_history(&mut self) -> Result<usize> {
        self.load_history_ending(Utc::now().timestamp_millis()).await
    }

    /// Fetch `history_bars` bars ending at `end` (epoch ms) and hand them to
    /// the renderer. Returns the number of candles received.
    pub async fn load_history_ending(&mut self, end: i64) -> Result<usize> {
        let span = i64::from(self.config.history_bars) * self.key.interval.duration_ms();
        let entry = self
            .store
            .fetch_history(&self.key.symbol, self.key.interval, end - span, end)
            .await?;

        info!(key = %self.key, candles = entry.len(), "initial history loaded");
        self.sync_from_store();
        Ok(entry.len())
    }

    /// Attach the live listener. Replaces any previous subscription, which
    /// also re-arms a stream that exhausted its retry budget.
    pub fn start_live(&mut self) {
        if let Some(old) = self.subscription.take() {
            old.unsubscribe();
        }

        let updates = Arc::clone(&self.live_updates);
        let errors = Arc::clone(&self.last_error);
        let subscription = self.store.subscribe(
            self.key.clone(),
            move |_candle| {
                updates.fetch_add(1, Ordering::Relaxed);
            },
            move |error| {
                *errors.write() = Some(error.to_string());
            },
        );
        info!(key = %self.key, "live updates attached");
        self.subscription = Some(subscription);
    }

    /// Pull the cached series into the renderer if the store moved.
    fn sync_from_store(&mut self) -> bool {
        let version = self.store.version();
        if version == self.seen_version {
            return false;
        }
        self.seen_version = version;

        let Some(entry) = self.store.entry(&self.key) else {
            return false;
        };
        let outputs = compute_all(&self.config.chart.indicators, &entry.candles);
        self.renderer.set_candles(entry.candles);
        self.renderer.set_indicators(outputs);
        true
    }

    fn spawn_refetch(&mut self, request: RefetchRequest) {
        if self.refetch.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("history refetch already in flight, skipping");
            return;
        }

        let store = Arc::clone(&self.store);
        let errors = Arc::clone(&self.last_error);
        let key = self.key.clone();
        self.refetch = Some(tokio::spawn(async move {
            match store.fetch_history(&key.symbol, key.interval, request.start, request.end).await {
                Ok(entry) => {
                    debug!(key = %key, older = request.older, candles = entry.len(), "history refetched");
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "history refetch failed");
                    *errors.write() = Some(e.to_string());
                }
            }
        }));
    }

    /// Wait for the in-flight history refetch, if any.
    pub async fn join_refetch(&mut self) {
        if let Some(handle) = self.refetch.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "history refetch task failed");
            }
        }
    }

    // ── Frame ───────────────────────────────────────────────────────────

    /// One animation-frame tick. Returns `true` if a frame was painted.
    pub fn on_animation_frame(&mut self, now: Instant, canvas: &mut dyn Canvas) -> bool {
        self.sync_from_store();
        let status = self.status_text();
        self.renderer.set_status(status);

        if let Some(request) = self.renderer.poll_refetch(now) {
            self.spawn_refetch(request);
        }
        self.renderer.on_animation_frame(canvas)
    }

    fn status_text(&self) -> Option<String> {
        let state = self.stream.as_ref().map(StreamHandle::state);
        if state == Some(ConnectionState::Connected) {
            *self.last_error.write() = None;
            return None;
        }

        let error = self.last_error.read().clone();
        match state {
            Some(ConnectionState::Error) => Some(format!(
                "Disconnected: {}",
                error.unwrap_or_else(|| "reconnect attempts exhausted".into())
            )),
            Some(ConnectionState::Connecting) => Some("Connecting…".into()),
            Some(ConnectionState::Disconnected) if self.subscription.is_some() => Some("Reconnecting…".into()),
            _ => error,
        }
    }

    // ── UI input ────────────────────────────────────────────────────────

    pub fn pan(&mut self, dx: f64, now: Instant) -> bool {
        self.renderer.pan(dx, now)
    }

    pub fn zoom(&mut self, x: f64, factor: f64, now: Instant) -> bool {
        self.renderer.zoom(x, factor, now)
    }

    pub fn set_cursor(&mut self, cursor: Option<(f64, f64)>) {
        self.renderer.set_cursor(cursor);
    }

    pub fn resize(&mut self, width: f64, height: f64) {
        self.config.chart.width = width;
        self.config.chart.height = height;
        self.renderer.resize(width, height);
    }

    pub fn set_viewport(&mut self, range: TimeRange) {
        self.renderer.set_viewport(range);
    }

    pub fn set_log_scale(&mut self, log: bool) {
        self.config.chart.log_scale = log;
        self.renderer.set_log_scale(log);
    }

    /// Add `kind` if absent, remove it if present. Returns `true` when the
    /// indicator is now shown.
    pub fn toggle_indicator(&mut self, kind: IndicatorKind) -> bool {
        let indicators = &mut self.config.chart.indicators;
        let shown = match indicators.iter().position(|k| *k == kind) {
            Some(i) => {
                indicators.remove(i);
                false
            }
            None => {
                indicators.push(kind);
                true
            }
        };

        let candles = self.store.entry(&self.key).map(|e| e.candles).unwrap_or_default();
        self.renderer
            .set_indicators(compute_all(&self.config.chart.indicators, &candles));
        shown
    }

    pub fn add_drawing(&mut self, drawing: Drawing) -> Uuid {
        let id = drawing.id;
        self.drawings.push(drawing);
        self.renderer.set_drawings(self.drawings.clone());
        id
    }

    pub fn remove_drawing(&mut self, id: Uuid) -> bool {
        let before = self.drawings.len();
        self.drawings.retain(|d| d.id != id);
        let removed = self.drawings.len() != before;
        if removed {
            self.renderer.set_drawings(self.drawings.clone());
        }
        removed
    }

    /// Move drawing `id` by a pointer drag from `from` to `to` (pixels).
    /// Returns `false` if the drawing is unknown or the drag has no defined
    /// price delta (no data on screen yet).
    pub fn drag_drawing(&mut self, id: Uuid, from: (f64, f64), to: (f64, f64)) -> bool {
        let vp = self.renderer.viewport();
        let (t0, p0) = vp.to_domain(from.0, from.1);
        let (t1, p1) = vp.to_domain(to.0, to.1);
        let (dt, dp) = (t1 - t0, p1 - p0);
        if !dp.is_finite() {
            return false;
        }

        let Some(drawing) = self.drawings.iter_mut().find(|d| d.id == id) else {
            return false;
        };
        drawing.translate(dt, dp);
        trace!(id = %id, dt, dp, "drawing moved");
        self.renderer.set_drawings(self.drawings.clone());
        true
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn config(&self) -> &ChartConfig {
        &self.config
    }

    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    pub fn store(&self) -> &Arc<MarketDataStore> {
        &self.store
    }

    pub fn renderer(&self) -> &ChartRenderer {
        &self.renderer
    }

    pub fn drawings(&self) -> &[Drawing] {
        &self.drawings
    }

    /// Shared time axis; hand a clone to any sub-chart that should pan in
    /// lockstep.
    pub fn time_axis(&self) -> &LinkedTimeAxis {
        &self.time_axis
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.stream
            .as_ref()
            .map(StreamHandle::state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn live_updates(&self) -> u64 {
        self.live_updates.load(Ordering::Relaxed)
    }

    pub fn frames_rendered(&self) -> u64 {
        self.renderer.frames()
    }

    /// Detach listeners and close the stream.
    pub fn shutdown(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        if let Some(handle) = self.refetch.take() {
            handle.abort();
        }
        if let Some(stream) = &self.stream {
            stream.shutdown();
        }
        info!(key = %self.key, frames = self.renderer.frames(), "chart shut down");
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MarketDataError;
    use crate::feed::{BinanceAdapter, HistoryFetcher, HistoryRequest};
    use crate::render::{ChartPoint, DrawingKind, DrawingStyle, Layer, RecordingCanvas};
    use crate::types::{Candle, Interval};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    const BAR: i64 = 60_000;

    struct FakeFetcher {
        candles: Vec<Candle>,
        requests: Mutex<Vec<(i64, i64)>>,
    }

    #[async_trait]
    impl HistoryFetcher for FakeFetcher {
        async fn fetch(&self, request: &HistoryRequest) -> Result<Vec<Candle>> {
            self.requests.lock().push((request.start, request.end));
            Ok(self
                .candles
                .iter()
                .filter(|c| c.time >= request.start && c.time <= request.end)
                .copied()
                .collect())
        }
    }

    fn bar(i: i64, close: f64) -> Candle {
        Candle::new(i * BAR, close, close + 1.0, close - 1.0, close, 3.0)
    }

    fn app(bars: i64) -> (ChartApp, Arc<FakeFetcher>) {
        let fetcher = Arc::new(FakeFetcher {
            candles: (0..bars).map(|i| bar(i, 100.0 + i as f64)).collect(),
            requests: Mutex::new(Vec::new()),
        });
        let mut config = ChartConfig::default();
        config.history_bars = 100;
        let store = MarketDataStore::new(
            Arc::new(BinanceAdapter::new()),
            fetcher.clone(),
            None,
            config.max_cache_size,
            config.compression.clone(),
        );
        let key = SeriesKey::new("BTCUSDT", Interval::M1).unwrap();
        (ChartApp::with_parts(config, key, store, None), fetcher)
    }

    #[tokio::test]
    async fn initial_history_reaches_the_renderer() {
        let (mut app, _) = app(200);
        let loaded = app.load_history_ending(199 * BAR).await.unwrap();
        assert_eq!(loaded, 101);

        let mut canvas = RecordingCanvas::new();
        assert!(app.on_animation_frame(Instant::now(), &mut canvas));
        assert_eq!(canvas.in_layer(Layer::Candles).len(), 2 * 101);
        assert!(!canvas.in_layer(Layer::Indicators).is_empty());
    }

    #[tokio::test]
    async fn live_candles_merge_and_redraw() {
        let (mut app, _) = app(200);
        app.load_history_ending(199 * BAR).await.unwrap();
        app.start_live();
        let mut canvas = RecordingCanvas::new();
        app.on_animation_frame(Instant::now(), &mut canvas);

        let (tx, rx) = mpsc::unbounded_channel();
        let key = app.key().clone();
        tx.send(StreamEvent::Candle { key: key.clone(), candle: bar(199, 250.0), closed: false })
            .unwrap();
        tx.send(StreamEvent::Candle { key, candle: bar(200, 251.0), closed: false })
            .unwrap();
        drop(tx);
        forward_events(Arc::clone(app.store()), rx).await;

        // Replay on subscribe plus two live updates.
        assert_eq!(app.live_updates(), 3);
        assert!(app.on_animation_frame(Instant::now(), &mut canvas));
        let entry = app.store().entry(app.key()).unwrap();
        assert_eq!(entry.len(), 102);
        assert_eq!(entry.last().unwrap().close, 251.0);
    }

    #[tokio::test]
    async fn idle_frames_do_not_repaint() {
        let (mut app, _) = app(50);
        app.load_history_ending(49 * BAR).await.unwrap();
        let mut canvas = RecordingCanvas::new();
        assert!(app.on_animation_frame(Instant::now(), &mut canvas));
        assert!(!app.on_animation_frame(Instant::now(), &mut canvas));
        assert_eq!(app.frames_rendered(), 1);
    }

    #[tokio::test]
    async fn settled_pan_fetches_older_history() {
        let (mut app, fetcher) = app(400);
        app.load_history_ending(399 * BAR).await.unwrap();
        let mut canvas = RecordingCanvas::new();
        let t0 = Instant::now();
        app.on_animation_frame(t0, &mut canvas);

        assert!(app.zoom(600.0, 0.5, t0));
        assert!(app.pan(1e9, t0));
        app.on_animation_frame(t0, &mut canvas);
        assert_eq!(fetcher.requests.lock().len(), 1);

        app.on_animation_frame(t0 + Duration::from_secs(1), &mut canvas);
        app.join_refetch().await;

        let requests = fetcher.requests.lock().clone();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].1, 299 * BAR);
        assert!(requests[1].0 < 299 * BAR);

        app.on_animation_frame(t0 + Duration::from_secs(1), &mut canvas);
        assert!(app.renderer().data_bounds().unwrap().start < 299 * BAR);
    }

    #[tokio::test]
    async fn exhausted_stream_shows_persistent_status() {
        let (mut app, _) = app(50);
        app.load_history_ending(49 * BAR).await.unwrap();
        app.start_live();

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(StreamEvent::Exhausted {
            keys: vec![app.key().clone()],
            error: MarketDataError::Network("reconnect attempts exhausted: refused".into()),
        })
        .unwrap();
        drop(tx);
        forward_events(Arc::clone(app.store()), rx).await;

        let mut canvas = RecordingCanvas::new();
        app.on_animation_frame(Instant::now(), &mut canvas);
        assert!(canvas.texts().iter().any(|t| t.contains("reconnect attempts exhausted")));
    }

    #[tokio::test]
    async fn indicator_toggle_and_drawings_redraw() {
        let (mut app, _) = app(60);
        app.load_history_ending(59 * BAR).await.unwrap();
        let mut canvas = RecordingCanvas::new();
        app.on_animation_frame(Instant::now(), &mut canvas);

        let rsi = IndicatorKind::Rsi { period: 14 };
        assert!(!app.toggle_indicator(rsi.clone()));
        assert!(!app.config().chart.indicators.contains(&rsi));
        assert!(app.on_animation_frame(Instant::now(), &mut canvas));
        assert!(!canvas.texts().contains(&"RSI(14)"));

        assert!(app.toggle_indicator(rsi));
        let line = Drawing::new(
            DrawingKind::HorizontalLine,
            vec![ChartPoint::new(0, 120.0)],
            DrawingStyle::default(),
        )
        .unwrap();
        let id = app.add_drawing(line);
        assert!(app.on_animation_frame(Instant::now(), &mut canvas));
        assert!(canvas.texts().contains(&"RSI(14)"));
        assert_eq!(canvas.in_layer(Layer::Drawings).len(), 1);

        assert!(app.remove_drawing(id));
        assert!(!app.remove_drawing(id));
    }

    #[tokio::test]
    async fn dragging_a_drawing_moves_its_anchor() {
        let (mut app, _) = app(60);
        app.load_history_ending(59 * BAR).await.unwrap();
        let mut canvas = RecordingCanvas::new();
        app.on_animation_frame(Instant::now(), &mut canvas);

        let line = Drawing::new(
            DrawingKind::TrendLine,
            vec![ChartPoint::new(10 * BAR, 120.0), ChartPoint::new(20 * BAR, 130.0)],
            DrawingStyle::default(),
        )
        .unwrap();
        let id = app.add_drawing(line);
        app.on_animation_frame(Instant::now(), &mut canvas);
        assert!(!app.on_animation_frame(Instant::now(), &mut canvas));

        // Up and to the right: later time, higher price.
        assert!(app.drag_drawing(id, (300.0, 200.0), (340.0, 150.0)));
        let moved = &app.drawings()[0];
        assert!(moved.points[0].time > 10 * BAR);
        assert!(moved.points[0].price > 120.0);
        let shift = moved.points[1].price - moved.points[0].price;
        assert!((shift - 10.0).abs() < 1e-6);
        assert!(app.on_animation_frame(Instant::now(), &mut canvas));

        assert!(!app.drag_drawing(Uuid::new_v4(), (0.0, 0.0), (10.0, 10.0)));
    }

    #[tokio::test]
    async fn shutdown_releases_the_subscription() {
        let (mut app, _) = app(10);
        app.load_history_ending(9 * BAR).await.unwrap();
        app.start_live();
        assert_eq!(app.store().listener_count(app.key()), 1);
        app.shutdown();
        assert_eq!(app.store().listener_count(app.key()), 0);
    }
}
