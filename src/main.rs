// =============================================================================
// Aurora Chart — Headless Runner
// =============================================================================
//
// Wires one live chart (feed adapter, store, stream, renderer) and drives it
// at ~60 Hz against a recording canvas. A UI host would swap the canvas for
// its own surface and forward mouse/keyboard gestures into `ChartApp`.
// =============================================================================

use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use aurora_chart::render::RecordingCanvas;
use aurora_chart::{ChartApp, ChartConfig};

const CONFIG_PATH: &str = "chart_config.json";
const FRAME_INTERVAL: Duration = Duration::from_millis(16);
const STATS_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Aurora Chart — Starting Up                       ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = ChartConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        ChartConfig::default()
    });
    config.apply_env_overrides()?;

    info!(
        feed = %config.feed_source,
        symbol = %config.symbol,
        interval = %config.interval,
        history_bars = config.history_bars,
        "Chart configuration"
    );

    // ── 2. Wire the chart ────────────────────────────────────────────────
    let mut app = ChartApp::connect(config)?;

    match app.load_initial_history().await {
        Ok(candles) => info!(candles, "Initial history ready"),
        Err(e) => warn!(error = %e, "Initial history fetch failed, continuing with live data only"),
    }
    app.start_live();

    // ── 3. Frame loop ────────────────────────────────────────────────────
    let mut canvas = RecordingCanvas::new();
    let mut frames = tokio::time::interval(FRAME_INTERVAL);
    frames.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut stats = tokio::time::interval(STATS_INTERVAL);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!("Chart running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = frames.tick() => {
                app.on_animation_frame(Instant::now(), &mut canvas);
            }
            _ = stats.tick() => {
                info!(
                    frames = app.frames_rendered(),
                    live_updates = app.live_updates(),
                    cached_candles = app.store().total_candles(),
                    state = ?app.connection_state(),
                    last_frame_commands = canvas.commands().len(),
                    "frame stats"
                );
            }
            signal = &mut shutdown => {
                signal?;
                break;
            }
        }
    }

    // ── 4. Graceful shutdown ─────────────────────────────────────────────
    warn!("Shutdown signal received — stopping gracefully");
    app.shutdown();

    if let Err(e) = app.config().save(CONFIG_PATH) {
        error!(error = %e, "Failed to save chart config on shutdown");
    }

    info!("Aurora Chart shut down complete.");
    Ok(())
}
