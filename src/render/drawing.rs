// =============================================================================
// Drawings — user annotations anchored in (time, price) space
// =============================================================================
//
// Drawings are owned by the UI layer, not the data cache. They are stored in
// domain coordinates and projected through the viewport on every frame, so
// they stay glued to the candles under pan, zoom and scale changes.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::trace;
use uuid::Uuid;

use super::canvas::{Canvas, TextAlign};
use super::viewport::Viewport;
use crate::error::{MarketDataError, Result};

/// Retracement ratios drawn by a fibonacci tool.
pub const FIB_LEVELS: [f64; 7] = [0.0, 0.236, 0.382, 0.5, 0.618, 0.786, 1.0];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DrawingKind {
    TrendLine,
    /// Starts at the first point and extends through the second to the edge.
    Ray,
    HorizontalLine,
    VerticalLine,
    Rectangle,
    Fibonacci,
    Text { text: String },
}

impl DrawingKind {
    pub fn required_points(&self) -> usize {
        match self {
            Self::HorizontalLine | Self::VerticalLine | Self::Text { .. } => 1,
            Self::TrendLine | Self::Ray | Self::Rectangle | Self::Fibonacci => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChartPoint {
    pub time: i64,
    pub price: f64,
}

impl ChartPoint {
    pub fn new(time: i64, price: f64) -> Self {
        Self { time, price }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawingStyle {
    pub color: String,
    pub width: f64,
    pub dashed: bool,
}

impl Default for DrawingStyle {
    fn default() -> Self {
        Self {
            color: "#00cccc".to_string(),
            width: 1.0,
            dashed: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Drawing {
    pub id: Uuid,
    pub kind: DrawingKind,
    pub points: Vec<ChartPoint>,
    pub style: DrawingStyle,
}

impl Drawing {
    /// Validate the point count and coordinates, then assign a fresh id.
    pub fn new(kind: DrawingKind, points: Vec<ChartPoint>, style: DrawingStyle) -> Result<Self> {
        let required = kind.required_points();
        if points.len() != required {
            return Err(MarketDataError::Validation(format!(
                "{kind:?} needs {required} point(s), got {}",
                points.len()
            )));
        }
        if points.iter().any(|p| !p.price.is_finite()) {
            return Err(MarketDataError::Validation("drawing price must be finite".into()));
        }
        if !(style.width.is_finite() && style.width > 0.0) {
            return Err(MarketDataError::Validation("drawing line width must be positive".into()));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            kind,
            points,
            style,
        })
    }

    /// Move every anchor by `dt` ms and `dp` price units.
    pub fn translate(&mut self, dt: i64, dp: f64) {
        for p in &mut self.points {
            p.time += dt;
            p.price += dp;
        }
    }

    /// Price of each fibonacci level: level 0 sits on the second point,
    /// level 1 on the first.
    pub fn fib_prices(&self) -> Option<Vec<(f64, f64)>> {
        if self.kind != DrawingKind::Fibonacci || self.points.len() != 2 {
            return None;
        }
        let (from, to) = (self.points[0].price, self.points[1].price);
        Some(FIB_LEVELS.iter().map(|&l| (l, to + (from - to) * l)).collect())
    }

    /// Draws nothing when the anchors don't match the kind, which only
    /// happens for drawings deserialised without going through [`Drawing::new`].
    pub fn render(&self, vp: &Viewport, canvas: &mut dyn Canvas) {
        if self.points.len() != self.kind.required_points() {
            trace!(id = %self.id, kind = ?self.kind, points = self.points.len(), "skipping drawing with wrong anchor count");
            return;
        }
        let area = vp.area();
        let color = self.style.color.as_str();
        let (width, dashed) = (self.style.width, self.style.dashed);
        let px: Vec<(f64, f64)> = self.points.iter().map(|p| vp.to_pixel(p.time, p.price)).collect();

        match &self.kind {
            DrawingKind::TrendLine => canvas.line(px[0], px[1], color, width, dashed),
            DrawingKind::Ray => {
                let ((x0, y0), (x1, y1)) = (px[0], px[1]);
                let end = if (x1 - x0).abs() < f64::EPSILON {
                    (x1, y1)
                } else {
                    let edge = if x1 >= x0 { area.right() } else { area.x };
                    (edge, y0 + (edge - x0) * (y1 - y0) / (x1 - x0))
                };
                canvas.line((x0, y0), end, color, width, dashed);
            }
            DrawingKind::HorizontalLine => {
                let y = px[0].1;
                canvas.line((area.x, y), (area.right(), y), color, width, dashed);
            }
            DrawingKind::VerticalLine => {
                let x = px[0].0;
                canvas.line((x, area.y), (x, area.bottom()), color, width, dashed);
            }
            DrawingKind::Rectangle => {
                let (x, y) = (px[0].0.min(px[1].0), px[0].1.min(px[1].1));
                let (w, h) = ((px[0].0 - px[1].0).abs(), (px[0].1 - px[1].1).abs());
                canvas.stroke_rect(x, y, w, h, color, width);
            }
            DrawingKind::Fibonacci => {
                let left = px[0].0.min(px[1].0);
                for (level, price) in self.fib_prices().unwrap_or_default() {
                    let y = vp.price_to_y(price);
                    canvas.line((left, y), (area.right(), y), color, width, dashed);
                    canvas.text(
                        left + 4.0,
                        y - 2.0,
                        &format!("{:.1}% ({price:.2})", level * 100.0),
                        color,
                        TextAlign::Left,
                    );
                }
            }
            DrawingKind::Text { text } => canvas.text(px[0].0, px[0].1, text, color, TextAlign::Left),
        }
    }
}
