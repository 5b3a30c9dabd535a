// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, stateless transforms over an ordered candle sequence. Every output is
// index-aligned with its input (same length, NaN while warming up), so the
// renderer can zip values against candle timestamps directly. Cheap enough to
// recompute after every merge.

pub mod bollinger;
pub mod ema;
pub mod macd;
pub mod rsi;
pub mod sma;

use serde::{Deserialize, Serialize};

use crate::error::{MarketDataError, Result};
use crate::types::Candle;

pub use bollinger::{bollinger, calculate_bollinger, BollingerBands};
pub use ema::{calculate_ema, ema};
pub use macd::{calculate_macd, macd, MacdSeries};
pub use rsi::{calculate_rsi, rsi};
pub use sma::{calculate_sma, sma};

pub(crate) fn closes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.close).collect()
}

// =============================================================================
// IndicatorKind — configurable indicator selection
// =============================================================================

/// One configured indicator with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum IndicatorKind {
    Sma { period: usize },
    Ema { period: usize },
    Rsi { period: usize },
    Macd { fast: usize, slow: usize, signal: usize },
    Bollinger { period: usize, std_dev_mult: f64 },
}

/// Where an indicator is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pane {
    /// On top of the candles, sharing the price scale.
    Overlay,
    /// In its own sub-pane below the price chart.
    Separate,
}

/// How a line is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStyle {
    Line,
    Dashed,
    Histogram,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorLine {
    pub name: String,
    pub style: LineStyle,
    /// Index-aligned with the candles the output was computed from.
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorOutput {
    pub kind: IndicatorKind,
    pub lines: Vec<IndicatorLine>,
}

impl IndicatorOutput {
    pub fn pane(&self) -> Pane {
        self.kind.pane()
    }

    /// Min / max over defined values in `[from, to)`, or `None` if none are.
    pub fn value_range(&self, from: usize, to: usize) -> Option<(f64, f64)> {
        let mut range: Option<(f64, f64)> = None;
        for line in &self.lines {
            let to = to.min(line.values.len());
            for &v in line.values.get(from..to).unwrap_or(&[]) {
                if v.is_finite() {
                    range = Some(match range {
                        Some((lo, hi)) => (lo.min(v), hi.max(v)),
                        None => (v, v),
                    });
                }
            }
        }
        range
    }
}

fn line(name: impl Into<String>, style: LineStyle, values: Vec<f64>) -> IndicatorLine {
    IndicatorLine {
        name: name.into(),
        style,
        values,
    }
}

impl IndicatorKind {
    /// Reject parameters that can never produce a value.
    pub fn validate(&self) -> Result<()> {
        let ok = match *self {
            Self::Sma { period } | Self::Ema { period } | Self::Rsi { period } => period > 0,
            Self::Macd { fast, slow, signal } => fast > 0 && signal > 0 && fast < slow,
            Self::Bollinger { period, std_dev_mult } => {
                period > 0 && std_dev_mult.is_finite() && std_dev_mult >= 0.0
            }
        };
        if ok {
            Ok(())
        } else {
            Err(MarketDataError::Validation(format!("invalid indicator parameters: {}", self.label())))
        }
    }

    pub fn label(&self) -> String {
        match *self {
            Self::Sma { period } => format!("SMA({period})"),
            Self::Ema { period } => format!("EMA({period})"),
            Self::Rsi { period } => format!("RSI({period})"),
            Self::Macd { fast, slow, signal } => format!("MACD({fast},{slow},{signal})"),
            Self::Bollinger { period, std_dev_mult } => format!("BB({period},{std_dev_mult})"),
        }
    }

    pub fn pane(&self) -> Pane {
        match self {
            Self::Sma { .. } | Self::Ema { .. } | Self::Bollinger { .. } => Pane::Overlay,
            Self::Rsi { .. } | Self::Macd { .. } => Pane::Separate,
        }
    }

    /// Fixed value axis for oscillators with a bounded range.
    pub fn fixed_range(&self) -> Option<(f64, f64)> {
        match self {
            Self::Rsi { .. } => Some((0.0, 100.0)),
            _ => None,
        }
    }

    pub fn compute(&self, candles: &[Candle]) -> IndicatorOutput {
        let label = self.label();
        let lines = match *self {
            Self::Sma { period } => vec![line(label, LineStyle::Line, sma(candles, period))],
            Self::Ema { period } => vec![line(label, LineStyle::Line, ema(candles, period))],
            Self::Rsi { period } => vec![line(label, LineStyle::Line, rsi(candles, period))],
            Self::Macd { fast, slow, signal } => {
                let m = macd(candles, fast, slow, signal);
                vec![
                    line("MACD", LineStyle::Line, m.macd),
                    line("Signal", LineStyle::Dashed, m.signal),
                    line("Histogram", LineStyle::Histogram, m.histogram),
                ]
            }
            Self::Bollinger { period, std_dev_mult } => {
                let bb = bollinger(candles, period, std_dev_mult);
                vec![
                    line("BB upper", LineStyle::Dashed, bb.upper),
                    line("BB middle", LineStyle::Line, bb.middle),
                    line("BB lower", LineStyle::Dashed, bb.lower),
                ]
            }
        };
        IndicatorOutput { kind: self.clone(), lines }
    }
}

/// Compute every configured indicator. Invalid entries are skipped.
pub fn compute_all(kinds: &[IndicatorKind], candles: &[Candle]) -> Vec<IndicatorOutput> {
    kinds
        .iter()
        .filter(|k| match k.validate() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "skipping indicator");
                false
            }
        })
        .map(|k| k.compute(candles))
        .collect()
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let close = 100.0 + i as f64;
                Candle::new(i as i64 * 60_000, close, close + 1.0, close - 1.0, close, 1.0)
            })
            .collect()
    }

    #[test]
    fn every_output_line_is_index_aligned() {
        let data = candles(50);
        let kinds = crate::runtime_config::ChartSettings::default().indicators;
        for out in compute_all(&kinds, &data) {
            for l in &out.lines {
                assert_eq!(l.values.len(), 50, "{} misaligned", l.name);
            }
        }
    }

    #[test]
    fn kinds_serialise_with_tag() {
        let json = serde_json::to_string(&IndicatorKind::Macd { fast: 12, slow: 26, signal: 9 }).unwrap();
        assert_eq!(json, r#"{"kind":"macd","fast":12,"slow":26,"signal":9}"#);
        let back: IndicatorKind = serde_json::from_str(r#"{"kind":"sma","period":5}"#).unwrap();
        assert_eq!(back, IndicatorKind::Sma { period: 5 });
    }

    #[test]
    fn invalid_kinds_are_rejected_and_skipped() {
        assert!(IndicatorKind::Sma { period: 0 }.validate().is_err());
        assert!(IndicatorKind::Macd { fast: 26, slow: 12, signal: 9 }.validate().is_err());
        let outs = compute_all(&[IndicatorKind::Ema { period: 0 }, IndicatorKind::Ema { period: 3 }], &candles(5));
        assert_eq!(outs.len(), 1);
    }

    #[test]
    fn panes_and_fixed_ranges() {
        assert_eq!(IndicatorKind::Rsi { period: 14 }.pane(), Pane::Separate);
        assert_eq!(IndicatorKind::Bollinger { period: 20, std_dev_mult: 2.0 }.pane(), Pane::Overlay);
        assert_eq!(IndicatorKind::Rsi { period: 14 }.fixed_range(), Some((0.0, 100.0)));
        assert_eq!(IndicatorKind::Sma { period: 14 }.fixed_range(), None);
    }

    #[test]
    fn value_range_ignores_warmup() {
        let out = IndicatorKind::Sma { period: 3 }.compute(&candles(10));
        assert_eq!(out.value_range(0, 10), Some((101.0, 108.0)));
        assert_eq!(out.value_range(0, 2), None);
        assert_eq!(out.value_range(8, 100), Some((107.0, 108.0)));
    }
}
