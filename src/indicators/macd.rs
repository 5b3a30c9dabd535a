// =============================================================================
// Moving Average Convergence / Divergence (MACD)
// =============================================================================
//
//   macd      = EMA(fast) - EMA(slow)
//   signal    = EMA(macd, signal_period)
//   histogram = macd - signal
//
// All three lines are index-aligned with the candles. `macd` is defined from
// the slow EMA's seed onwards, `signal` from `signal_period - 1` bars later.
// =============================================================================

use super::ema::calculate_ema;
use crate::types::Candle;

#[derive(Debug, Clone, PartialEq)]
pub struct MacdSeries {
    pub macd: Vec<f64>,
    pub signal: Vec<f64>,
    pub histogram: Vec<f64>,
}

pub fn calculate_macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> MacdSeries {
    let fast_ema = calculate_ema(closes, fast);
    let slow_ema = calculate_ema(closes, slow);

    // NaN wherever either EMA is undefined.
    let macd: Vec<f64> = fast_ema.iter().zip(&slow_ema).map(|(f, s)| f - s).collect();
    let signal_line = calculate_ema(&macd, signal);
    let histogram = macd.iter().zip(&signal_line).map(|(m, s)| m - s).collect();

    MacdSeries {
        macd,
        signal: signal_line,
        histogram,
    }
}

/// MACD of candle closes.
pub fn macd(candles: &[Candle], fast: usize, slow: usize, signal: usize) -> MacdSeries {
    calculate_macd(&super::closes(candles), fast, slow, signal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macd_alignment_and_warmup() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + (i as f64 * 0.3).sin() * 5.0).collect();
        let out = calculate_macd(&closes, 12, 26, 9);

        assert_eq!(out.macd.len(), 60);
        assert_eq!(out.signal.len(), 60);
        assert_eq!(out.histogram.len(), 60);

        assert!(out.macd[..25].iter().all(|v| v.is_nan()));
        assert!(out.macd[25..].iter().all(|v| v.is_finite()));
        assert!(out.signal[..33].iter().all(|v| v.is_nan()));
        assert!(out.signal[33..].iter().all(|v| v.is_finite()));

        for i in 33..60 {
            assert!((out.histogram[i] - (out.macd[i] - out.signal[i])).abs() < 1e-12);
        }
    }

    #[test]
    fn macd_flat_series_is_zero() {
        let out = calculate_macd(&vec![50.0; 40], 12, 26, 9);
        assert!(out.macd[25].abs() < 1e-10);
        assert!(out.histogram[39].abs() < 1e-10);
    }

    #[test]
    fn macd_positive_in_uptrend() {
        let closes: Vec<f64> = (1..=80).map(|x| x as f64).collect();
        let out = calculate_macd(&closes, 12, 26, 9);
        assert!(out.macd[79] > 0.0);
    }

    #[test]
    fn macd_short_input_is_all_nan() {
        let out = calculate_macd(&[1.0, 2.0, 3.0], 12, 26, 9);
        assert!(out.macd.iter().chain(&out.signal).chain(&out.histogram).all(|v| v.is_nan()));
    }
}
