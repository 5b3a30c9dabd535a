// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// EMA gives more weight to recent prices than the SMA.
//
//   multiplier = 2 / (period + 1)
//   EMA_t      = x_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// Seeded with the SMA of the first `period` finite values. Output is
// index-aligned with the input; everything before the seed is NaN. Leading
// NaN input is skipped so an EMA can run over another indicator (MACD signal).
// =============================================================================

use crate::types::Candle;

/// Index-aligned EMA of `values`.
///
/// # Edge cases
/// - `period == 0` => all NaN
/// - fewer than `period` finite values => all NaN
/// - a non-finite value after the seed stops the series; later slots stay NaN
pub fn calculate_ema(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if period == 0 {
        return out;
    }

    let Some(first) = values.iter().position(|v| v.is_finite()) else {
        return out;
    };
    let seed_idx = first + period - 1;
    if seed_idx >= values.len() {
        return out;
    }

    let seed = values[first..=seed_idx].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return out;
    }
    out[seed_idx] = seed;

    let multiplier = 2.0 / (period + 1) as f64;
    let mut prev = seed;
    for i in seed_idx + 1..values.len() {
        let ema = values[i] * multiplier + prev * (1.0 - multiplier);
        if !ema.is_finite() {
            break;
        }
        out[i] = ema;
        prev = ema;
    }
    out
}

/// EMA of candle closes.
pub fn ema(candles: &[Candle], period: usize) -> Vec<f64> {
    calculate_ema(&super::closes(candles), period)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_degenerate_inputs() {
        assert!(calculate_ema(&[], 5).is_empty());
        assert!(calculate_ema(&[1.0, 2.0, 3.0], 0).iter().all(|v| v.is_nan()));
        assert!(calculate_ema(&[1.0, 2.0], 5).iter().all(|v| v.is_nan()));
    }

    #[test]
    fn ema_period_equals_length_is_sma_seed() {
        let out = calculate_ema(&[2.0, 4.0, 6.0], 3);
        assert!(out[0].is_nan() && out[1].is_nan());
        assert!((out[2] - 4.0).abs() < 1e-10);
    }

    #[test]
    fn ema_known_values() {
        // 5-period EMA of 1..=10: seed 3.0 at index 4, multiplier 1/3.
        let closes: Vec<f64> = (1..=10).map(|x| x as f64).collect();
        let out = calculate_ema(&closes, 5);
        assert_eq!(out.len(), 10);
        assert!(out[..4].iter().all(|v| v.is_nan()));

        let mult = 2.0 / 6.0;
        let mut expected = 3.0;
        assert!((out[4] - expected).abs() < 1e-10);
        for i in 5..10 {
            expected = closes[i] * mult + expected * (1.0 - mult);
            assert!((out[i] - expected).abs() < 1e-10, "index {i}: got {}, expected {expected}", out[i]);
        }
    }

    #[test]
    fn ema_stops_on_nan_after_seed() {
        let out = calculate_ema(&[1.0, 2.0, 3.0, f64::NAN, 5.0], 3);
        assert!((out[2] - 2.0).abs() < 1e-10);
        assert!(out[3].is_nan() && out[4].is_nan());
    }

    #[test]
    fn ema_over_leading_nan_input() {
        let out = calculate_ema(&[f64::NAN, f64::NAN, 1.0, 2.0, 3.0, 4.0], 2);
        assert!(out[..3].iter().all(|v| v.is_nan()));
        assert!((out[3] - 1.5).abs() < 1e-10);
        assert_eq!(out.len(), 6);
    }

    #[test]
    fn ema_tracks_rising_series_from_below() {
        let closes: Vec<f64> = (1..=200).map(|x| x as f64).collect();
        let out = calculate_ema(&closes, 21);
        let last = out[199];
        assert!(last < 200.0 && last > 180.0);
    }
}
