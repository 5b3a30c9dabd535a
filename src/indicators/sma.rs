// =============================================================================
// Simple Moving Average (SMA)
// =============================================================================
//
//   SMA_t = (x_{t-period+1} + ... + x_t) / period
//
// Output is index-aligned with the input: the first `period - 1` slots after
// the first finite input are NaN. Leading NaN input (e.g. another indicator's
// warm-up) is skipped, so SMAs can be chained.
// =============================================================================

use crate::types::Candle;

/// Index-aligned SMA of `values`. `period == 0` yields all NaN.
pub fn calculate_sma(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if period == 0 {
        return out;
    }

    let Some(first) = values.iter().position(|v| v.is_finite()) else {
        return out;
    };

    let mut sum = 0.0;
    for i in first..values.len() {
        sum += values[i];
        if i >= first + period {
            sum -= values[i - period];
        }
        if i + 1 >= first + period {
            out[i] = sum / period as f64;
        }
    }
    out
}

/// SMA of candle closes.
pub fn sma(candles: &[Candle], period: usize) -> Vec<f64> {
    calculate_sma(&super::closes(candles), period)
}
