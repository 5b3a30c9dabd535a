// =============================================================================
// Bollinger Bands
// =============================================================================
//
// A middle band (SMA), an upper band (SMA + k*σ) and a lower band
// (SMA - k*σ), with σ the population standard deviation of the window.
// =============================================================================

use crate::types::Candle;

/// Index-aligned band lines. Slots before `period - 1` are NaN.
#[derive(Debug, Clone, PartialEq)]
pub struct BollingerBands {
    pub upper: Vec<f64>,
    pub middle: Vec<f64>,
    pub lower: Vec<f64>,
}

pub fn calculate_bollinger(closes: &[f64], period: usize, num_std: f64) -> BollingerBands {
    let n = closes.len();
    let mut bands = BollingerBands {
        upper: vec![f64::NAN; n],
        middle: vec![f64::NAN; n],
        lower: vec![f64::NAN; n],
    };
    if period == 0 || n < period {
        return bands;
    }

    for end in period - 1..n {
        let window = &closes[end + 1 - period..=end];
        let middle = window.iter().sum::<f64>() / period as f64;
        let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period as f64;
        let band = num_std * variance.sqrt();

        bands.middle[end] = middle;
        bands.upper[end] = middle + band;
        bands.lower[end] = middle - band;
    }
    bands
}

/// Bollinger Bands of candle closes.
pub fn bollinger(candles: &[Candle], period: usize, num_std: f64) -> BollingerBands {
    calculate_bollinger(&super::closes(candles), period, num_std)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bollinger_basic() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        let bb = calculate_bollinger(&closes, 20, 2.0);
        assert!(bb.middle[..19].iter().all(|v| v.is_nan()));
        assert!((bb.middle[19] - 10.5).abs() < 1e-10);
        assert!(bb.upper[19] > bb.middle[19]);
        assert!(bb.lower[19] < bb.middle[19]);
    }

    #[test]
    fn bollinger_uses_population_stddev() {
        // Window [2, 4, 4, 4, 5, 5, 7, 9]: mean 5, population σ = 2.
        let closes = vec![2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let bb = calculate_bollinger(&closes, 8, 2.0);
        assert!((bb.middle[7] - 5.0).abs() < 1e-10);
        assert!((bb.upper[7] - 9.0).abs() < 1e-10);
        assert!((bb.lower[7] - 1.0).abs() < 1e-10);
    }

    #[test]
    fn bollinger_insufficient_data() {
        let bb = calculate_bollinger(&[1.0, 2.0, 3.0], 20, 2.0);
        assert_eq!(bb.upper.len(), 3);
        assert!(bb.upper.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn bollinger_flat_has_zero_width() {
        let bb = calculate_bollinger(&vec![100.0; 20], 20, 2.0);
        assert!((bb.upper[19] - bb.lower[19]).abs() < 1e-10);
    }
}
