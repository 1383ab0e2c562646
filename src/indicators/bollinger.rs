// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Middle band = SMA(period), upper/lower = middle +/- k * stddev over the
// same window.
// =============================================================================

/// Bands over the trailing `period` window of a close series.
#[derive(Debug, Clone)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

/// Compute the bands for the most recent window, `None` when there are fewer
/// than `period` values or the result is degenerate.
pub fn bollinger(values: &[f64], period: usize, num_std: f64) -> Option<BollingerBands> {
    if period == 0 || values.len() < period {
        return None;
    }

    let window = &values[values.len() - period..];
    let middle = window.iter().sum::<f64>() / period as f64;
    if middle == 0.0 || !middle.is_finite() {
        return None;
    }

    let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period as f64;
    let std_dev = variance.sqrt();

    let upper = middle + num_std * std_dev;
    let lower = middle - num_std * std_dev;
    if !upper.is_finite() || !lower.is_finite() {
        return None;
    }

    Some(BollingerBands {
        upper,
        middle,
        lower,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_bands() {
        let values: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        let bb = bollinger(&values, 20, 2.0).unwrap();
        assert!(bb.upper > bb.middle);
        assert!(bb.lower < bb.middle);
    }

    #[test]
    fn insufficient_data() {
        assert!(bollinger(&[1.0, 2.0, 3.0], 20, 2.0).is_none());
    }

    #[test]
    fn flat_series_collapses_bands() {
        let values = vec![100.0; 20];
        let bb = bollinger(&values, 20, 2.0).unwrap();
        assert!((bb.upper - bb.lower).abs() < 1e-10);
        assert!((bb.middle - 100.0).abs() < 1e-10);
    }

    #[test]
    fn uses_trailing_window_only() {
        // A large old value outside the window must not move the bands.
        let mut values = vec![1000.0];
        values.extend(std::iter::repeat(10.0).take(20));
        let bb = bollinger(&values, 20, 2.0).unwrap();
        assert!((bb.middle - 10.0).abs() < 1e-10);
    }
}
