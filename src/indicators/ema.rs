// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
//   multiplier = 2 / (period + 1)
//   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// The first value is seeded with the SMA of the first `period` closes.
// =============================================================================

/// EMA series for `values`; the first output corresponds to index
/// `period - 1` of the input. Empty when the input is too short, the period is
/// zero, or a non-finite value appears.
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period + 1) as f64;

    let sma: f64 = values[..period].iter().sum::<f64>() / period as f64;
    if !sma.is_finite() {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(values.len() - period + 1);
    out.push(sma);
    let mut prev = sma;
    for &v in &values[period..] {
        let next = v * multiplier + prev * (1.0 - multiplier);
        if !next.is_finite() {
            break;
        }
        out.push(next);
        prev = next;
    }
    out
}
