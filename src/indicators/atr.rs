// =============================================================================
// Average True Range (ATR)
// =============================================================================
//
// True Range per bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR is the 14-bar moving average of TR (Wilder's smoothing):
//   ATR_0 = SMA of first `period` TR values
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
// =============================================================================

use crate::market::Bar;

/// The full ATR series for `bars` (oldest first). The first value corresponds
/// to `bars[period]`; returns an empty vec when there is not enough data or a
/// non-finite value appears.
pub fn atr_series(bars: &[Bar], period: usize) -> Vec<f64> {
    if period == 0 || bars.len() < period + 1 {
        return Vec::new();
    }

    let mut tr_values: Vec<f64> = Vec::with_capacity(bars.len() - 1);
    for i in 1..bars.len() {
        let high = bars[i].high;
        let low = bars[i].low;
        let prev_close = bars[i - 1].close;

        let hl = high - low;
        let hc = (high - prev_close).abs();
        let lc = (low - prev_close).abs();
        tr_values.push(hl.max(hc).max(lc));
    }

    let seed: f64 = tr_values[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return Vec::new();
    }

    let period_f = period as f64;
    let mut out = Vec::with_capacity(tr_values.len() - period + 1);
    out.push(seed);
    let mut prev = seed;
    for &tr in &tr_values[period..] {
        let next = (prev * (period_f - 1.0) + tr) / period_f;
        if !next.is_finite() {
            return Vec::new();
        }
        out.push(next);
        prev = next;
    }
    out
}

/// Most recent ATR value, or `None` with fewer than `period + 1` bars.
pub fn atr(bars: &[Bar], period: usize) -> Option<f64> {
    atr_series(bars, period).last().copied()
}
