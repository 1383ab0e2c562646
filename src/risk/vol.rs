// =============================================================================
// Realized volatility and inverse-volatility allocation
// =============================================================================
//
// Volatility is the mean 14-bar ATR in pips over a lookback window of
// 5-minute bars, filtered to active session hours (07:00-16:00 UTC — the
// union of London and New York). Weights are proportional to 1/vol, clamped
// to [floor, cap] and renormalized to sum to 1.
// =============================================================================

use std::collections::HashMap;

use chrono::{Duration, Timelike};
use tracing::warn;

use crate::indicators::atr_series;
use crate::market::Bar;
use crate::symbols::pip_size;

const SESSION_START_HOUR: u32 = 7;
const SESSION_END_HOUR: u32 = 16;
const ATR_PERIOD: usize = 14;

/// Conservative volatility assumed for symbols with no usable history.
const DEFAULT_VOL_PIPS: f64 = 10.0;

/// Mean ATR in pips over the last `lookback_d` days of `bars`, session-hours
/// filtered. Returns 0.0 when there is no usable data.
pub fn realized_vol_pips(bars: &[Bar], lookback_d: i64, pip: f64) -> f64 {
    if bars.is_empty() || pip <= 0.0 {
        return 0.0;
    }

    let cutoff = match bars.last() {
        Some(last) => last.time - Duration::days(lookback_d),
        None => return 0.0,
    };
    let recent: Vec<Bar> = bars.iter().filter(|b| b.time >= cutoff).cloned().collect();
    if recent.is_empty() {
        return 0.0;
    }

    let session: Vec<Bar> = recent
        .iter()
        .filter(|b| {
            let h = b.time.hour();
            (SESSION_START_HOUR..SESSION_END_HOUR).contains(&h)
        })
        .cloned()
        .collect();

    // Fall back to the full day when the session filter leaves too little.
    let sample = if session.len() < ATR_PERIOD + 1 {
        &recent
    } else {
        &session
    };

    let series = atr_series(sample, ATR_PERIOD);
    if series.is_empty() {
        return 0.0;
    }
    let mean_atr = series.iter().sum::<f64>() / series.len() as f64;

    mean_atr / pip
}

/// Inverse-volatility weights over `symbols`, clamped and renormalized.
///
/// Returns `(weights, vols)`; vols are diagnostics in pips. Symbols without
/// data fall back to a conservative default volatility; if every weight
/// degenerates the result is the equal split.
pub fn inv_vol_weights(
    symbols: &[String],
    data_map: &HashMap<String, Vec<Bar>>,
    lookback_d: i64,
    floor: f64,
    cap: f64,
) -> (HashMap<String, f64>, HashMap<String, f64>) {
    let mut vols = HashMap::new();
    for symbol in symbols {
        let vol = match data_map.get(symbol) {
            Some(bars) if !bars.is_empty() => {
                let v = realized_vol_pips(bars, lookback_d, pip_size(symbol));
                // Floor avoids a division blow-up on dead series.
                v.max(0.1)
            }
            _ => {
                warn!(symbol = %symbol, "no volatility data, using default");
                DEFAULT_VOL_PIPS
            }
        };
        vols.insert(symbol.clone(), vol);
    }

    let mut clamped = HashMap::new();
    for symbol in symbols {
        let raw = 1.0 / vols[symbol];
        clamped.insert(symbol.clone(), raw.clamp(floor, cap));
    }

    let total: f64 = clamped.values().sum();
    let weights = if total > 0.0 {
        clamped
            .into_iter()
            .map(|(s, w)| (s, w / total))
            .collect()
    } else {
        equal_weights(symbols)
    };

    (weights, vols)
}

/// The 1/N fallback used when risk-parity is disabled or fails outright.
pub fn equal_weights(symbols: &[String]) -> HashMap<String, f64> {
    let n = symbols.len().max(1) as f64;
    symbols.iter().map(|s| (s.clone(), 1.0 / n)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn bar_at(t: DateTime<Utc>, range: f64) -> Bar {
        let mid = 1.1000;
        Bar::new(t, mid, mid + range / 2.0, mid - range / 2.0, mid, 1)
    }

    /// A day of 5m session-hour bars with a constant high-low range.
    fn day_of_bars(day: u32, range: f64) -> Vec<Bar> {
        let mut out = Vec::new();
        for h in SESSION_START_HOUR..SESSION_END_HOUR {
            for m in (0..60).step_by(5) {
                let t = Utc.with_ymd_and_hms(2025, 10, day, h, m, 0).unwrap();
                out.push(bar_at(t, range));
            }
        }
        out
    }

    #[test]
    fn vol_reflects_bar_range() {
        let bars = day_of_bars(20, 0.0010); // 10-pip range
        let vol = realized_vol_pips(&bars, 20, 0.0001);
        assert!((vol - 10.0).abs() < 1.0, "expected ~10 pips, got {vol}");
    }

    #[test]
    fn vol_empty_is_zero() {
        assert_eq!(realized_vol_pips(&[], 20, 0.0001), 0.0);
    }

    #[test]
    fn weights_sum_to_one_and_favor_low_vol() {
        let symbols = vec!["EURUSD".to_string(), "GBPUSD".to_string()];
        let mut data = HashMap::new();
        data.insert("EURUSD".to_string(), day_of_bars(20, 0.0010)); // ~10 pips
        data.insert("GBPUSD".to_string(), day_of_bars(20, 0.0030)); // ~30 pips
        let (weights, vols) = inv_vol_weights(&symbols, &data, 20, 0.0, 1.0);

        let sum: f64 = weights.values().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert!(weights["EURUSD"] > weights["GBPUSD"]);
        assert!(vols["GBPUSD"] > vols["EURUSD"]);
    }

    #[test]
    fn missing_data_uses_default_vol() {
        let symbols = vec!["EURUSD".to_string(), "XAUUSD".to_string()];
        let mut data = HashMap::new();
        data.insert("EURUSD".to_string(), day_of_bars(20, 0.0010));
        let (weights, vols) = inv_vol_weights(&symbols, &data, 20, 0.15, 0.60);
        assert_eq!(vols["XAUUSD"], DEFAULT_VOL_PIPS);
        let sum: f64 = weights.values().sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn clamping_applies_before_normalization() {
        let symbols = vec!["EURUSD".to_string(), "GBPUSD".to_string()];
        let mut data = HashMap::new();
        // Extremely quiet vs extremely loud: raw weights far apart.
        data.insert("EURUSD".to_string(), day_of_bars(20, 0.00002));
        data.insert("GBPUSD".to_string(), day_of_bars(20, 0.0100));
        let (weights, _) = inv_vol_weights(&symbols, &data, 20, 0.15, 0.60);
        // Both clamped to [0.15, 0.60] then normalized -> 0.8 and 0.2.
        assert!((weights["EURUSD"] - 0.8).abs() < 1e-9);
        assert!((weights["GBPUSD"] - 0.2).abs() < 1e-9);
    }

    #[test]
    fn equal_weights_fallback() {
        let symbols = vec![
            "EURUSD".to_string(),
            "GBPUSD".to_string(),
            "XAUUSD".to_string(),
        ];
        let w = equal_weights(&symbols);
        for v in w.values() {
            assert!((v - 1.0 / 3.0).abs() < 1e-9);
        }
    }
}
