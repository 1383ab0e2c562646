// =============================================================================
// EMA trend strategy — fast/slow cross with ATR-scaled stops
// =============================================================================
//
// Long when the fast EMA crosses above the slow EMA, short on the mirror
// cross. Stop = close -/+ sl_atr_mult * ATR14, target = close +/- tp_atr_mult
// * ATR14. Stateless over indicators: the series are rebuilt on every bar.
// =============================================================================

use crate::indicators::{atr_series, ema_series};
use crate::market::Bar;
use crate::strategy::{param_f64, param_usize, Params, SignalIntent, Strategy};
use crate::types::Side;

const ATR_PERIOD: usize = 14;

pub struct EmaTrend {
    fast_period: usize,
    slow_period: usize,
    sl_atr_mult: f64,
    tp_atr_mult: f64,
    fast: Vec<f64>,
    slow: Vec<f64>,
    atr: Vec<f64>,
}

impl EmaTrend {
    pub fn from_params(params: &Params) -> Self {
        Self {
            fast_period: param_usize(params, "fast", 12),
            slow_period: param_usize(params, "slow", 26),
            sl_atr_mult: param_f64(params, "sl_atr_mult", 1.5),
            tp_atr_mult: param_f64(params, "tp_atr_mult", 2.5),
            fast: Vec::new(),
            slow: Vec::new(),
            atr: Vec::new(),
        }
    }

    // Series are stored compact; map a bar index onto each one.
    fn fast_at(&self, i: usize) -> Option<f64> {
        i.checked_sub(self.fast_period - 1)
            .and_then(|j| self.fast.get(j))
            .copied()
    }

    fn slow_at(&self, i: usize) -> Option<f64> {
        i.checked_sub(self.slow_period - 1)
            .and_then(|j| self.slow.get(j))
            .copied()
    }

    fn atr_at(&self, i: usize) -> Option<f64> {
        i.checked_sub(ATR_PERIOD)
            .and_then(|j| self.atr.get(j))
            .copied()
    }
}

impl Strategy for EmaTrend {
    fn name(&self) -> &'static str {
        "ema_trend"
    }

    fn prepare(&mut self, bars: &[Bar]) {
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        self.fast = ema_series(&closes, self.fast_period);
        self.slow = ema_series(&closes, self.slow_period);
        self.atr = atr_series(bars, ATR_PERIOD);
    }

    fn signals(&self, index: usize, bars: &[Bar]) -> Vec<SignalIntent> {
        if index == 0 || index >= bars.len() {
            return Vec::new();
        }
        let (Some(f_now), Some(s_now), Some(f_prev), Some(s_prev), Some(atr)) = (
            self.fast_at(index),
            self.slow_at(index),
            self.fast_at(index - 1),
            self.slow_at(index - 1),
            self.atr_at(index),
        ) else {
            return Vec::new();
        };

        let close = bars[index].close;
        let mut out = Vec::new();

        if f_prev <= s_prev && f_now > s_now {
            out.push(SignalIntent {
                side: Side::Long,
                price: close,
                sl: close - self.sl_atr_mult * atr,
                tp: Some(close + self.tp_atr_mult * atr),
                notes: format!("ema{}x{} cross up", self.fast_period, self.slow_period),
            });
        } else if f_prev >= s_prev && f_now < s_now {
            out.push(SignalIntent {
                side: Side::Short,
                price: close,
                sl: close + self.sl_atr_mult * atr,
                tp: Some(close - self.tp_atr_mult * atr),
                notes: format!("ema{}x{} cross down", self.fast_period, self.slow_period),
            });
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn bars_from_closes(closes: &[f64]) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2025, 10, 20, 7, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| {
                Bar::new(
                    start + Duration::minutes(5 * i as i64),
                    *c,
                    c + 0.0002,
                    c - 0.0002,
                    *c,
                    1,
                )
            })
            .collect()
    }

    /// Downtrend long enough to seed the EMAs, then a sharp reversal up.
    fn v_shape() -> Vec<f64> {
        let mut closes: Vec<f64> = (0..40).map(|i| 1.10 - i as f64 * 0.0005).collect();
        closes.extend((0..20).map(|i| 1.08 + i as f64 * 0.0020));
        closes
    }

    #[test]
    fn no_signals_before_warmup() {
        let bars = bars_from_closes(&[1.1; 10]);
        let mut strat = EmaTrend::from_params(&Params::new());
        strat.prepare(&bars);
        assert!(strat.signals(9, &bars).is_empty());
    }

    #[test]
    fn reversal_produces_one_long_cross() {
        let bars = bars_from_closes(&v_shape());
        let mut strat = EmaTrend::from_params(&Params::new());
        strat.prepare(&bars);

        let mut longs = 0;
        for i in 1..bars.len() {
            for intent in strat.signals(i, &bars) {
                assert_eq!(intent.side, Side::Long);
                assert!(intent.sl < intent.price);
                assert!(intent.tp.unwrap() > intent.price);
                longs += 1;
            }
        }
        assert_eq!(longs, 1, "exactly one cross expected");
    }

    #[test]
    fn stop_distance_scales_with_atr_mult() {
        let bars = bars_from_closes(&v_shape());
        let mut user = Params::new();
        user.insert("sl_atr_mult".into(), serde_json::Value::from(3.0));
        let mut wide = EmaTrend::from_params(&user);
        let mut narrow = EmaTrend::from_params(&Params::new());
        wide.prepare(&bars);
        narrow.prepare(&bars);

        for i in 1..bars.len() {
            let w = wide.signals(i, &bars);
            let n = narrow.signals(i, &bars);
            if let (Some(w), Some(n)) = (w.first(), n.first()) {
                assert!((w.price - w.sl).abs() > (n.price - n.sl).abs());
            }
        }
    }

    #[test]
    fn flat_market_stays_quiet() {
        let bars = bars_from_closes(&[1.1; 80]);
        let mut strat = EmaTrend::from_params(&Params::new());
        strat.prepare(&bars);
        for i in 1..bars.len() {
            assert!(strat.signals(i, &bars).is_empty());
        }
    }
}
