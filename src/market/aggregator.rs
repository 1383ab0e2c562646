// =============================================================================
// Tick-to-bar cascade aggregation
// =============================================================================
//
// Two stacked builders: ticks feed a 1-minute builder whose completed bars
// feed a 5-minute builder as synthetic ticks (timestamp = the 1m bar's
// boundary, price = its close). Replay mode drives the same cascade with one
// synthetic tick per historical 1-minute close, so live and replay produce
// identical 5-minute bars from identical closes.
//
// A bar is emitted only when a tick lands in a *newer* interval; the bar for
// the final, still-open interval never emits on its own.
// =============================================================================

use chrono::{DateTime, Duration, DurationRound, Utc};

use crate::market::Bar;

/// Builds bars of a fixed minute interval from a price stream.
#[derive(Debug)]
pub struct BarAggregator {
    minutes: i64,
    current_start: Option<DateTime<Utc>>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: u64,
}

impl BarAggregator {
    pub fn new(minutes: i64) -> Self {
        Self {
            minutes,
            current_start: None,
            open: 0.0,
            high: 0.0,
            low: 0.0,
            close: 0.0,
            volume: 0,
        }
    }

    /// Floor a timestamp to this aggregator's interval boundary.
    fn align(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        ts.duration_trunc(Duration::minutes(self.minutes))
            .unwrap_or(ts)
    }

    /// Push one tick. Mid price preference: (bid+ask)/2 when both are
    /// present, then `last`, then whichever single side exists.
    ///
    /// Returns the previous bar when this tick opens a newer interval.
    pub fn push_tick(
        &mut self,
        ts: DateTime<Utc>,
        bid: Option<f64>,
        ask: Option<f64>,
        last: Option<f64>,
    ) -> Option<Bar> {
        let price = match (bid, ask, last) {
            (Some(b), Some(a), _) => (b + a) / 2.0,
            (_, _, Some(l)) => l,
            (Some(b), None, None) => b,
            (None, Some(a), None) => a,
            (None, None, None) => return None,
        };

        let bar_start = self.align(ts);

        let mut completed = None;
        if let Some(current) = self.current_start {
            if bar_start > current {
                completed = Some(Bar::new(
                    current, self.open, self.high, self.low, self.close, self.volume,
                ));
                self.current_start = None;
                self.volume = 0;
            }
        }

        match self.current_start {
            None => {
                self.current_start = Some(bar_start);
                self.open = price;
                self.high = price;
                self.low = price;
            }
            Some(_) => {
                self.high = self.high.max(price);
                self.low = self.low.min(price);
            }
        }
        self.close = price;
        self.volume += 1;

        completed
    }
}

/// 1-minute builder cascading into a 5-minute builder.
#[derive(Debug)]
pub struct CascadeAggregator {
    agg_1m: BarAggregator,
    agg_5m: BarAggregator,
}

impl Default for CascadeAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl CascadeAggregator {
    pub fn new() -> Self {
        Self {
            agg_1m: BarAggregator::new(1),
            agg_5m: BarAggregator::new(5),
        }
    }

    /// Push one tick through the cascade. Returns the 5-minute bars completed
    /// by this tick (0 or 1 in steady state), in timestamp order.
    pub fn push_tick(
        &mut self,
        ts: DateTime<Utc>,
        bid: Option<f64>,
        ask: Option<f64>,
        last: Option<f64>,
    ) -> Vec<Bar> {
        let mut bars_5m = Vec::new();

        if let Some(bar_1m) = self.agg_1m.push_tick(ts, bid, ask, last) {
            // The completed 1m bar acts as one synthetic tick at its own
            // boundary, priced at its close.
            if let Some(bar_5m) = self.agg_5m.push_tick(
                bar_1m.time,
                Some(bar_1m.close),
                Some(bar_1m.close),
                Some(bar_1m.close),
            ) {
                bars_5m.push(bar_5m);
            }
        }

        bars_5m
    }

    /// Replay entry point: one historical 1-minute bar close as a synthetic
    /// tick at the bar's timestamp.
    pub fn push_bar_close(&mut self, ts: DateTime<Utc>, close: f64) -> Vec<Bar> {
        self.push_tick(ts, None, None, Some(close))
    }
}

/// Resample 1-minute bars into 5-minute bars directly (warm-up path). OHLC is
/// first/max/min/last per bucket, volume is summed.
pub fn resample_5m(bars_1m: &[Bar]) -> Vec<Bar> {
    let mut out: Vec<Bar> = Vec::new();
    for b in bars_1m {
        let bucket = b
            .time
            .duration_trunc(Duration::minutes(5))
            .unwrap_or(b.time);
        match out.last_mut() {
            Some(last) if last.time == bucket => {
                last.high = last.high.max(b.high);
                last.low = last.low.min(b.low);
                last.close = b.close;
                last.volume += b.volume;
            }
            _ => out.push(Bar::new(bucket, b.open, b.high, b.low, b.close, b.volume)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 20, h, m, s).unwrap()
    }

    #[test]
    fn one_minute_alignment_floors() {
        let agg = BarAggregator::new(5);
        assert_eq!(agg.align(ts(9, 3, 37)), ts(9, 0, 0));
        assert_eq!(agg.align(ts(9, 5, 0)), ts(9, 5, 0));
        assert_eq!(agg.align(ts(9, 9, 59)), ts(9, 5, 0));
    }

    #[test]
    fn emits_on_interval_rollover() {
        let mut agg = BarAggregator::new(1);
        assert!(agg.push_tick(ts(9, 0, 10), None, None, Some(1.0)).is_none());
        assert!(agg.push_tick(ts(9, 0, 50), None, None, Some(2.0)).is_none());
        let bar = agg.push_tick(ts(9, 1, 2), None, None, Some(3.0)).unwrap();
        assert_eq!(bar.time, ts(9, 0, 0));
        assert_eq!(bar.open, 1.0);
        assert_eq!(bar.high, 2.0);
        assert_eq!(bar.low, 1.0);
        assert_eq!(bar.close, 2.0);
        assert_eq!(bar.volume, 2);
    }

    #[test]
    fn mid_price_preference() {
        let mut agg = BarAggregator::new(1);
        agg.push_tick(ts(9, 0, 0), Some(1.0), Some(1.2), Some(9.9));
        let bar = agg.push_tick(ts(9, 1, 0), None, None, Some(1.0)).unwrap();
        // (bid + ask) / 2 beats last.
        assert_eq!(bar.open, 1.1);
    }

    #[test]
    fn no_price_yields_nothing() {
        let mut agg = BarAggregator::new(1);
        assert!(agg.push_tick(ts(9, 0, 0), None, None, None).is_none());
        // The empty tick must not have seeded a bar.
        let done = agg.push_tick(ts(9, 1, 0), None, None, Some(1.0));
        assert!(done.is_none());
    }

    #[test]
    fn cascade_scenario_alignment() {
        // Ticks at 09:00:37, 09:01:02, 09:04:58, 09:05:03. The [09:00, 09:05)
        // bar completes on arrival of the 09:05:03 tick.
        let mut cascade = CascadeAggregator::new();
        assert!(cascade.push_tick(ts(9, 0, 37), None, None, Some(1.0950)).is_empty());
        assert!(cascade.push_tick(ts(9, 1, 2), None, None, Some(1.0951)).is_empty());
        assert!(cascade.push_tick(ts(9, 4, 58), None, None, Some(1.0947)).is_empty());
        let bars = cascade.push_tick(ts(9, 5, 3), None, None, Some(1.0952));
        assert_eq!(bars.len(), 1);
        let bar = &bars[0];
        assert_eq!(bar.time, ts(9, 0, 0));
        assert_eq!(bar.open, 1.0950);
        assert!(bar.high >= 1.0951);
        assert!(bar.low <= 1.0947);
        assert_eq!(bar.close, 1.0947);
    }

    #[test]
    fn cascade_matches_direct_resample() {
        // Feeding per-minute closes as synthetic ticks yields the same 5m
        // bars as resampling those closes directly.
        let closes = [
            1.10, 1.11, 1.09, 1.12, 1.13, // [09:00, 09:05)
            1.14, 1.15, 1.13, 1.12, 1.11, // [09:05, 09:10)
            1.10, // opens [09:10, ..) and flushes the second bucket
        ];
        let mut cascade = CascadeAggregator::new();
        let mut emitted = Vec::new();
        for (i, close) in closes.iter().enumerate() {
            let t = ts(9, i as u32, 0);
            emitted.extend(cascade.push_bar_close(t, *close));
        }

        let bars_1m: Vec<Bar> = closes
            .iter()
            .enumerate()
            .map(|(i, c)| Bar::new(ts(9, i as u32, 0), *c, *c, *c, *c, 1))
            .collect();
        let direct = resample_5m(&bars_1m[..10]);

        assert_eq!(emitted.len(), 2);
        assert_eq!(direct.len(), 2);
        for (a, b) in emitted.iter().zip(direct.iter()) {
            assert_eq!(a.time, b.time);
            assert_eq!(a.open, b.open);
            assert_eq!(a.high, b.high);
            assert_eq!(a.low, b.low);
            assert_eq!(a.close, b.close);
        }
    }

    #[test]
    fn bars_emit_in_timestamp_order() {
        let mut cascade = CascadeAggregator::new();
        let mut last_emitted: Option<DateTime<Utc>> = None;
        for i in 0..60 {
            let t = ts(9 + i / 60, i % 60, 0);
            for bar in cascade.push_bar_close(t, 1.1 + i as f64 * 0.0001) {
                if let Some(prev) = last_emitted {
                    assert!(bar.time > prev);
                }
                last_emitted = Some(bar.time);
            }
        }
        assert!(last_emitted.is_some());
    }

    #[test]
    fn resample_buckets_ohlcv() {
        let bars: Vec<Bar> = (0..10)
            .map(|i| {
                Bar::new(
                    ts(9, i, 0),
                    1.0 + i as f64,
                    2.0 + i as f64,
                    0.5 + i as f64,
                    1.5 + i as f64,
                    10,
                )
            })
            .collect();
        let out = resample_5m(&bars);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].time, ts(9, 0, 0));
        assert_eq!(out[0].open, 1.0);
        assert_eq!(out[0].high, 6.0);
        assert_eq!(out[0].low, 0.5);
        assert_eq!(out[0].close, 5.5);
        assert_eq!(out[0].volume, 50);
        assert_eq!(out[1].time, ts(9, 5, 0));
    }
}
