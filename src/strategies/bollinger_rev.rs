// =============================================================================
// Bollinger mean-reversion strategy — band touch, target at the middle band
// =============================================================================
//
// A close below the lower band proposes a long back to the middle band; a
// close above the upper band mirrors it short. Stops are ATR-scaled beyond
// the touched band.
// =============================================================================

use crate::indicators::{atr, bollinger};
use crate::market::Bar;
use crate::strategy::{param_f64, param_usize, Params, SignalIntent, Strategy};
use crate::types::Side;

const ATR_PERIOD: usize = 14;

pub struct BollingerRev {
    period: usize,
    num_std: f64,
    sl_atr_mult: f64,
}

impl BollingerRev {
    pub fn from_params(params: &Params) -> Self {
        Self {
            period: param_usize(params, "period", 20),
            num_std: param_f64(params, "num_std", 2.0),
            sl_atr_mult: param_f64(params, "sl_atr_mult", 1.5),
        }
    }
}

impl Strategy for BollingerRev {
    fn name(&self) -> &'static str {
        "bollinger_rev"
    }

    fn prepare(&mut self, _bars: &[Bar]) {
        // Bands are computed per signal over the trailing window.
    }

    fn signals(&self, index: usize, bars: &[Bar]) -> Vec<SignalIntent> {
        if index >= bars.len() {
            return Vec::new();
        }
        let window = &bars[..=index];
        let closes: Vec<f64> = window.iter().map(|b| b.close).collect();

        let Some(bands) = bollinger(&closes, self.period, self.num_std) else {
            return Vec::new();
        };
        let Some(atr) = atr(window, ATR_PERIOD) else {
            return Vec::new();
        };

        let close = bars[index].close;
        let mut out = Vec::new();

        if close < bands.lower {
            out.push(SignalIntent {
                side: Side::Long,
                price: close,
                sl: close - self.sl_atr_mult * atr,
                tp: Some(bands.middle),
                notes: format!("bb{} lower touch", self.period),
            });
        } else if close > bands.upper {
            out.push(SignalIntent {
                side: Side::Short,
                price: close,
                sl: close + self.sl_atr_mult * atr,
                tp: Some(bands.middle),
                notes: format!("bb{} upper touch", self.period),
            });
        }

        out
    }
}
