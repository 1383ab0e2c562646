// =============================================================================
// Strategy seam — signal intents, parameter resolution, registry
// =============================================================================
//
// Strategies are opaque collaborators: they consume the prepared bar window
// and emit open intents. The engine takes the first admissible intent per
// bar; everything else (sizing, gating, costs, exits) belongs to the engine.
// =============================================================================

use anyhow::{bail, Result};
use serde_json::{Map, Value};

use crate::market::Bar;
use crate::strategies::{bollinger_rev::BollingerRev, ema_trend::EmaTrend};
use crate::types::Side;

/// An open request emitted by a strategy for one bar.
#[derive(Debug, Clone)]
pub struct SignalIntent {
    pub side: Side,
    /// Entry price, typically the bar close.
    pub price: f64,
    /// Stop-loss price; sizing is impossible without it.
    pub sl: f64,
    pub tp: Option<f64>,
    /// Opaque annotation carried onto the position and trade log.
    pub notes: String,
}

/// A trading strategy over a prepared 5-minute window.
pub trait Strategy: Send {
    fn name(&self) -> &'static str;

    /// Stateless strategies have `prepare` re-run after every appended bar;
    /// session-stateful ones are prepared once at warm-up.
    fn stateless(&self) -> bool {
        true
    }

    /// Refresh derived series over the full window.
    fn prepare(&mut self, bars: &[Bar]);

    /// Intents for the bar at `index`. At most a handful per bar.
    fn signals(&self, index: usize, bars: &[Bar]) -> Vec<SignalIntent>;
}

pub type Params = Map<String, Value>;

// ---------------------------------------------------------------------------
// Parameter resolution
// ---------------------------------------------------------------------------

/// Tuned defaults from walk-forward runs, keyed by
/// (strategy, symbol, interval).
fn tuned_defaults(strategy: &str, symbol: &str, interval: &str) -> Params {
    let mut out = Params::new();
    match (strategy, symbol, interval) {
        ("ema_trend", "EURUSD", "5m") => {
            out.insert("fast".into(), 12.into());
            out.insert("slow".into(), 26.into());
        }
        ("bollinger_rev", "GBPUSD", "5m") => {
            out.insert("period".into(), 20.into());
            out.insert("num_std".into(), Value::from(2.5));
        }
        _ => {}
    }
    out
}

/// Overlay user parameters on the tuned defaults; user values win.
pub fn resolve_params(
    user: Option<&Value>,
    strategy: &str,
    symbol: &str,
    interval: &str,
) -> Params {
    let mut params = tuned_defaults(
        strategy,
        &crate::symbols::base_symbol(symbol),
        interval,
    );
    if let Some(Value::Object(user)) = user {
        for (k, v) in user {
            params.insert(k.clone(), v.clone());
        }
    }
    params
}

pub fn param_f64(params: &Params, key: &str, default: f64) -> f64 {
    params.get(key).and_then(Value::as_f64).unwrap_or(default)
}

pub fn param_usize(params: &Params, key: &str, default: usize) -> usize {
    params
        .get(key)
        .and_then(Value::as_u64)
        .map(|v| v as usize)
        .unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Build a strategy by its configured name.
pub fn build_strategy(name: &str, params: &Params) -> Result<Box<dyn Strategy>> {
    match name {
        "ema_trend" => Ok(Box::new(EmaTrend::from_params(params))),
        "bollinger_rev" => Ok(Box::new(BollingerRev::from_params(params))),
        other => bail!("unknown strategy: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_overlaid_by_user_params() {
        let user = json!({ "fast": 8 });
        let p = resolve_params(Some(&user), "ema_trend", "EURUSD", "5m");
        assert_eq!(param_usize(&p, "fast", 0), 8); // user wins
        assert_eq!(param_usize(&p, "slow", 0), 26); // default survives
    }

    #[test]
    fn no_defaults_for_unknown_combo() {
        let p = resolve_params(None, "ema_trend", "USDJPY", "5m");
        assert!(p.is_empty());
    }

    #[test]
    fn symbol_normalized_before_lookup() {
        let p = resolve_params(None, "ema_trend", "OANDA:EUR_USD", "5m");
        assert_eq!(param_usize(&p, "fast", 0), 12);
    }

    #[test]
    fn registry_builds_known_strategies() {
        let p = Params::new();
        assert!(build_strategy("ema_trend", &p).is_ok());
        assert!(build_strategy("bollinger_rev", &p).is_ok());
        assert!(build_strategy("orb", &p).is_err());
    }
}
