// =============================================================================
// Position sizing — stop distance, pip values, Kelly cap
// =============================================================================
//
// Dollar-to-unit conversion deliberately ignores cross-currency effects; the
// constants below are the usual USD approximations.
// =============================================================================

use crate::symbols::{base_symbol, pip_size};

/// Pip value in USD per standard lot (100k units).
///
/// USD-quote majors: $10. Gold: $1 per $0.10 move per 100 units, i.e. $1000
/// per 100k units per pip. USD-base pairs: ~$10, ignoring conversion.
pub fn pip_value(symbol: &str) -> f64 {
    let s = base_symbol(symbol);
    if s.contains("XAU") || s.contains("GOLD") {
        return 1000.0;
    }
    match s.as_str() {
        "EURUSD" | "GBPUSD" | "AUDUSD" | "NZDUSD" => 10.0,
        "USDJPY" | "USDCHF" | "USDCAD" => 10.0,
        _ => 10.0,
    }
}

/// Units to trade so that a stop-out loses ~`equity_usd * risk_fraction`.
///
///   risk_usd      = equity * risk_fraction
///   distance_pips = max(0.1, |entry - sl| / pip)
///   per_unit_loss = distance_pips * pip_value / 100_000
///   units         = max(1, floor(risk_usd / per_unit_loss))
pub fn units_from_risk(
    symbol: &str,
    entry: f64,
    sl: f64,
    equity_usd: f64,
    risk_fraction: f64,
) -> i64 {
    let risk_usd = equity_usd * risk_fraction;

    let pip = pip_size(symbol);
    let mut distance_pips = (entry - sl).abs() / pip;
    if distance_pips < 0.1 {
        distance_pips = 0.1;
    }

    let mut per_unit_loss = distance_pips * pip_value(symbol) / 100_000.0;
    if per_unit_loss < 1e-9 {
        per_unit_loss = 1e-9;
    }

    let units = (risk_usd / per_unit_loss).floor() as i64;
    units.max(1)
}

/// Kelly fraction with a safety cap: `f* = (p*b - q) / b` clamped to
/// `[0, max_fraction]`. Helper only — the engine does not enable it.
pub fn kelly_cap(win_rate: f64, avg_win: f64, avg_loss: f64, max_fraction: f64) -> f64 {
    if avg_loss <= 0.0 {
        return 0.0;
    }
    let b = avg_win / avg_loss.max(1e-6);
    let p = win_rate;
    let q = 1.0 - win_rate;
    ((p * b - q) / b).clamp(0.0, max_fraction)
}
