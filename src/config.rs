// =============================================================================
// Schedule configuration — profiles, risk blocks, strategy windows
// =============================================================================
//
// The schedule document holds named profiles (`portfolio`, `portfolio_ny`,
// ...) plus a sibling `strategies` list (`strategies_ny` for NY profiles).
// Every field carries a serde default so older documents keep loading.
//
// Spread precedence: the per-symbol `spreads` map wins; the flat
// `spread_pips` value is the fallback, and the symbol's built-in default
// covers everything else.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::sessions::SessionWindow;
use crate::symbols::default_spread;

fn default_interval() -> String {
    "5m".to_string()
}

fn default_source() -> String {
    "auto".to_string()
}

fn default_venue() -> String {
    "OANDA".to_string()
}

fn default_warmup_days() -> u32 {
    3
}

fn default_status_every_s() -> u64 {
    180
}

fn default_global_daily_stop_r() -> f64 {
    -5.0
}

fn default_max_open_positions() -> u32 {
    1
}

fn default_per_strategy_daily_trades() -> u32 {
    3
}

fn default_per_strategy_daily_stop_r() -> f64 {
    -2.0
}

fn default_per_strategy_daily_win_r() -> f64 {
    6.0
}

fn default_lookback_d() -> i64 {
    20
}

fn default_weight_floor() -> f64 {
    0.15
}

fn default_weight_cap() -> f64 {
    0.60
}

fn default_trailing_pct() -> f64 {
    5.0
}

fn default_cooloff_min() -> i64 {
    120
}

fn default_pad_m() -> i64 {
    30
}

/// Portfolio-level risk limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskCfg {
    #[serde(default = "default_global_daily_stop_r")]
    pub global_daily_stop_r: f64,
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: u32,
    #[serde(default = "default_per_strategy_daily_trades")]
    pub per_strategy_daily_trades: u32,
    #[serde(default = "default_per_strategy_daily_stop_r")]
    pub per_strategy_daily_stop_r: f64,
    #[serde(default = "default_per_strategy_daily_win_r")]
    pub per_strategy_daily_win_r: f64,
}

impl Default for RiskCfg {
    fn default() -> Self {
        serde_json::from_value(Value::Object(Default::default())).expect("defaults")
    }
}

/// Inverse-volatility allocation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskParityCfg {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_lookback_d")]
    pub lookback_d: i64,
    #[serde(default = "default_weight_floor")]
    pub floor: f64,
    #[serde(default = "default_weight_cap")]
    pub cap: f64,
}

impl Default for RiskParityCfg {
    fn default() -> Self {
        serde_json::from_value(Value::Object(Default::default())).expect("defaults")
    }
}

/// Trailing-drawdown lock settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdLockCfg {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_trailing_pct")]
    pub trailing_pct: f64,
    #[serde(default = "default_cooloff_min")]
    pub cooloff_min: i64,
}

impl Default for DdLockCfg {
    fn default() -> Self {
        serde_json::from_value(Value::Object(Default::default())).expect("defaults")
    }
}

/// News blackout settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsGuardCfg {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub csv_path: String,
    #[serde(default = "default_pad_m")]
    pub pad_before_m: i64,
    #[serde(default = "default_pad_m")]
    pub pad_after_m: i64,
}

impl Default for NewsGuardCfg {
    fn default() -> Self {
        serde_json::from_value(Value::Object(Default::default())).expect("defaults")
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ProfileCfg {
    #[serde(default)]
    symbols: Vec<String>,
    #[serde(default = "default_interval")]
    interval: String,
    #[serde(default = "default_source")]
    source: String,
    #[serde(default = "default_venue")]
    venue: String,
    #[serde(default)]
    spread_pips: Option<f64>,
    #[serde(default)]
    spreads: HashMap<String, f64>,
    #[serde(default = "default_warmup_days")]
    warmup_days: u32,
    #[serde(default = "default_status_every_s")]
    status_every_s: u64,
    #[serde(default)]
    risk: RiskCfg,
    #[serde(default)]
    risk_parity: RiskParityCfg,
    #[serde(default)]
    dd_lock: DdLockCfg,
    #[serde(default)]
    news_guard: NewsGuardCfg,
}

#[derive(Debug, Clone, Deserialize)]
struct StrategyRaw {
    name: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    windows: Vec<WindowRaw>,
}

#[derive(Debug, Clone, Deserialize)]
struct WindowRaw {
    start: String,
    end: String,
}

/// One configured strategy with its parsed windows.
#[derive(Debug, Clone)]
pub struct StrategyCfg {
    pub name: String,
    pub params: Value,
    pub windows: Vec<SessionWindow>,
}

/// The normalized, validated schedule the engine runs from.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub symbols: Vec<String>,
    pub interval: String,
    pub source: String,
    pub venue: String,
    pub spread_pips: Option<f64>,
    pub spreads: HashMap<String, f64>,
    pub warmup_days: u32,
    pub status_every_s: u64,
    pub risk: RiskCfg,
    pub risk_parity: RiskParityCfg,
    pub dd_lock: DdLockCfg,
    pub news_guard: NewsGuardCfg,
    pub strategies: Vec<StrategyCfg>,
}

impl Schedule {
    /// Effective spread for a symbol: per-symbol map, then the flat value,
    /// then the symbol's built-in default.
    pub fn spread_for(&self, symbol: &str) -> f64 {
        self.spreads
            .get(symbol)
            .copied()
            .or(self.spread_pips)
            .unwrap_or_else(|| default_spread(symbol))
    }

    pub fn strategy_names(&self) -> Vec<String> {
        self.strategies.iter().map(|s| s.name.clone()).collect()
    }
}

/// Load a schedule document and normalize the requested profile.
pub fn load_schedule(path: impl AsRef<Path>, profile: Option<&str>) -> Result<Schedule> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read schedule from {}", path.display()))?;
    let doc: Value = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse schedule from {}", path.display()))?;

    let schedule = normalize_schedule(&doc, profile)?;
    info!(
        path = %path.display(),
        symbols = ?schedule.symbols,
        strategies = ?schedule.strategy_names(),
        "schedule loaded"
    );
    Ok(schedule)
}

/// Pick the profile, resolve the strategies list, and validate.
pub fn normalize_schedule(doc: &Value, profile: Option<&str>) -> Result<Schedule> {
    let selected = pick_profile(doc, profile)?;
    let cfg: ProfileCfg =
        serde_json::from_value(selected.clone()).context("invalid profile block")?;

    // `portfolio_ny` pairs with `strategies_ny` when present.
    let strategies_key = match profile {
        Some(p) if p.ends_with("_ny") && doc.get("strategies_ny").is_some() => "strategies_ny",
        _ => "strategies",
    };
    let raw: Vec<StrategyRaw> = match doc.get(strategies_key) {
        Some(v) => serde_json::from_value(v.clone())
            .with_context(|| format!("invalid '{strategies_key}' list"))?,
        None => Vec::new(),
    };

    let mut strategies = Vec::with_capacity(raw.len());
    for s in raw {
        let mut windows = Vec::with_capacity(s.windows.len());
        for w in &s.windows {
            windows.push(
                SessionWindow::parse(&w.start, &w.end)
                    .with_context(|| format!("bad window for strategy '{}'", s.name))?,
            );
        }
        strategies.push(StrategyCfg {
            name: s.name,
            params: s.params,
            windows,
        });
    }

    if cfg.symbols.is_empty() {
        bail!("schedule has no symbols");
    }
    if strategies.is_empty() {
        bail!("schedule has no strategies");
    }

    Ok(Schedule {
        symbols: cfg.symbols,
        interval: cfg.interval,
        source: cfg.source,
        venue: cfg.venue,
        spread_pips: cfg.spread_pips,
        spreads: cfg.spreads,
        warmup_days: cfg.warmup_days,
        status_every_s: cfg.status_every_s,
        risk: cfg.risk,
        risk_parity: cfg.risk_parity,
        dd_lock: cfg.dd_lock,
        news_guard: cfg.news_guard,
        strategies,
    })
}

fn pick_profile<'a>(doc: &'a Value, profile: Option<&str>) -> Result<&'a Value> {
    if let Some(name) = profile {
        if let Some(p) = doc.get(name) {
            return Ok(p);
        }
    }
    if let Some(p) = doc.get("portfolio") {
        return Ok(p);
    }
    // Fall back to any object that looks like a profile.
    if let Some(obj) = doc.as_object() {
        for value in obj.values() {
            if value.get("symbols").is_some() {
                return Ok(value);
            }
        }
    }
    bail!(
        "no valid portfolio profile found (tried: {})",
        profile.unwrap_or("portfolio")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_doc() -> Value {
        json!({
            "portfolio": {
                "symbols": ["EURUSD", "GBPUSD", "XAUUSD"],
                "interval": "5m",
                "source": "auto",
                "venue": "OANDA",
                "warmup_days": 3,
                "status_every_s": 180,
                "spreads": { "EURUSD": 0.5 },
                "spread_pips": 0.7,
                "risk": { "global_daily_stop_r": -5.0, "max_open_positions": 2 },
                "risk_parity": { "enabled": true, "lookback_d": 10 },
                "dd_lock": { "enabled": true, "trailing_pct": 5.0, "cooloff_min": 120 },
                "news_guard": { "enabled": true, "csv_path": "data/news.csv" }
            },
            "portfolio_ny": {
                "symbols": ["EURUSD"]
            },
            "strategies": [
                {
                    "name": "ema_trend",
                    "params": { "fast": 9 },
                    "windows": [
                        { "start": "07:00", "end": "10:00" },
                        { "start": "12:30", "end": "16:00" }
                    ]
                }
            ],
            "strategies_ny": [
                {
                    "name": "bollinger_rev",
                    "windows": [ { "start": "12:30", "end": "16:00" } ]
                }
            ]
        })
    }

    #[test]
    fn normalizes_default_profile() {
        let s = normalize_schedule(&sample_doc(), None).unwrap();
        assert_eq!(s.symbols.len(), 3);
        assert_eq!(s.strategies.len(), 1);
        assert_eq!(s.strategies[0].name, "ema_trend");
        assert_eq!(s.strategies[0].windows.len(), 2);
        assert_eq!(s.risk.max_open_positions, 2);
        // Unset risk fields come from defaults.
        assert_eq!(s.risk.per_strategy_daily_trades, 3);
        assert!((s.risk.per_strategy_daily_stop_r + 2.0).abs() < 1e-9);
    }

    #[test]
    fn ny_profile_uses_ny_strategies() {
        let s = normalize_schedule(&sample_doc(), Some("portfolio_ny")).unwrap();
        assert_eq!(s.symbols, vec!["EURUSD"]);
        assert_eq!(s.strategies[0].name, "bollinger_rev");
    }

    #[test]
    fn spread_precedence_map_then_flat_then_builtin() {
        let s = normalize_schedule(&sample_doc(), None).unwrap();
        assert!((s.spread_for("EURUSD") - 0.5).abs() < 1e-9); // per-symbol map
        assert!((s.spread_for("GBPUSD") - 0.7).abs() < 1e-9); // flat value

        let mut doc = sample_doc();
        doc["portfolio"]
            .as_object_mut()
            .unwrap()
            .remove("spread_pips");
        doc["portfolio"]
            .as_object_mut()
            .unwrap()
            .remove("spreads");
        let s = normalize_schedule(&doc, None).unwrap();
        assert!((s.spread_for("XAUUSD") - 2.5).abs() < 1e-9); // built-in default
    }

    #[test]
    fn empty_symbols_is_fatal() {
        let doc = json!({
            "portfolio": { "symbols": [] },
            "strategies": [ { "name": "ema_trend", "windows": [] } ]
        });
        assert!(normalize_schedule(&doc, None).is_err());
    }

    #[test]
    fn empty_strategies_is_fatal() {
        let doc = json!({
            "portfolio": { "symbols": ["EURUSD"] },
            "strategies": []
        });
        assert!(normalize_schedule(&doc, None).is_err());
    }

    #[test]
    fn missing_profile_is_fatal() {
        let doc = json!({ "other": 1 });
        assert!(normalize_schedule(&doc, None).is_err());
    }

    #[test]
    fn profile_detected_by_symbols_key() {
        let doc = json!({
            "london_only": {
                "symbols": ["EURUSD"]
            },
            "strategies": [ { "name": "ema_trend", "windows": [ { "start": "07:00", "end": "10:00" } ] } ]
        });
        let s = normalize_schedule(&doc, None).unwrap();
        assert_eq!(s.symbols, vec!["EURUSD"]);
    }

    #[test]
    fn defaults_fill_unset_blocks() {
        let doc = json!({
            "portfolio": { "symbols": ["EURUSD"] },
            "strategies": [ { "name": "ema_trend", "windows": [ { "start": "07:00", "end": "10:00" } ] } ]
        });
        let s = normalize_schedule(&doc, None).unwrap();
        assert_eq!(s.interval, "5m");
        assert_eq!(s.source, "auto");
        assert_eq!(s.venue, "OANDA");
        assert_eq!(s.warmup_days, 3);
        assert_eq!(s.status_every_s, 180);
        assert!(!s.risk_parity.enabled);
        assert!(!s.dd_lock.enabled);
        assert!(!s.news_guard.enabled);
        assert_eq!(s.dd_lock.cooloff_min, 120);
    }
}
