// =============================================================================
// Status record — one-line portfolio snapshot between fixed sentinels
// =============================================================================
//
// The record is a single JSON line framed by begin/end markers so an
// operator (or a log scraper) can cut it out of mixed output. The same line
// is appended to a daily jsonl file. Timestamps are RFC 3339 UTC.
// =============================================================================

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use chrono::Utc;
use serde::Serialize;
use tracing::warn;

use crate::broker::BrokerStats;
use crate::market::feed::FeedStats;
use crate::reconcile::ReconcileSummary;
use crate::types::Side;

pub const STATUS_BEGIN: &str = "###BEGIN-AXFL-LIVE-PORT###";
pub const STATUS_END: &str = "###END-AXFL-LIVE-PORT###";

#[derive(Debug, Clone, Serialize)]
pub struct EngineRosterEntry {
    pub symbol: String,
    pub strategy: String,
    pub windows: Vec<String>,
    pub active: bool,
    pub spread_pips: f64,
    pub live_overrides: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenPositionView {
    pub symbol: String,
    pub strategy: String,
    pub side: Side,
    pub entry: f64,
    pub sl: f64,
    pub tp: Option<f64>,
    pub size: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StrategyStats {
    pub name: String,
    pub r: f64,
    pub trades: usize,
    pub pnl: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TodayStats {
    pub r_total: f64,
    pub pnl_total: f64,
    pub by_strategy: Vec<StrategyStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskView {
    pub halted: bool,
    pub global_daily_stop_r: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetsView {
    pub equity_usd: f64,
    pub daily_r_total: f64,
    pub per_trade_r: f64,
    pub per_strategy: BTreeMap<String, f64>,
    pub daily_r_used: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewsGuardView {
    pub enabled: bool,
    pub blocked_entries: u64,
    pub active_windows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DdLockView {
    pub enabled: bool,
    pub active: bool,
    pub dd_pct: f64,
    pub peak_equity: f64,
    pub threshold_pct: f64,
    pub cooloff_min: i64,
    pub since: Option<String>,
    pub cooloff_until: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JournalView {
    pub enabled: bool,
    pub mapped: u64,
    pub unmapped: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GateCounters {
    pub news_blocked_entries: u64,
    pub budget_blocked_entries: u64,
    pub risk_blocked_entries: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CostsView {
    pub spreads: BTreeMap<String, f64>,
    pub slippage_model: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrokerView {
    pub mirror: String,
    pub connected: bool,
    pub errors: u32,
    pub env: Option<String>,
}

impl BrokerView {
    pub fn none() -> Self {
        Self {
            mirror: "none".to_string(),
            connected: false,
            errors: 0,
            env: None,
        }
    }

    pub fn from_stats(stats: &BrokerStats) -> Self {
        Self {
            mirror: "oanda".to_string(),
            connected: stats.connected,
            errors: stats.errors,
            env: Some(stats.env.clone()),
        }
    }
}

/// The full snapshot. Field set mirrors what the engine knows at emit time.
#[derive(Debug, Clone, Serialize)]
pub struct StatusRecord {
    pub ok: bool,
    pub mode: String,
    pub source: String,
    pub interval: String,
    pub since: Option<String>,
    pub now: Option<String>,
    pub symbols: Vec<String>,
    pub engines: Vec<EngineRosterEntry>,
    pub positions: Vec<OpenPositionView>,
    pub today: TodayStats,
    pub risk: RiskView,
    pub budgets: BudgetsView,
    pub weights: BTreeMap<String, f64>,
    pub volatilities_pips: BTreeMap<String, f64>,
    pub news_guard: NewsGuardView,
    pub gates: GateCounters,
    pub dd_lock: DdLockView,
    pub journal: JournalView,
    pub reconcile: Option<ReconcileSummary>,
    pub costs: CostsView,
    pub broker: BrokerView,
    pub ws: Option<FeedStats>,
}

/// Print the sentinel-framed record and append it to the daily log file.
pub fn emit(record: &StatusRecord, logs_dir: &Path) {
    let line = match serde_json::to_string(record) {
        Ok(line) => line,
        Err(e) => {
            warn!(error = %e, "status record serialization failed");
            return;
        }
    };

    println!("\n{STATUS_BEGIN}");
    println!("{line}");
    println!("{STATUS_END}\n");

    if let Err(e) = append_daily_log(&line, logs_dir) {
        warn!(error = %e, "status log append failed");
    }
}

fn append_daily_log(line: &str, logs_dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(logs_dir)?;
    let file = logs_dir.join(format!("portfolio_live_{}.jsonl", Utc::now().format("%Y%m%d")));
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(file)?;
    writeln!(f, "{line}")
}
