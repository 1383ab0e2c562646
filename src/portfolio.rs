// =============================================================================
// Portfolio engine — bar dispatch, layered gates, mirroring, global risk
// =============================================================================
//
// The engine owns every sub-engine, the per-symbol cascade aggregators, the
// risk state, and references to the journal, broker, and notifier. It runs
// as a single logical dispatcher: all sub-engine mutation, journal writes,
// and broker calls happen on this task, in schedule order, one bar at a
// time. The WS reader only ever touches the shared tick buffer.
//
// Gate order for a new entry is fixed: session window, halt/DD lock, news
// blackout, strategy dollar budget, per-strategy day limits, global open-
// position cap. The first failing gate records its counter; none of them
// raise. SL/TP/TIME handling runs before any gating so open positions close
// deterministically.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Schedule;
use crate::journal::{AxflTradeRec, BrokerOrderRec, Journal};
use crate::market::aggregator::{resample_5m, CascadeAggregator};
use crate::market::feed::{self, FeedState, DEFAULT_BUFFER_CAPACITY};
use crate::market::history::HistoryProvider;
use crate::market::Bar;
use crate::news::{self, EventWindow, NewsEvent};
use crate::notify::Notifier;
use crate::reconcile::{ReconcileSummary, Reconciler};
use crate::risk::budgets::{compute_budgets, Budgets};
use crate::risk::daily::RiskRules;
use crate::risk::sizing::units_from_risk;
use crate::risk::vol::{equal_weights, inv_vol_weights};
use crate::sessions::{in_any_window, is_weekend};
use crate::status::{self, StatusRecord};
use crate::strategy::{build_strategy, resolve_params};
use crate::subengine::{CompletedTrade, SubEngine};
use crate::broker::OandaClient;

const STARTING_EQUITY_USD: f64 = 100_000.0;
const NEWS_LOOKAHEAD_H: i64 = 4;
const REPLAY_STATUS_EVERY_S: u64 = 5;
const REPLAY_PACING_MS: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Replay,
    Ws,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Replay => write!(f, "replay"),
            Self::Ws => write!(f, "ws"),
        }
    }
}

pub struct PortfolioEngine {
    schedule: Schedule,
    mode: Mode,
    journal: Arc<Journal>,
    broker: Option<Arc<OandaClient>>,
    notifier: Notifier,
    shutdown: Arc<AtomicBool>,

    engines: Vec<SubEngine>,
    aggregators: HashMap<String, CascadeAggregator>,
    weights: HashMap<String, f64>,
    symbol_vols: HashMap<String, f64>,
    budgets: Budgets,

    equity_usd: f64,
    peak_equity: f64,
    current_dd_pct: f64,
    halted: bool,
    dd_lock_active: bool,
    dd_lock_since: Option<DateTime<Utc>>,
    dd_lock_cooloff_until: Option<DateTime<Utc>>,

    daily_r_used: HashMap<String, f64>,
    current_date: Option<NaiveDate>,
    first_trade_today: bool,

    news_events: Vec<NewsEvent>,
    news_windows: Vec<EventWindow>,
    news_enabled: bool,
    news_blocked_entries: u64,
    budget_blocked_entries: u64,
    risk_blocked_entries: u64,

    mapped_trades: u64,
    unmapped_trades: u64,
    reconcile_summary: Option<ReconcileSummary>,

    first_bar_time: Option<DateTime<Utc>>,
    last_bar_time: Option<DateTime<Utc>>,
    last_tick_time: Option<DateTime<Utc>>,
    actual_source: Option<String>,

    feed: Option<Arc<FeedState>>,
    logs_dir: PathBuf,
}

impl PortfolioEngine {
    pub fn new(
        schedule: Schedule,
        mode: Mode,
        journal: Arc<Journal>,
        broker: Option<Arc<OandaClient>>,
        notifier: Notifier,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let budgets = compute_budgets(
            &schedule.strategy_names(),
            STARTING_EQUITY_USD,
            crate::risk::budgets::DEFAULT_DAILY_RISK_FRACTION,
            crate::risk::budgets::DEFAULT_PER_TRADE_FRACTION,
        );
        let daily_r_used = schedule
            .strategy_names()
            .into_iter()
            .map(|s| (s, 0.0))
            .collect();

        Self {
            news_enabled: schedule.news_guard.enabled,
            schedule,
            mode,
            journal,
            broker,
            notifier,
            shutdown,
            engines: Vec::new(),
            aggregators: HashMap::new(),
            weights: HashMap::new(),
            symbol_vols: HashMap::new(),
            equity_usd: budgets.equity_usd,
            peak_equity: budgets.equity_usd,
            budgets,
            current_dd_pct: 0.0,
            halted: false,
            dd_lock_active: false,
            dd_lock_since: None,
            dd_lock_cooloff_until: None,
            daily_r_used,
            current_date: None,
            first_trade_today: true,
            news_events: Vec::new(),
            news_windows: Vec::new(),
            news_blocked_entries: 0,
            budget_blocked_entries: 0,
            risk_blocked_entries: 0,
            mapped_trades: 0,
            unmapped_trades: 0,
            reconcile_summary: None,
            first_bar_time: None,
            last_bar_time: None,
            last_tick_time: None,
            actual_source: None,
            feed: None,
            logs_dir: PathBuf::from("logs"),
        }
    }

    fn log_event(&self, level: &str, kind: &str, payload: serde_json::Value) {
        if let Err(e) = self.journal.log_event(level, kind, payload) {
            warn!(error = %e, kind, "journal event write failed");
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub async fn run(&mut self) -> Result<()> {
        self.notifier.info(
            "ENGINE_START",
            json!({ "mode": self.mode.to_string(), "symbols": self.schedule.symbols }),
        );

        // Reconcile before the first dispatch iteration.
        if let Some(broker) = self.broker.clone() {
            broker.ping_auth().await;
            let reconciler = Reconciler::new(&broker, &self.journal, true);
            self.reconcile_summary = Some(reconciler.run().await);
        }

        self.warmup().await?;

        let result = match self.mode {
            Mode::Replay => self.run_replay().await,
            Mode::Ws => self.run_ws().await,
        };

        self.emit_status();
        self.notifier.info("ENGINE_STOP", json!({ "mode": self.mode.to_string() }));
        result
    }

    // =========================================================================
    // Warm-up
    // =========================================================================

    async fn warmup(&mut self) -> Result<()> {
        info!(
            symbols = ?self.schedule.symbols,
            warmup_days = self.schedule.warmup_days,
            "portfolio warm-up starting"
        );

        if self.news_enabled {
            match news::load_events_csv(&self.schedule.news_guard.csv_path) {
                Ok(events) => {
                    info!(events = events.len(), "news guard enabled");
                    self.news_events = events;
                }
                Err(e) => {
                    warn!(error = %e, "news guard disabled");
                    self.news_enabled = false;
                }
            }
        }

        let mut provider =
            HistoryProvider::new(self.schedule.source.clone(), self.schedule.venue.clone());

        // Load warm-up history per symbol; a symbol without data is dropped,
        // warm-up fails only when every symbol fails.
        let mut warmup_data: HashMap<String, Vec<Bar>> = HashMap::new();
        for symbol in &self.schedule.symbols.clone() {
            match provider.intraday_1m(symbol, self.schedule.warmup_days).await {
                Ok(bars_1m) => {
                    let bars_5m = resample_5m(&bars_1m);
                    if let (Some(first), Some(last)) = (bars_5m.first(), bars_5m.last()) {
                        if self.first_bar_time.is_none() {
                            self.first_bar_time = Some(first.time);
                        }
                        self.last_bar_time = Some(last.time);
                    }
                    info!(
                        symbol = %symbol,
                        bars_1m = bars_1m.len(),
                        bars_5m = bars_5m.len(),
                        "warm-up data loaded"
                    );
                    warmup_data.insert(symbol.clone(), bars_5m);
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "warm-up failed for symbol, dropping it");
                }
            }
        }
        self.actual_source = provider.last_source_used.clone();

        if warmup_data.is_empty() {
            bail!("warm-up failed: no data for any symbol");
        }

        let symbols: Vec<String> = self
            .schedule
            .symbols
            .iter()
            .filter(|s| warmup_data.contains_key(*s))
            .cloned()
            .collect();

        // One sub-engine per (symbol, strategy).
        let rules = RiskRules {
            max_trades_per_day: self.schedule.risk.per_strategy_daily_trades,
            daily_loss_stop_r: self.schedule.risk.per_strategy_daily_stop_r,
            daily_win_stop_r: self.schedule.risk.per_strategy_daily_win_r,
        };
        for symbol in &symbols {
            for strat_cfg in &self.schedule.strategies.clone() {
                let user_params = (!strat_cfg.params.is_null()).then_some(&strat_cfg.params);
                let params = resolve_params(
                    user_params,
                    &strat_cfg.name,
                    symbol,
                    &self.schedule.interval,
                );
                let strategy = build_strategy(&strat_cfg.name, &params)
                    .with_context(|| format!("cannot build strategy '{}'", strat_cfg.name))?;

                let engine = SubEngine::new(
                    symbol.clone(),
                    strategy,
                    strat_cfg.windows.clone(),
                    self.schedule.spread_for(symbol),
                    rules,
                    warmup_data[symbol].clone(),
                    user_params.is_some_and(|p| p.as_object().is_some_and(|o| !o.is_empty())),
                );
                info!(
                    symbol = %symbol,
                    strategy = %strat_cfg.name,
                    windows = ?strat_cfg.windows.iter().map(|w| w.to_string()).collect::<Vec<_>>(),
                    "sub-engine initialised"
                );
                self.engines.push(engine);
            }
            self.aggregators
                .insert(symbol.clone(), CascadeAggregator::new());
        }

        // Allocation weights; any failure degrades to the equal split.
        if self.schedule.risk_parity.enabled {
            let (weights, vols) = inv_vol_weights(
                &symbols,
                &warmup_data,
                self.schedule.risk_parity.lookback_d,
                self.schedule.risk_parity.floor,
                self.schedule.risk_parity.cap,
            );
            info!(weights = ?weights, vols = ?vols, "risk-parity weights computed");
            self.weights = weights;
            self.symbol_vols = vols;
        } else {
            self.weights = equal_weights(&symbols);
            self.symbol_vols = symbols.iter().map(|s| (s.clone(), 0.0)).collect();
        }

        info!(engines = self.engines.len(), "portfolio warm-up complete");
        Ok(())
    }

    // =========================================================================
    // Dispatch loops
    // =========================================================================

    async fn run_replay(&mut self) -> Result<()> {
        info!("replay mode starting");
        let mut provider =
            HistoryProvider::new(self.schedule.source.clone(), self.schedule.venue.clone());

        // Replay history is its own one-day window, separate from warm-up.
        let mut all_ticks: Vec<(DateTime<Utc>, String, f64)> = Vec::new();
        for symbol in &self.schedule.symbols.clone() {
            if !self.aggregators.contains_key(symbol) {
                continue;
            }
            match provider.intraday_1m(symbol, 1).await {
                Ok(bars) => {
                    info!(symbol = %symbol, bars = bars.len(), "replay data loaded");
                    all_ticks.extend(bars.into_iter().map(|b| (b.time, symbol.clone(), b.close)));
                }
                Err(e) => warn!(symbol = %symbol, error = %e, "no replay data for symbol"),
            }
        }
        all_ticks.sort_by_key(|(ts, _, _)| *ts);

        let mut last_status = tokio::time::Instant::now();
        let status_every = std::time::Duration::from_secs(REPLAY_STATUS_EVERY_S);

        for (ts, symbol, close) in all_ticks {
            if self.shutdown.load(Ordering::Relaxed) {
                info!("shutdown requested, stopping replay");
                break;
            }
            self.last_tick_time = Some(ts);

            let bars = match self.aggregators.get_mut(&symbol) {
                Some(agg) => agg.push_bar_close(ts, close),
                None => continue,
            };
            for bar in bars {
                self.process_symbol_bar(&symbol, &bar).await?;
            }

            if last_status.elapsed() >= status_every {
                self.emit_status();
                last_status = tokio::time::Instant::now();
            }
            // Pacing to simulate streaming.
            tokio::time::sleep(std::time::Duration::from_millis(REPLAY_PACING_MS)).await;
        }

        // End-of-data sweep: no bar will ever close these positions.
        for i in 0..self.engines.len() {
            if let Some(trade) = self.engines[i].close_end_of_data() {
                let bar_time = trade.exit_time;
                self.settle_close(i, bar_time, trade).await?;
            }
        }

        info!("replay complete");
        Ok(())
    }

    async fn run_ws(&mut self) -> Result<()> {
        let api_keys: Vec<String> = std::env::var("FINNHUB_API_KEYS")
            .unwrap_or_default()
            .split(',')
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        if api_keys.is_empty() {
            warn!("FINNHUB_API_KEYS not set, falling back to replay");
            return self.run_replay().await;
        }

        let state = Arc::new(FeedState::new(DEFAULT_BUFFER_CAPACITY));
        self.feed = Some(state.clone());
        let symbols: Vec<String> = self.aggregators.keys().cloned().collect();
        tokio::spawn(feed::run_feed(
            state.clone(),
            self.schedule.venue.clone(),
            symbols,
            api_keys,
            self.shutdown.clone(),
        ));

        // Wait for the first connection; degrade to replay if the reader
        // exhausts its attempts.
        while !state.connected() && !state.gave_up() && !self.shutdown.load(Ordering::Relaxed) {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
        if state.gave_up() {
            warn!("live feed unavailable, falling back to replay");
            return self.run_replay().await;
        }
        self.notifier
            .info("WS_CONNECTED", json!({ "source": "finnhub" }));

        let mut last_status = tokio::time::Instant::now();
        let status_every = std::time::Duration::from_secs(self.schedule.status_every_s);

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                info!("shutdown requested, stopping dispatcher");
                break;
            }
            if state.gave_up() {
                warn!("live feed gave up mid-run, stopping dispatcher");
                break;
            }

            let ticks = state.buffer.drain();
            for tick in ticks {
                self.last_tick_time = Some(tick.time);
                let bars = match self.aggregators.get_mut(&tick.symbol) {
                    Some(agg) => {
                        agg.push_tick(tick.time, Some(tick.bid), Some(tick.ask), None)
                    }
                    None => continue,
                };
                for bar in bars {
                    let symbol = tick.symbol.clone();
                    self.process_symbol_bar(&symbol, &bar).await?;
                }
            }

            if last_status.elapsed() >= status_every {
                self.emit_status();
                last_status = tokio::time::Instant::now();
            }

            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        Ok(())
    }

    // =========================================================================
    // Per-bar logic
    // =========================================================================

    /// Dispatch one completed 5-minute bar to every sub-engine of `symbol`.
    pub async fn process_symbol_bar(&mut self, symbol: &str, bar: &Bar) -> Result<()> {
        if self.first_bar_time.is_none() || self.first_bar_time > Some(bar.time) {
            self.first_bar_time = Some(bar.time);
        }
        self.last_bar_time = Some(bar.time);

        let date = bar.time.date_naive();
        self.roll_date(date);
        self.check_dd_cooloff(bar.time);

        // Weekend bars pass through aggregation but never reach sub-engines.
        if is_weekend(bar.time) {
            return Ok(());
        }

        if self.news_enabled {
            self.news_windows = news::upcoming_windows(
                &self.news_events,
                bar.time,
                self.schedule.news_guard.pad_before_m,
                self.schedule.news_guard.pad_after_m,
                NEWS_LOOKAHEAD_H,
            );
        }
        let news_blocked =
            self.news_enabled && news::is_in_event_window(symbol, bar.time, &self.news_windows);

        let mut open_count = self
            .engines
            .iter()
            .filter(|e| e.symbol == symbol && e.position.is_some())
            .count() as u32;

        let symbol_count = self.aggregators.len().max(1);

        for i in 0..self.engines.len() {
            if self.engines[i].symbol != symbol {
                continue;
            }
            let in_window = in_any_window(bar.time, &self.engines[i].windows);
            let flat = self.engines[i].position.is_none();
            let strategy_name = self.engines[i].strategy_name.clone();

            // Gate conjunction, first failure wins and is counted.
            let mut allow_entry = false;
            if flat && in_window {
                if self.halted || self.dd_lock_active {
                    self.risk_blocked_entries += 1;
                } else if news_blocked {
                    self.news_blocked_entries += 1;
                } else if self.budget_blocked(&strategy_name) {
                    self.budget_blocked_entries += 1;
                } else if !self.engines[i].daily.can_open(date) {
                    self.risk_blocked_entries += 1;
                } else if open_count >= self.schedule.risk.max_open_positions {
                    self.risk_blocked_entries += 1;
                } else {
                    allow_entry = true;
                }
            }

            let weight = self
                .weights
                .get(symbol)
                .copied()
                .unwrap_or(1.0 / symbol_count as f64);
            let risk_dollars = self.equity_usd * self.budgets.per_trade_fraction * weight;

            let events = self.engines[i].process_bar(bar, in_window, allow_entry, risk_dollars);

            if events.opened {
                open_count += 1;
                self.settle_open(i, bar, weight).await?;
            }
            if let Some(trade) = events.closed {
                self.settle_close(i, bar.time, trade).await?;
            }
        }

        Ok(())
    }

    /// Daily cumulative |R| in dollars against the strategy's budget.
    fn budget_blocked(&self, strategy: &str) -> bool {
        let used_r = self.daily_r_used.get(strategy).copied().unwrap_or(0.0);
        let used_usd = used_r.abs() * self.budgets.per_trade_r;
        let budget = self
            .budgets
            .per_strategy
            .get(strategy)
            .copied()
            .unwrap_or(f64::INFINITY);
        used_usd >= budget
    }

    fn roll_date(&mut self, date: NaiveDate) {
        if self.current_date == Some(date) {
            return;
        }
        if let Some(prev) = self.current_date {
            info!(from = %prev, to = %date, "UTC date rollover, resetting daily state");
            for r in self.daily_r_used.values_mut() {
                *r = 0.0;
            }
            self.first_trade_today = true;
            // The DD lock owns the halt while it is active.
            if !self.dd_lock_active {
                self.halted = false;
            }
        }
        self.current_date = Some(date);
    }

    fn check_dd_cooloff(&mut self, now: DateTime<Utc>) {
        if !self.dd_lock_active {
            return;
        }
        let Some(cooloff_until) = self.dd_lock_cooloff_until else {
            return;
        };
        if now < cooloff_until {
            return;
        }

        self.current_dd_pct = drawdown_pct(self.peak_equity, self.equity_usd);
        if self.current_dd_pct < self.schedule.dd_lock.trailing_pct {
            self.dd_lock_active = false;
            self.halted = false;
            self.dd_lock_since = None;
            self.dd_lock_cooloff_until = None;
            info!(
                equity = self.equity_usd,
                dd_pct = self.current_dd_pct,
                "drawdown lock cleared"
            );
            self.log_event(
                "INFO",
                "dd_lock_cleared",
                json!({ "equity": self.equity_usd, "dd_pct": self.current_dd_pct }),
            );
            self.notifier.event(
                "DD_LOCK_CLEARED",
                json!({ "equity": self.equity_usd, "dd_pct": self.current_dd_pct }),
            );
        } else {
            let extended = now + Duration::minutes(self.schedule.dd_lock.cooloff_min);
            warn!(
                dd_pct = self.current_dd_pct,
                until = %extended,
                "drawdown still elevated, extending cooloff"
            );
            self.dd_lock_cooloff_until = Some(extended);
        }
    }

    // =========================================================================
    // Open / close settlement: journal, mirror, risk
    // =========================================================================

    async fn settle_open(&mut self, idx: usize, bar: &Bar, weight: f64) -> Result<()> {
        let (symbol, strategy, side, entry, sl, tp, notes) = {
            let engine = &self.engines[idx];
            let pos = engine
                .position
                .as_ref()
                .expect("settle_open without a position");
            (
                engine.symbol.clone(),
                engine.strategy_name.clone(),
                pos.side,
                pos.entry_price,
                pos.sl,
                pos.tp,
                pos.notes.clone(),
            )
        };

        let axfl_id = format!(
            "{}_{}_{}_{}",
            symbol,
            strategy,
            bar.time.timestamp(),
            short_suffix()
        );
        let client_tag = format!(
            "AXFL::{}::{}::{}::{}",
            strategy,
            symbol,
            bar.time.format("%Y%m%d%H%M%S"),
            short_suffix()
        );

        {
            let pos = self.engines[idx].position.as_mut().expect("open position");
            pos.axfl_id = Some(axfl_id.clone());
            pos.client_tag = Some(client_tag.clone());
        }

        // Paper trade row: losing this is not tolerated.
        self.journal
            .upsert_axfl_trade(&AxflTradeRec {
                axfl_id: axfl_id.clone(),
                symbol: symbol.clone(),
                strategy: strategy.clone(),
                side,
                entry,
                sl: Some(sl),
                tp,
                r: None,
                pnl: None,
                opened_at: bar.time,
                closed_at: None,
                extra: Some(json!({ "client_tag": client_tag, "notes": notes })),
            })
            .context("fatal: paper trade journal write failed")?;

        self.notifier.event(
            "TRADE_OPEN",
            json!({
                "symbol": symbol,
                "strategy": strategy,
                "side": side.to_string(),
                "entry": entry,
                "sl": sl,
                "time": bar.time.to_rfc3339(),
                "first_of_day": self.first_trade_today,
            }),
        );
        self.first_trade_today = false;

        // Best-effort broker mirror.
        if let Some(broker) = self.broker.clone() {
            let scaled_fraction = self.budgets.per_trade_fraction * weight;
            let units = units_from_risk(&symbol, entry, sl, self.equity_usd, scaled_fraction);

            let result = broker
                .place_market(&symbol, side, units, Some(sl), tp, &client_tag)
                .await;

            if result.success {
                let order_id = result.order_id.clone().unwrap_or_default();
                {
                    let pos = self.engines[idx].position.as_mut().expect("open position");
                    pos.broker_order_id = Some(order_id.clone());
                    pos.broker_units = Some(units);
                }
                self.journal
                    .upsert_broker_order(&BrokerOrderRec {
                        order_id: order_id.clone(),
                        client_tag: client_tag.clone(),
                        symbol: symbol.clone(),
                        side,
                        units,
                        entry: Some(entry),
                        sl: Some(sl),
                        tp,
                        status: "open".to_string(),
                        opened_at: Some(bar.time),
                        closed_at: None,
                        extra: None,
                    })
                    .context("fatal: broker order journal write failed")?;
                self.journal
                    .link(&axfl_id, &order_id)
                    .context("fatal: journal link write failed")?;
                self.mapped_trades += 1;
                info!(
                    symbol = %symbol,
                    order_id = %order_id,
                    units,
                    weight,
                    idempotent = result.idempotent,
                    "broker mirror placed"
                );
            } else {
                self.unmapped_trades += 1;
                let err = result.error.unwrap_or_else(|| "unknown".to_string());
                warn!(symbol = %symbol, error = %err, "broker mirror failed, paper stays open");
                self.log_event(
                    "WARN",
                    "broker_mirror_failed",
                    json!({ "symbol": symbol, "axfl_id": axfl_id, "error": err }),
                );
            }
        }

        Ok(())
    }

    async fn settle_close(
        &mut self,
        idx: usize,
        bar_time: DateTime<Utc>,
        trade: CompletedTrade,
    ) -> Result<()> {
        let symbol = self.engines[idx].symbol.clone();
        let strategy = self.engines[idx].strategy_name.clone();

        // Global equity and drawdown bookkeeping.
        self.equity_usd += trade.pnl;
        if self.equity_usd > self.peak_equity {
            self.peak_equity = self.equity_usd;
        }
        *self.daily_r_used.entry(strategy.clone()).or_insert(0.0) += trade.r_multiple;

        if let Some(axfl_id) = &trade.axfl_id {
            self.journal
                .upsert_axfl_trade(&AxflTradeRec {
                    axfl_id: axfl_id.clone(),
                    symbol: symbol.clone(),
                    strategy: strategy.clone(),
                    side: trade.side,
                    entry: trade.entry,
                    sl: Some(trade.sl),
                    tp: trade.tp,
                    r: Some(trade.r_multiple),
                    pnl: Some(trade.pnl),
                    opened_at: trade.entry_time,
                    closed_at: Some(bar_time),
                    extra: Some(json!({
                        "client_tag": trade.client_tag,
                        "reason": trade.reason.to_string(),
                    })),
                })
                .context("fatal: paper trade close journal write failed")?;
        }

        self.notifier.event(
            "TRADE_CLOSE",
            json!({
                "symbol": symbol,
                "strategy": strategy,
                "side": trade.side.to_string(),
                "entry": trade.entry,
                "exit": trade.exit,
                "r": trade.r_multiple,
                "pnl": trade.pnl,
                "reason": trade.reason.to_string(),
                "time": bar_time.to_rfc3339(),
            }),
        );

        // Release the broker mirror; its failures never touch the paper book.
        if let (Some(order_id), Some(broker)) = (&trade.broker_order_id, self.broker.clone()) {
            self.journal
                .upsert_broker_order(&BrokerOrderRec {
                    order_id: order_id.clone(),
                    client_tag: trade.client_tag.clone().unwrap_or_default(),
                    symbol: symbol.clone(),
                    side: trade.side,
                    units: trade.broker_units.unwrap_or(0),
                    entry: Some(trade.entry),
                    sl: Some(trade.sl),
                    tp: trade.tp,
                    status: "closed".to_string(),
                    opened_at: Some(trade.entry_time),
                    closed_at: Some(bar_time),
                    extra: None,
                })
                .context("fatal: broker order close journal write failed")?;

            let result = broker.close_all(&symbol).await;
            if !result.success {
                let err = result.error.unwrap_or_else(|| "unknown".to_string());
                warn!(symbol = %symbol, error = %err, "broker close failed");
                self.log_event(
                    "WARN",
                    "broker_close_failed",
                    json!({ "symbol": symbol, "order_id": order_id, "error": err }),
                );
            }
        }

        self.maybe_trigger_dd_lock(bar_time);
        self.check_global_risk(bar_time.date_naive());
        Ok(())
    }

    /// Trailing drawdown lock: engage on threshold crossing after a close.
    fn maybe_trigger_dd_lock(&mut self, now: DateTime<Utc>) {
        if !self.schedule.dd_lock.enabled {
            return;
        }
        self.current_dd_pct = drawdown_pct(self.peak_equity, self.equity_usd);
        if self.current_dd_pct < self.schedule.dd_lock.trailing_pct || self.dd_lock_active {
            return;
        }

        self.dd_lock_active = true;
        self.halted = true;
        self.dd_lock_since = Some(now);
        self.dd_lock_cooloff_until =
            Some(now + Duration::minutes(self.schedule.dd_lock.cooloff_min));
        warn!(
            peak = self.peak_equity,
            equity = self.equity_usd,
            dd_pct = self.current_dd_pct,
            cooloff_until = %self.dd_lock_cooloff_until.unwrap(),
            "drawdown lock triggered"
        );
        self.log_event(
            "WARN",
            "dd_lock",
            json!({
                "peak_equity": self.peak_equity,
                "equity": self.equity_usd,
                "dd_pct": self.current_dd_pct,
            }),
        );
        self.notifier.warn(
            "DD_LOCK",
            json!({
                "peak_equity": self.peak_equity,
                "current_equity": self.equity_usd,
                "dd_pct": self.current_dd_pct,
                "threshold": self.schedule.dd_lock.trailing_pct,
                "cooloff_min": self.schedule.dd_lock.cooloff_min,
            }),
        );
    }

    /// Portfolio-wide daily stop over the summed per-engine R.
    fn check_global_risk(&mut self, date: NaiveDate) {
        if self.halted {
            return;
        }
        let total_r: f64 = self.engines.iter_mut().map(|e| e.cum_r(date)).sum();
        if total_r <= self.schedule.risk.global_daily_stop_r {
            self.halted = true;
            warn!(
                total_r,
                threshold = self.schedule.risk.global_daily_stop_r,
                "portfolio halted: global daily stop hit"
            );
            self.log_event(
                "WARN",
                "daily_stop_hit",
                json!({ "r_total": total_r, "threshold": self.schedule.risk.global_daily_stop_r }),
            );
            self.notifier.warn(
                "DAILY_STOP_HIT",
                json!({ "r_total": total_r, "threshold": self.schedule.risk.global_daily_stop_r }),
            );
        }
    }

    // =========================================================================
    // Status
    // =========================================================================

    fn status_record(&mut self) -> StatusRecord {
        let date = self.current_date.unwrap_or_else(|| Utc::now().date_naive());

        let mut by_strategy: BTreeMap<String, status::StrategyStats> = self
            .schedule
            .strategy_names()
            .into_iter()
            .map(|name| {
                (
                    name.clone(),
                    status::StrategyStats {
                        name,
                        r: 0.0,
                        trades: 0,
                        pnl: 0.0,
                    },
                )
            })
            .collect();

        let mut r_total = 0.0;
        let mut pnl_total = 0.0;
        for engine in &mut self.engines {
            let r = engine.cum_r(date);
            let todays: Vec<&CompletedTrade> = engine
                .trades
                .iter()
                .filter(|t| t.exit_time.date_naive() == date)
                .collect();
            let pnl: f64 = todays.iter().map(|t| t.pnl).sum();
            r_total += r;
            pnl_total += pnl;
            if let Some(stats) = by_strategy.get_mut(&engine.strategy_name) {
                stats.r += r;
                stats.trades += todays.len();
                stats.pnl += pnl;
            }
        }

        let positions = self
            .engines
            .iter()
            .filter_map(|e| {
                e.position.as_ref().map(|p| status::OpenPositionView {
                    symbol: e.symbol.clone(),
                    strategy: e.strategy_name.clone(),
                    side: p.side,
                    entry: p.entry_price,
                    sl: p.sl,
                    tp: p.tp,
                    size: p.size,
                })
            })
            .collect();

        let engines = self
            .engines
            .iter()
            .map(|e| status::EngineRosterEntry {
                symbol: e.symbol.clone(),
                strategy: e.strategy_name.clone(),
                windows: e.windows.iter().map(|w| w.to_string()).collect(),
                active: self
                    .last_bar_time
                    .map(|t| in_any_window(t, &e.windows))
                    .unwrap_or(false),
                spread_pips: e.spread_pips,
                live_overrides: e.user_overrides,
            })
            .collect();

        let costs_spreads: BTreeMap<String, f64> = self
            .aggregators
            .keys()
            .map(|s| (s.clone(), self.schedule.spread_for(s)))
            .collect();

        StatusRecord {
            ok: true,
            mode: self.mode.to_string(),
            source: self
                .actual_source
                .clone()
                .unwrap_or_else(|| self.schedule.source.clone()),
            interval: self.schedule.interval.clone(),
            since: self.first_bar_time.map(|t| t.to_rfc3339()),
            now: self.last_bar_time.map(|t| t.to_rfc3339()),
            symbols: self.aggregators.keys().cloned().collect(),
            engines,
            positions,
            today: status::TodayStats {
                r_total,
                pnl_total,
                by_strategy: by_strategy.into_values().collect(),
            },
            risk: status::RiskView {
                halted: self.halted,
                global_daily_stop_r: self.schedule.risk.global_daily_stop_r,
            },
            budgets: status::BudgetsView {
                equity_usd: self.equity_usd,
                daily_r_total: self.budgets.daily_r_total,
                per_trade_r: self.budgets.per_trade_r,
                per_strategy: self.budgets.per_strategy.iter().map(|(k, v)| (k.clone(), *v)).collect(),
                daily_r_used: self.daily_r_used.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            },
            weights: self.weights.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            volatilities_pips: self.symbol_vols.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            news_guard: status::NewsGuardView {
                enabled: self.news_enabled,
                blocked_entries: self.news_blocked_entries,
                active_windows: self.news_windows.len(),
            },
            gates: status::GateCounters {
                news_blocked_entries: self.news_blocked_entries,
                budget_blocked_entries: self.budget_blocked_entries,
                risk_blocked_entries: self.risk_blocked_entries,
            },
            dd_lock: status::DdLockView {
                enabled: self.schedule.dd_lock.enabled,
                active: self.dd_lock_active,
                dd_pct: self.current_dd_pct,
                peak_equity: self.peak_equity,
                threshold_pct: self.schedule.dd_lock.trailing_pct,
                cooloff_min: self.schedule.dd_lock.cooloff_min,
                since: self.dd_lock_since.map(|t| t.to_rfc3339()),
                cooloff_until: self.dd_lock_cooloff_until.map(|t| t.to_rfc3339()),
            },
            journal: status::JournalView {
                enabled: true,
                mapped: self.mapped_trades,
                unmapped: self.unmapped_trades,
            },
            reconcile: self.reconcile_summary.clone(),
            costs: status::CostsView {
                spreads: costs_spreads,
                slippage_model: "max(1 pip, ATR/1000)".to_string(),
            },
            broker: match &self.broker {
                Some(b) => status::BrokerView::from_stats(&b.get_stats()),
                None => status::BrokerView::none(),
            },
            ws: self.feed.as_ref().map(|f| f.stats()),
        }
    }

    fn emit_status(&mut self) {
        if self.last_bar_time.is_none() {
            return;
        }
        let record = self.status_record();
        let logs_dir = self.logs_dir.clone();
        status::emit(&record, &logs_dir);
    }
}

fn drawdown_pct(peak: f64, equity: f64) -> f64 {
    if peak <= 0.0 {
        return 0.0;
    }
    (peak - equity) / peak * 100.0
}

fn short_suffix() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::normalize_schedule;
    use crate::news::NewsEvent;
    use crate::sessions::SessionWindow;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn drawdown_arithmetic() {
        assert!((drawdown_pct(100_000.0, 94_900.0) - 5.1).abs() < 1e-9);
        assert!((drawdown_pct(100_000.0, 96_500.0) - 3.5).abs() < 1e-9);
        assert_eq!(drawdown_pct(0.0, 0.0), 0.0);
    }

    #[test]
    fn suffix_is_short_and_unique_enough() {
        let a = short_suffix();
        let b = short_suffix();
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
    }

    #[test]
    fn mode_labels() {
        assert_eq!(Mode::Replay.to_string(), "replay");
        assert_eq!(Mode::Ws.to_string(), "ws");
    }

    // -----------------------------------------------------------------------
    // Engine-level fixtures
    // -----------------------------------------------------------------------

    fn test_engine() -> PortfolioEngine {
        let doc = json!({
            "portfolio": {
                "symbols": ["EURUSD"],
                "risk": { "max_open_positions": 1 },
                "dd_lock": { "enabled": true, "trailing_pct": 5.0, "cooloff_min": 120 },
                "news_guard": { "enabled": false, "pad_before_m": 30, "pad_after_m": 30 }
            },
            "strategies": [
                { "name": "ema_trend", "windows": [ { "start": "07:00", "end": "16:00" } ] }
            ]
        });
        let schedule = normalize_schedule(&doc, None).unwrap();
        PortfolioEngine::new(
            schedule,
            Mode::Replay,
            Arc::new(Journal::in_memory().unwrap()),
            None,
            Notifier::disabled(),
            Arc::new(AtomicBool::new(false)),
        )
    }

    /// Seed one flat-market sub-engine so bars have somewhere to go.
    fn add_subengine(engine: &mut PortfolioEngine) {
        let warmup: Vec<Bar> = (0..30)
            .map(|i| {
                let t = Utc.with_ymd_and_hms(2025, 10, 20, 7, 0, 0).unwrap()
                    + Duration::minutes(5 * i);
                Bar::new(t, 1.1000, 1.1002, 1.0998, 1.1000, 1)
            })
            .collect();
        let strategy = build_strategy("ema_trend", &crate::strategy::Params::new()).unwrap();
        engine.engines.push(SubEngine::new(
            "EURUSD",
            strategy,
            vec![SessionWindow::new(7, 0, 16, 0)],
            0.6,
            RiskRules::default(),
            warmup,
            false,
        ));
        engine
            .aggregators
            .insert("EURUSD".to_string(), CascadeAggregator::new());
        engine.weights = equal_weights(&["EURUSD".to_string()]);
    }

    fn monday_bar(h: u32, m: u32) -> Bar {
        let t = Utc.with_ymd_and_hms(2025, 10, 20, h, m, 0).unwrap();
        Bar::new(t, 1.1000, 1.1002, 1.0998, 1.1000, 1)
    }

    #[tokio::test]
    async fn halted_engine_counts_risk_blocked() {
        let mut engine = test_engine();
        add_subengine(&mut engine);
        engine.halted = true;

        engine
            .process_symbol_bar("EURUSD", &monday_bar(9, 30))
            .await
            .unwrap();
        assert_eq!(engine.risk_blocked_entries, 1);
        assert!(engine.engines[0].position.is_none());
    }

    #[tokio::test]
    async fn weekend_bars_never_reach_subengines() {
        let mut engine = test_engine();
        add_subengine(&mut engine);
        let bars_before = engine.engines[0].bars.len();

        // 2025-10-18 is a Saturday.
        let t = Utc.with_ymd_and_hms(2025, 10, 18, 9, 30, 0).unwrap();
        let bar = Bar::new(t, 1.1, 1.1002, 1.0998, 1.1, 1);
        engine.process_symbol_bar("EURUSD", &bar).await.unwrap();

        assert_eq!(engine.engines[0].bars.len(), bars_before);
        assert_eq!(engine.risk_blocked_entries, 0);
    }

    #[tokio::test]
    async fn news_blackout_counts_and_blocks() {
        let mut engine = test_engine();
        add_subengine(&mut engine);
        engine.news_enabled = true;
        // USD CPI at 12:30; bar at 12:15 is inside the padded window.
        engine.news_events = vec![NewsEvent {
            time: Utc.with_ymd_and_hms(2025, 10, 20, 12, 30, 0).unwrap(),
            currencies: vec!["USD".to_string()],
            impact: "high".to_string(),
            title: "CPI".to_string(),
        }];

        engine
            .process_symbol_bar("EURUSD", &monday_bar(12, 15))
            .await
            .unwrap();
        assert_eq!(engine.news_blocked_entries, 1);

        // After the window expires the news gate passes.
        engine
            .process_symbol_bar("EURUSD", &monday_bar(13, 5))
            .await
            .unwrap();
        assert_eq!(engine.news_blocked_entries, 1);
    }

    #[test]
    fn dd_lock_triggers_on_threshold() {
        let mut engine = test_engine();
        let t = Utc.with_ymd_and_hms(2025, 10, 20, 12, 0, 0).unwrap();

        engine.peak_equity = 100_000.0;
        engine.equity_usd = 94_900.0; // 5.1% drawdown
        engine.maybe_trigger_dd_lock(t);

        assert!(engine.dd_lock_active);
        assert!(engine.halted);
        assert_eq!(engine.dd_lock_since, Some(t));
        assert_eq!(engine.dd_lock_cooloff_until, Some(t + Duration::minutes(120)));
    }

    #[test]
    fn dd_lock_recovers_after_cooloff() {
        let mut engine = test_engine();
        let t = Utc.with_ymd_and_hms(2025, 10, 20, 12, 0, 0).unwrap();
        engine.peak_equity = 100_000.0;
        engine.equity_usd = 94_900.0;
        engine.maybe_trigger_dd_lock(t);

        // Before the cooloff boundary nothing changes.
        engine.check_dd_cooloff(t + Duration::minutes(60));
        assert!(engine.dd_lock_active);

        // Recovered below threshold at the boundary: lock and halt clear.
        engine.equity_usd = 96_500.0; // 3.5%
        engine.check_dd_cooloff(t + Duration::minutes(120));
        assert!(!engine.dd_lock_active);
        assert!(!engine.halted);
        assert!(engine.dd_lock_cooloff_until.is_none());
    }

    #[test]
    fn dd_lock_extends_cooloff_while_elevated() {
        let mut engine = test_engine();
        let t = Utc.with_ymd_and_hms(2025, 10, 20, 12, 0, 0).unwrap();
        engine.peak_equity = 100_000.0;
        engine.equity_usd = 94_900.0;
        engine.maybe_trigger_dd_lock(t);

        let boundary = t + Duration::minutes(120);
        engine.check_dd_cooloff(boundary);
        assert!(engine.dd_lock_active);
        assert!(engine.halted);
        assert_eq!(
            engine.dd_lock_cooloff_until,
            Some(boundary + Duration::minutes(120))
        );
    }

    #[test]
    fn peak_equity_is_non_decreasing() {
        let mut engine = test_engine();
        let start_peak = engine.peak_equity;
        engine.equity_usd -= 2_000.0;
        engine.maybe_trigger_dd_lock(Utc::now());
        assert_eq!(engine.peak_equity, start_peak);
        engine.equity_usd = start_peak + 1_000.0;
        if engine.equity_usd > engine.peak_equity {
            engine.peak_equity = engine.equity_usd;
        }
        assert!(engine.peak_equity >= start_peak);
    }

    #[test]
    fn budget_blocked_converts_r_to_dollars() {
        let mut engine = test_engine();
        // Budget for the single strategy is the full daily total ($2000);
        // per-trade R is $500, so |R| >= 4 exhausts it.
        engine.daily_r_used.insert("ema_trend".to_string(), -3.9);
        assert!(!engine.budget_blocked("ema_trend"));
        engine.daily_r_used.insert("ema_trend".to_string(), -4.0);
        assert!(engine.budget_blocked("ema_trend"));
    }

    #[test]
    fn date_rollover_resets_daily_state() {
        let mut engine = test_engine();
        engine.halted = true;
        engine.first_trade_today = false;
        engine.daily_r_used.insert("ema_trend".to_string(), -2.0);
        engine.current_date = NaiveDate::from_ymd_opt(2025, 10, 20);

        engine.roll_date(NaiveDate::from_ymd_opt(2025, 10, 21).unwrap());
        assert!(!engine.halted);
        assert!(engine.first_trade_today);
        assert_eq!(engine.daily_r_used["ema_trend"], 0.0);
    }

    #[test]
    fn date_rollover_keeps_dd_halt() {
        let mut engine = test_engine();
        engine.halted = true;
        engine.dd_lock_active = true;
        engine.current_date = NaiveDate::from_ymd_opt(2025, 10, 20);
        engine.roll_date(NaiveDate::from_ymd_opt(2025, 10, 21).unwrap());
        // The DD lock still owns the halt across the date boundary.
        assert!(engine.halted);
    }
}
