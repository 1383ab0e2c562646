// =============================================================================
// Sub-engine — one (symbol, strategy) pair, at most one open position
// =============================================================================
//
// The sub-engine owns its prepared bar window, its strategy, its trade log,
// and its per-day limits. It never reaches back into the portfolio: the
// caller decides whether an entry is allowed and with how many risk dollars,
// and receives open/close events as return values.
//
// Exit order inside one bar is fixed: stop-loss, then take-profit (loss-first
// when both are touched), then the session time-stop.
// =============================================================================

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::costs::{apply_costs, Fill};
use crate::indicators::atr;
use crate::market::Bar;
use crate::risk::daily::{DailyRisk, RiskRules};
use crate::sessions::SessionWindow;
use crate::strategy::Strategy;
use crate::symbols::pip_size;
use crate::types::{ExitReason, Side};

const ATR_PERIOD: usize = 14;
/// Window cap; old bars are dropped in blocks to keep appends cheap.
const MAX_BARS: usize = 6000;
const TRIM_BLOCK: usize = 1000;

/// The single open position of a sub-engine.
#[derive(Debug, Clone)]
pub struct Position {
    pub side: Side,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub initial_sl: f64,
    /// Mutable working stop (may move to break-even).
    pub sl: f64,
    pub tp: Option<f64>,
    /// Units, from the risk formula.
    pub size: f64,
    pub notes: String,
    pub axfl_id: Option<String>,
    pub client_tag: Option<String>,
    pub broker_order_id: Option<String>,
    pub broker_units: Option<i64>,
}

/// A closed trade. Carries the identifiers the position held so the caller
/// can journal the close and release any broker mirror.
#[derive(Debug, Clone)]
pub struct CompletedTrade {
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub side: Side,
    pub entry: f64,
    pub exit: f64,
    pub size: f64,
    pub pnl: f64,
    pub r_multiple: f64,
    pub reason: ExitReason,
    pub notes: String,
    pub sl: f64,
    pub tp: Option<f64>,
    pub axfl_id: Option<String>,
    pub client_tag: Option<String>,
    pub broker_order_id: Option<String>,
    pub broker_units: Option<i64>,
}

/// What happened inside one `process_bar` call.
#[derive(Debug, Default)]
pub struct BarEvents {
    pub opened: bool,
    pub closed: Option<CompletedTrade>,
}

pub struct SubEngine {
    pub symbol: String,
    pub strategy_name: String,
    strategy: Box<dyn Strategy>,
    pub windows: Vec<SessionWindow>,
    pub spread_pips: f64,
    pip: f64,
    pub bars: Vec<Bar>,
    pub position: Option<Position>,
    pub trades: Vec<CompletedTrade>,
    pub daily: DailyRisk,
    /// Whether the schedule supplied parameter overrides.
    pub user_overrides: bool,
}

impl SubEngine {
    pub fn new(
        symbol: impl Into<String>,
        mut strategy: Box<dyn Strategy>,
        windows: Vec<SessionWindow>,
        spread_pips: f64,
        rules: RiskRules,
        warmup: Vec<Bar>,
        user_overrides: bool,
    ) -> Self {
        let symbol = symbol.into();
        // Warm-up preparation happens for every strategy, stateful or not.
        strategy.prepare(&warmup);
        Self {
            pip: pip_size(&symbol),
            strategy_name: strategy.name().to_string(),
            symbol,
            strategy,
            windows,
            spread_pips,
            bars: warmup,
            position: None,
            trades: Vec::new(),
            daily: DailyRisk::new(rules),
            user_overrides,
        }
    }

    /// Process one completed bar.
    ///
    /// SL/TP/TIME handling always runs so an open position closes
    /// deterministically; `allow_entry` gates only new opens.
    /// `risk_dollars` is the per-trade dollar risk, already scaled by the
    /// symbol weight.
    pub fn process_bar(
        &mut self,
        bar: &Bar,
        in_window: bool,
        allow_entry: bool,
        risk_dollars: f64,
    ) -> BarEvents {
        self.bars.push(bar.clone());
        if self.bars.len() > MAX_BARS {
            self.bars.drain(..TRIM_BLOCK);
        }
        if self.strategy.stateless() {
            self.strategy.prepare(&self.bars);
        }

        let mut events = BarEvents::default();

        if let Some(pos) = &self.position {
            let (sl, tp, side) = (pos.sl, pos.tp, pos.side);

            let sl_hit = match side {
                Side::Long => bar.low <= sl,
                Side::Short => bar.high >= sl,
            };
            let tp_hit = tp.is_some_and(|tp| match side {
                Side::Long => bar.high >= tp,
                Side::Short => bar.low <= tp,
            });

            if sl_hit {
                events.closed = Some(self.close_position(bar, ExitReason::StopLoss, sl));
            } else if tp_hit {
                events.closed =
                    Some(self.close_position(bar, ExitReason::TakeProfit, tp.unwrap_or(sl)));
            } else if !in_window {
                events.closed = Some(self.close_position(bar, ExitReason::TimeStop, bar.close));
            }
        }

        if self.position.is_none() && allow_entry {
            let index = self.bars.len() - 1;
            let intents = self.strategy.signals(index, &self.bars);
            // First admissible intent wins; the rest are ignored.
            if let Some(intent) = intents.into_iter().next() {
                events.opened = self.open_position(
                    bar,
                    intent.side,
                    intent.price,
                    intent.sl,
                    intent.tp,
                    intent.notes,
                    risk_dollars,
                );
            }
        }

        events
    }

    fn open_position(
        &mut self,
        bar: &Bar,
        side: Side,
        price: f64,
        sl: f64,
        tp: Option<f64>,
        notes: String,
        risk_dollars: f64,
    ) -> bool {
        let atr = atr(&self.bars, ATR_PERIOD);
        let entry = apply_costs(price, side, self.pip, Fill::Open, self.spread_pips, atr);

        let sl_distance = (entry - sl).abs();
        if sl_distance <= 0.0 {
            return false;
        }
        let size = risk_dollars / sl_distance;
        if size <= 0.0 {
            debug!(symbol = %self.symbol, strategy = %self.strategy_name, "zero-size intent rejected");
            return false;
        }

        self.position = Some(Position {
            side,
            entry_time: bar.time,
            entry_price: entry,
            initial_sl: sl,
            sl,
            tp,
            size,
            notes,
            axfl_id: None,
            client_tag: None,
            broker_order_id: None,
            broker_units: None,
        });
        self.daily.on_open(bar.time.date_naive());

        info!(
            symbol = %self.symbol,
            strategy = %self.strategy_name,
            side = %side,
            entry,
            sl,
            tp = tp.unwrap_or(f64::NAN),
            size,
            "position opened"
        );
        true
    }

    fn close_position(&mut self, bar: &Bar, reason: ExitReason, exit_mid: f64) -> CompletedTrade {
        let pos = self
            .position
            .take()
            .expect("close_position called with no position");

        let atr = atr(&self.bars, ATR_PERIOD);
        let exit = apply_costs(
            exit_mid,
            pos.side,
            self.pip,
            Fill::Close,
            self.spread_pips,
            atr,
        );

        let pnl = (exit - pos.entry_price) * pos.size * pos.side.factor();
        let risk = (pos.entry_price - pos.initial_sl).abs() * pos.size;
        let r_multiple = if risk > 0.0 { pnl / risk } else { 0.0 };

        self.daily.on_close(bar.time.date_naive(), r_multiple);

        let trade = CompletedTrade {
            entry_time: pos.entry_time,
            exit_time: bar.time,
            side: pos.side,
            entry: pos.entry_price,
            exit,
            size: pos.size,
            pnl,
            r_multiple,
            reason,
            notes: pos.notes,
            sl: pos.initial_sl,
            tp: pos.tp,
            axfl_id: pos.axfl_id,
            client_tag: pos.client_tag,
            broker_order_id: pos.broker_order_id,
            broker_units: pos.broker_units,
        };

        info!(
            symbol = %self.symbol,
            strategy = %self.strategy_name,
            side = %trade.side,
            exit,
            pnl,
            r = r_multiple,
            reason = %reason,
            "position closed"
        );

        self.trades.push(trade.clone());
        trade
    }

    /// Replay end-of-data sweep: close any open position at the last close.
    pub fn close_end_of_data(&mut self) -> Option<CompletedTrade> {
        if self.position.is_none() {
            return None;
        }
        let bar = self.bars.last()?.clone();
        Some(self.close_position(&bar, ExitReason::EndOfData, bar.close))
    }

    /// Cumulative R for this sub-engine on `date`.
    pub fn cum_r(&mut self, date: chrono::NaiveDate) -> f64 {
        self.daily.state(date).cum_r
    }
}

impl std::fmt::Debug for SubEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubEngine")
            .field("symbol", &self.symbol)
            .field("strategy", &self.strategy_name)
            .field("bars", &self.bars.len())
            .field("open", &self.position.is_some())
            .field("trades", &self.trades.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
