// =============================================================================
// Per-day trade limits — trade count, cumulative R, halted flag
// =============================================================================
//
// Each sub-engine carries one of these with its strategy's limits. State is
// keyed by UTC calendar date, so a new date starts clean without an explicit
// reset call.
// =============================================================================

use std::collections::HashMap;

use chrono::NaiveDate;
use tracing::warn;

/// Limits for a single strategy-day.
#[derive(Debug, Clone, Copy)]
pub struct RiskRules {
    pub max_trades_per_day: u32,
    /// Stop trading when cumulative R falls to this level (negative).
    pub daily_loss_stop_r: f64,
    /// Lock in gains after an outsized day.
    pub daily_win_stop_r: f64,
}

impl Default for RiskRules {
    fn default() -> Self {
        Self {
            max_trades_per_day: 5,
            daily_loss_stop_r: -3.0,
            daily_win_stop_r: 6.0,
        }
    }
}

/// Mutable state for one calendar date.
#[derive(Debug, Clone, Copy, Default)]
pub struct DayState {
    pub trades: u32,
    pub cum_r: f64,
    pub halted: bool,
}

/// Tracks day states and answers the "may this strategy open?" question.
#[derive(Debug)]
pub struct DailyRisk {
    rules: RiskRules,
    days: HashMap<NaiveDate, DayState>,
}

impl DailyRisk {
    pub fn new(rules: RiskRules) -> Self {
        Self {
            rules,
            days: HashMap::new(),
        }
    }

    pub fn state(&self, date: NaiveDate) -> DayState {
        self.days.get(&date).copied().unwrap_or_default()
    }

    /// Whether a new trade may open today. Crossing a stop marks the day
    /// halted as a side effect.
    pub fn can_open(&mut self, date: NaiveDate) -> bool {
        let rules = self.rules;
        let state = self.days.entry(date).or_default();

        if state.halted {
            return false;
        }
        if state.trades >= rules.max_trades_per_day {
            return false;
        }
        if state.cum_r <= rules.daily_loss_stop_r || state.cum_r >= rules.daily_win_stop_r {
            state.halted = true;
            warn!(date = %date, cum_r = state.cum_r, "daily R stop reached, halting strategy for the day");
            return false;
        }
        true
    }

    pub fn on_open(&mut self, date: NaiveDate) {
        self.days.entry(date).or_default().trades += 1;
    }

    pub fn on_close(&mut self, date: NaiveDate, r_multiple: f64) {
        let rules = self.rules;
        let state = self.days.entry(date).or_default();
        state.cum_r += r_multiple;
        if state.cum_r <= rules.daily_loss_stop_r || state.cum_r >= rules.daily_win_stop_r {
            state.halted = true;
        }
    }
}
