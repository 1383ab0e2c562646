pub mod budgets;
pub mod daily;
pub mod sizing;
pub mod vol;

pub use budgets::{compute_budgets, Budgets};
pub use daily::{DailyRisk, DayState, RiskRules};
pub use sizing::{kelly_cap, pip_value, units_from_risk};
pub use vol::{inv_vol_weights, realized_vol_pips};
