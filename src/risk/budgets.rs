// =============================================================================
// Portfolio risk budgets
// =============================================================================

use std::collections::HashMap;

use serde::Serialize;

/// Dollar risk budgets for the portfolio. The per-strategy budget is an equal
/// split of the daily total across enabled strategies.
#[derive(Debug, Clone, Serialize)]
pub struct Budgets {
    pub equity_usd: f64,
    pub daily_r_total: f64,
    pub per_trade_r: f64,
    pub daily_risk_fraction: f64,
    pub per_trade_fraction: f64,
    pub per_strategy: HashMap<String, f64>,
}

/// Defaults: 2% daily, 0.5% per trade.
pub const DEFAULT_DAILY_RISK_FRACTION: f64 = 0.02;
pub const DEFAULT_PER_TRADE_FRACTION: f64 = 0.005;

pub fn compute_budgets(
    strategies: &[String],
    equity_usd: f64,
    daily_risk_fraction: f64,
    per_trade_fraction: f64,
) -> Budgets {
    let daily_r_total = equity_usd * daily_risk_fraction;

    let n = strategies.len().max(1) as f64;
    let per_strategy = strategies
        .iter()
        .map(|s| (s.clone(), daily_r_total / n))
        .collect();

    Budgets {
        equity_usd,
        daily_r_total,
        per_trade_r: equity_usd * per_trade_fraction,
        daily_risk_fraction,
        per_trade_fraction,
        per_strategy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_split_across_strategies() {
        let strategies = vec![
            "ema_trend".to_string(),
            "bollinger_rev".to_string(),
            "orb".to_string(),
        ];
        let b = compute_budgets(&strategies, 100_000.0, 0.02, 0.005);
        assert!((b.daily_r_total - 2000.0).abs() < 1e-9);
        assert!((b.per_trade_r - 500.0).abs() < 1e-9);
        assert_eq!(b.per_strategy.len(), 3);
        for v in b.per_strategy.values() {
            assert!((v - 2000.0 / 3.0).abs() < 1e-9);
        }
    }

    #[test]
    fn empty_strategy_list_does_not_divide_by_zero() {
        let b = compute_budgets(&[], 100_000.0, 0.02, 0.005);
        assert!(b.per_strategy.is_empty());
        assert!((b.daily_r_total - 2000.0).abs() < 1e-9);
    }
}
