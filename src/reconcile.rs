// =============================================================================
// Startup reconciliation — broker vs journal, flatten orphans, link pending
// =============================================================================
//
// Runs once before the first dispatch iteration when a broker is attached:
//   1. Broker open positions with no open journal broker order are orphans;
//      with flatten_on_conflict they are closed.
//   2. Paper trades without a map row are linked to broker transactions by
//      client tag, falling back to instrument + fill-time proximity (5 min).
//
// Failures land in the summary's errors list; the engine proceeds either way.
// =============================================================================

use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::broker::oanda::{BrokerPosition, BrokerTrade, OandaClient};
use crate::journal::{AxflTradeRec, BrokerOrderRec, Journal};
use crate::symbols::{from_instrument, instrument};

/// How close a broker fill must be to a paper open to count as the same
/// trade when no client tag matches.
const LINK_TIME_TOLERANCE_S: i64 = 300;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileSummary {
    pub broker_positions: usize,
    pub journal_positions: usize,
    pub orphaned: usize,
    pub flattened: u32,
    pub linked: u32,
    pub errors: Vec<String>,
}

pub struct Reconciler<'a> {
    broker: &'a OandaClient,
    journal: &'a Journal,
    flatten_on_conflict: bool,
}

impl<'a> Reconciler<'a> {
    pub fn new(broker: &'a OandaClient, journal: &'a Journal, flatten_on_conflict: bool) -> Self {
        Self {
            broker,
            journal,
            flatten_on_conflict,
        }
    }

    fn log_event(&self, level: &str, kind: &str, payload: serde_json::Value) {
        if let Err(e) = self.journal.log_event(level, kind, payload) {
            warn!(error = %e, kind, "journal event write failed");
        }
    }

    /// Full reconciliation pass.
    pub async fn run(&self) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        self.log_event("INFO", "reconcile_start", json!({}));

        let broker_positions = self.broker.get_open_positions().await;
        summary.broker_positions = broker_positions.len();

        let open = match self.journal.open_positions() {
            Ok(open) => open,
            Err(e) => {
                let msg = format!("journal read failed: {e}");
                warn!("{msg}");
                summary.errors.push(msg);
                return summary;
            }
        };
        summary.journal_positions = open.broker_orders.len();

        // --- Orphans -------------------------------------------------------
        let orphans = find_orphans(&broker_positions, &open.broker_orders);
        summary.orphaned = orphans.len();

        if self.flatten_on_conflict {
            for pos in &orphans {
                let symbol = from_instrument(&pos.instrument);
                self.log_event(
                    "WARN",
                    "flatten_orphan",
                    json!({ "instrument": pos.instrument, "units": pos.units, "reason": "not_in_journal" }),
                );

                let result = self.broker.close_all(&symbol).await;
                if result.success {
                    summary.flattened += 1;
                    self.log_event("INFO", "flattened", json!({ "symbol": symbol }));
                } else {
                    let err = result.error.unwrap_or_else(|| "unknown".to_string());
                    summary
                        .errors
                        .push(format!("flatten {symbol} failed: {err}"));
                    self.log_event(
                        "ERROR",
                        "flatten_failed",
                        json!({ "symbol": symbol, "error": err }),
                    );
                }
            }
        }

        // --- Pending links -------------------------------------------------
        summary.linked = self.link_pending().await;

        self.log_event(
            "INFO",
            "reconcile_complete",
            serde_json::to_value(&summary).unwrap_or_default(),
        );
        info!(
            broker = summary.broker_positions,
            journal = summary.journal_positions,
            orphaned = summary.orphaned,
            flattened = summary.flattened,
            linked = summary.linked,
            errors = summary.errors.len(),
            "reconciliation complete"
        );
        summary
    }

    async fn link_pending(&self) -> u32 {
        let pending = match self.journal.pending_mappings() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "pending-mapping read failed");
                return 0;
            }
        };
        if pending.is_empty() {
            return 0;
        }

        let since = Utc::now() - Duration::hours(24);
        let broker_trades = self.broker.get_trades_since(since).await;

        let mut linked = 0;
        for trade in &pending {
            if let Some(order_id) = match_pending(trade, &broker_trades) {
                match self.journal.link(&trade.axfl_id, &order_id) {
                    Ok(()) => {
                        linked += 1;
                        self.log_event(
                            "INFO",
                            "linked",
                            json!({ "axfl_id": trade.axfl_id, "order_id": order_id, "symbol": trade.symbol }),
                        );
                    }
                    Err(e) => warn!(error = %e, axfl_id = %trade.axfl_id, "link write failed"),
                }
            }
        }
        linked
    }
}

// ---------------------------------------------------------------------------
// Pure matching (testable without a broker)
// ---------------------------------------------------------------------------

/// Broker positions whose instrument no open journal order covers.
pub fn find_orphans(
    broker_positions: &[BrokerPosition],
    journal_orders: &[BrokerOrderRec],
) -> Vec<BrokerPosition> {
    broker_positions
        .iter()
        .filter(|pos| {
            !journal_orders
                .iter()
                .any(|order| instrument(&order.symbol) == pos.instrument)
        })
        .cloned()
        .collect()
}

/// Find the broker order id for a pending paper trade: client tag first,
/// then instrument + fill-time proximity.
pub fn match_pending(trade: &AxflTradeRec, broker_trades: &[BrokerTrade]) -> Option<String> {
    let client_tag = trade
        .extra
        .as_ref()
        .and_then(|e| e["client_tag"].as_str())
        .map(String::from);

    if let Some(tag) = client_tag {
        if let Some(hit) = broker_trades
            .iter()
            .find(|bt| bt.client_tag.as_deref() == Some(tag.as_str()))
        {
            return Some(hit.id.clone());
        }
    }

    let inst = instrument(&trade.symbol);
    broker_trades
        .iter()
        .find(|bt| {
            bt.instrument == inst
                && bt
                    .time
                    .map(|t| (t - trade.opened_at).num_seconds().abs() < LINK_TIME_TOLERANCE_S)
                    .unwrap_or(false)
        })
        .map(|bt| bt.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;
    use chrono::TimeZone;
    use serde_json::json;

    fn broker_pos(instrument: &str, units: f64) -> BrokerPosition {
        BrokerPosition {
            instrument: instrument.to_string(),
            units,
            avg_price: 1.1,
            unrealized: 0.0,
        }
    }

    fn journal_order(symbol: &str) -> BrokerOrderRec {
        BrokerOrderRec {
            order_id: "o1".to_string(),
            client_tag: "tag".to_string(),
            symbol: symbol.to_string(),
            side: Side::Long,
            units: 1000,
            entry: None,
            sl: None,
            tp: None,
            status: "open".to_string(),
            opened_at: None,
            closed_at: None,
            extra: None,
        }
    }

    fn pending_trade(symbol: &str, tag: Option<&str>) -> AxflTradeRec {
        AxflTradeRec {
            axfl_id: "t1".to_string(),
            symbol: symbol.to_string(),
            strategy: "ema_trend".to_string(),
            side: Side::Long,
            entry: 1.1,
            sl: None,
            tp: None,
            r: None,
            pnl: None,
            opened_at: Utc.with_ymd_and_hms(2025, 10, 20, 9, 0, 0).unwrap(),
            closed_at: None,
            extra: tag.map(|t| json!({ "client_tag": t })),
        }
    }

    fn broker_trade(id: &str, instrument: &str, tag: Option<&str>, minute: u32) -> BrokerTrade {
        BrokerTrade {
            id: id.to_string(),
            kind: "MARKET_ORDER".to_string(),
            instrument: instrument.to_string(),
            units: 1000.0,
            price: 1.1,
            time: Some(Utc.with_ymd_and_hms(2025, 10, 20, 9, minute, 0).unwrap()),
            client_tag: tag.map(String::from),
        }
    }

    #[test]
    fn orphan_detection_by_instrument() {
        // GBP_USD is at the broker but not in the journal.
        let broker = vec![broker_pos("EUR_USD", 1000.0), broker_pos("GBP_USD", 500.0)];
        let journal = vec![journal_order("EURUSD")];
        let orphans = find_orphans(&broker, &journal);
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].instrument, "GBP_USD");
    }

    #[test]
    fn no_orphans_when_journal_covers_everything() {
        let broker = vec![broker_pos("EUR_USD", 1000.0)];
        let journal = vec![journal_order("EURUSD")];
        assert!(find_orphans(&broker, &journal).is_empty());
    }

    #[test]
    fn crash_before_journal_upsert_is_an_orphan() {
        // Scenario: order reached the broker, process died before the
        // journal write. On restart the position has no journal cover.
        let broker = vec![broker_pos("GBP_USD", 25_000.0)];
        let orphans = find_orphans(&broker, &[]);
        assert_eq!(orphans.len(), 1);
    }

    #[test]
    fn link_by_client_tag_wins() {
        let trade = pending_trade("EURUSD", Some("AXFL::x"));
        let trades = vec![
            broker_trade("1", "EUR_USD", None, 0),
            broker_trade("2", "EUR_USD", Some("AXFL::x"), 30),
        ];
        assert_eq!(match_pending(&trade, &trades).as_deref(), Some("2"));
    }

    #[test]
    fn link_falls_back_to_time_proximity() {
        let trade = pending_trade("EURUSD", None);
        let trades = vec![
            broker_trade("1", "GBP_USD", None, 1),  // wrong instrument
            broker_trade("2", "EUR_USD", None, 30), // too far (30 min)
            broker_trade("3", "EUR_USD", None, 3),  // within 5 minutes
        ];
        assert_eq!(match_pending(&trade, &trades).as_deref(), Some("3"));
    }

    #[test]
    fn no_match_stays_unlinked() {
        let trade = pending_trade("XAUUSD", Some("AXFL::gold"));
        let trades = vec![broker_trade("1", "EUR_USD", Some("AXFL::fx"), 0)];
        assert!(match_pending(&trade, &trades).is_none());
    }
}
