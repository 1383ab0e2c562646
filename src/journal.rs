// =============================================================================
// Journal — durable SQLite record of broker orders, paper trades, and events
// =============================================================================
//
// Four tables:
//   broker_orders  broker-side orders keyed by order_id, unique client_tag
//   axfl_trades    paper trades keyed by axfl_id
//   map            (axfl_id, order_id) links
//   events         append-only diagnostics with auto-increment id
//
// Upserts overwrite status and timestamps; structural fields (symbol, side,
// units, entry) are insert-time-only. The store must survive restart, so
// everything is written through immediately.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::types::Side;

/// Broker-side order row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrderRec {
    pub order_id: String,
    pub client_tag: String,
    pub symbol: String,
    pub side: Side,
    pub units: i64,
    pub entry: Option<f64>,
    pub sl: Option<f64>,
    pub tp: Option<f64>,
    /// `open` or `closed`.
    pub status: String,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub extra: Option<serde_json::Value>,
}

/// Paper trade row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxflTradeRec {
    pub axfl_id: String,
    pub symbol: String,
    pub strategy: String,
    pub side: Side,
    pub entry: f64,
    pub sl: Option<f64>,
    pub tp: Option<f64>,
    pub r: Option<f64>,
    pub pnl: Option<f64>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub extra: Option<serde_json::Value>,
}

/// Diagnostic event row.
#[derive(Debug, Clone, Serialize)]
pub struct EventRec {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub level: String,
    pub kind: String,
    pub payload: Option<serde_json::Value>,
}

/// Joined view of everything still open.
#[derive(Debug, Default)]
pub struct OpenState {
    pub broker_orders: Vec<BrokerOrderRec>,
    pub axfl_trades: Vec<AxflTradeRec>,
    pub mappings: Vec<(String, String)>,
}

pub struct Journal {
    conn: Mutex<Connection>,
}

impl Journal {
    /// Open (and create, if needed) the journal at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create journal dir {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open journal at {}", path.display()))?;
        let journal = Self {
            conn: Mutex::new(conn),
        };
        journal.init_schema()?;
        Ok(journal)
    }

    /// In-memory journal for tests.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let journal = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        journal.init_schema()?;
        Ok(journal)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS broker_orders (
                order_id   TEXT PRIMARY KEY,
                client_tag TEXT UNIQUE,
                symbol     TEXT NOT NULL,
                side       TEXT NOT NULL,
                units      INTEGER NOT NULL,
                entry      REAL,
                sl         REAL,
                tp         REAL,
                status     TEXT NOT NULL,
                opened_at  TEXT,
                closed_at  TEXT,
                extra      TEXT
            );
            CREATE TABLE IF NOT EXISTS axfl_trades (
                axfl_id   TEXT PRIMARY KEY,
                symbol    TEXT NOT NULL,
                strategy  TEXT NOT NULL,
                side      TEXT NOT NULL,
                entry     REAL NOT NULL,
                sl        REAL,
                tp        REAL,
                r         REAL,
                pnl       REAL,
                opened_at TEXT NOT NULL,
                closed_at TEXT,
                extra     TEXT
            );
            CREATE TABLE IF NOT EXISTS map (
                axfl_id  TEXT NOT NULL,
                order_id TEXT NOT NULL,
                PRIMARY KEY (axfl_id, order_id)
            );
            CREATE TABLE IF NOT EXISTS events (
                id      INTEGER PRIMARY KEY AUTOINCREMENT,
                ts      TEXT NOT NULL,
                level   TEXT NOT NULL,
                kind    TEXT NOT NULL,
                payload TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_broker_orders_client_tag ON broker_orders(client_tag);
            CREATE INDEX IF NOT EXISTS idx_broker_orders_status ON broker_orders(status);
            CREATE INDEX IF NOT EXISTS idx_axfl_trades_closed_at ON axfl_trades(closed_at);
            CREATE INDEX IF NOT EXISTS idx_map_axfl_id ON map(axfl_id);
            CREATE INDEX IF NOT EXISTS idx_map_order_id ON map(order_id);
            CREATE INDEX IF NOT EXISTS idx_events_ts ON events(ts);
            "#,
        )
        .context("failed to initialise journal schema")?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Upserts
    // -------------------------------------------------------------------------

    /// Insert or update a broker order. Conflicting upserts only move
    /// `status`, `closed_at` and `extra`.
    pub fn upsert_broker_order(&self, rec: &BrokerOrderRec) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO broker_orders
                (order_id, client_tag, symbol, side, units, entry, sl, tp, status, opened_at, closed_at, extra)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(order_id) DO UPDATE SET
                status    = excluded.status,
                closed_at = excluded.closed_at,
                extra     = excluded.extra
            "#,
            params![
                rec.order_id,
                rec.client_tag,
                rec.symbol,
                rec.side.to_string(),
                rec.units,
                rec.entry,
                rec.sl,
                rec.tp,
                rec.status,
                rec.opened_at,
                rec.closed_at,
                json_text(&rec.extra),
            ],
        )
        .context("failed to upsert broker order")?;
        Ok(())
    }

    /// Insert or update a paper trade. Conflicting upserts only move `r`,
    /// `pnl`, `closed_at` and `extra`.
    pub fn upsert_axfl_trade(&self, rec: &AxflTradeRec) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO axfl_trades
                (axfl_id, symbol, strategy, side, entry, sl, tp, r, pnl, opened_at, closed_at, extra)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(axfl_id) DO UPDATE SET
                r         = excluded.r,
                pnl       = excluded.pnl,
                closed_at = excluded.closed_at,
                extra     = excluded.extra
            "#,
            params![
                rec.axfl_id,
                rec.symbol,
                rec.strategy,
                rec.side.to_string(),
                rec.entry,
                rec.sl,
                rec.tp,
                rec.r,
                rec.pnl,
                rec.opened_at,
                rec.closed_at,
                json_text(&rec.extra),
            ],
        )
        .context("failed to upsert paper trade")?;
        Ok(())
    }

    /// Link a paper trade to a broker order. Repeating the link is a no-op.
    pub fn link(&self, axfl_id: &str, order_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO map (axfl_id, order_id) VALUES (?1, ?2)",
            params![axfl_id, order_id],
        )
        .context("failed to link trade to order")?;
        Ok(())
    }

    /// Append a diagnostic event.
    pub fn log_event(&self, level: &str, kind: &str, payload: serde_json::Value) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO events (ts, level, kind, payload) VALUES (?1, ?2, ?3, ?4)",
            params![Utc::now(), level, kind, payload.to_string()],
        )
        .context("failed to append event")?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Every open broker order, every unclosed paper trade, and all mappings.
    pub fn open_positions(&self) -> Result<OpenState> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            "SELECT order_id, client_tag, symbol, side, units, entry, sl, tp, status, opened_at, closed_at, extra
             FROM broker_orders WHERE status = 'open' AND closed_at IS NULL",
        )?;
        let broker_orders = stmt
            .query_map([], row_to_broker_order)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = conn.prepare(
            "SELECT axfl_id, symbol, strategy, side, entry, sl, tp, r, pnl, opened_at, closed_at, extra
             FROM axfl_trades WHERE closed_at IS NULL",
        )?;
        let axfl_trades = stmt
            .query_map([], row_to_axfl_trade)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = conn.prepare("SELECT axfl_id, order_id FROM map")?;
        let mappings = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(OpenState {
            broker_orders,
            axfl_trades,
            mappings,
        })
    }

    /// The most recent `n` events, newest first.
    pub fn last_n_events(&self, n: u32) -> Result<Vec<EventRec>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, ts, level, kind, payload FROM events ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([n], |row| {
                let payload: Option<String> = row.get(4)?;
                Ok(EventRec {
                    id: row.get(0)?,
                    ts: row.get(1)?,
                    level: row.get(2)?,
                    kind: row.get(3)?,
                    payload: payload.and_then(|p| serde_json::from_str(&p).ok()),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Unclosed paper trades with no map row.
    pub fn pending_mappings(&self) -> Result<Vec<AxflTradeRec>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT a.axfl_id, a.symbol, a.strategy, a.side, a.entry, a.sl, a.tp, a.r, a.pnl, a.opened_at, a.closed_at, a.extra
             FROM axfl_trades a
             LEFT JOIN map m ON a.axfl_id = m.axfl_id
             WHERE m.order_id IS NULL AND a.closed_at IS NULL",
        )?;
        let rows = stmt
            .query_map([], row_to_axfl_trade)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Look up a broker order by its unique client tag.
    pub fn broker_order_by_tag(&self, client_tag: &str) -> Result<Option<BrokerOrderRec>> {
        let conn = self.conn.lock();
        let rec = conn
            .query_row(
                "SELECT order_id, client_tag, symbol, side, units, entry, sl, tp, status, opened_at, closed_at, extra
                 FROM broker_orders WHERE client_tag = ?1",
                params![client_tag],
                row_to_broker_order,
            )
            .optional()?;
        Ok(rec)
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

fn json_text(v: &Option<serde_json::Value>) -> Option<String> {
    v.as_ref().map(|v| v.to_string())
}

fn parse_side(s: String) -> Side {
    if s.eq_ignore_ascii_case("short") {
        Side::Short
    } else {
        Side::Long
    }
}

fn row_to_broker_order(row: &rusqlite::Row<'_>) -> rusqlite::Result<BrokerOrderRec> {
    let side: String = row.get(3)?;
    let extra: Option<String> = row.get(11)?;
    Ok(BrokerOrderRec {
        order_id: row.get(0)?,
        client_tag: row.get(1)?,
        symbol: row.get(2)?,
        side: parse_side(side),
        units: row.get(4)?,
        entry: row.get(5)?,
        sl: row.get(6)?,
        tp: row.get(7)?,
        status: row.get(8)?,
        opened_at: row.get(9)?,
        closed_at: row.get(10)?,
        extra: extra.and_then(|e| serde_json::from_str(&e).ok()),
    })
}

fn row_to_axfl_trade(row: &rusqlite::Row<'_>) -> rusqlite::Result<AxflTradeRec> {
    let side: String = row.get(3)?;
    let extra: Option<String> = row.get(11)?;
    Ok(AxflTradeRec {
        axfl_id: row.get(0)?,
        symbol: row.get(1)?,
        strategy: row.get(2)?,
        side: parse_side(side),
        entry: row.get(4)?,
        sl: row.get(5)?,
        tp: row.get(6)?,
        r: row.get(7)?,
        pnl: row.get(8)?,
        opened_at: row.get(9)?,
        closed_at: row.get(10)?,
        extra: extra.and_then(|e| serde_json::from_str(&e).ok()),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_trade(axfl_id: &str) -> AxflTradeRec {
        AxflTradeRec {
            axfl_id: axfl_id.to_string(),
            symbol: "EURUSD".to_string(),
            strategy: "ema_trend".to_string(),
            side: Side::Long,
            entry: 1.1000,
            sl: Some(1.0980),
            tp: Some(1.1040),
            r: None,
            pnl: None,
            opened_at: Utc::now(),
            closed_at: None,
            extra: Some(json!({"client_tag": "AXFL::ema_trend::EURUSD::x::y"})),
        }
    }

    fn sample_order(order_id: &str, tag: &str) -> BrokerOrderRec {
        BrokerOrderRec {
            order_id: order_id.to_string(),
            client_tag: tag.to_string(),
            symbol: "EURUSD".to_string(),
            side: Side::Long,
            units: 250_000,
            entry: Some(1.1000),
            sl: Some(1.0980),
            tp: None,
            status: "open".to_string(),
            opened_at: Some(Utc::now()),
            closed_at: None,
            extra: None,
        }
    }

    #[test]
    fn trade_upsert_is_idempotent() {
        let j = Journal::in_memory().unwrap();
        let t = sample_trade("t1");
        j.upsert_axfl_trade(&t).unwrap();
        j.upsert_axfl_trade(&t).unwrap();
        let open = j.open_positions().unwrap();
        assert_eq!(open.axfl_trades.len(), 1);
    }

    #[test]
    fn trade_upsert_updates_close_fields_only() {
        let j = Journal::in_memory().unwrap();
        let mut t = sample_trade("t1");
        j.upsert_axfl_trade(&t).unwrap();

        t.r = Some(-1.0);
        t.pnl = Some(-500.0);
        t.closed_at = Some(Utc::now());
        j.upsert_axfl_trade(&t).unwrap();

        let open = j.open_positions().unwrap();
        assert!(open.axfl_trades.is_empty(), "closed trade must leave the open set");
    }

    #[test]
    fn order_upsert_idempotent_and_close() {
        let j = Journal::in_memory().unwrap();
        let mut o = sample_order("o1", "tag-1");
        j.upsert_broker_order(&o).unwrap();
        j.upsert_broker_order(&o).unwrap();
        assert_eq!(j.open_positions().unwrap().broker_orders.len(), 1);

        o.status = "closed".to_string();
        o.closed_at = Some(Utc::now());
        j.upsert_broker_order(&o).unwrap();
        assert!(j.open_positions().unwrap().broker_orders.is_empty());
    }

    #[test]
    fn link_writes_single_row() {
        let j = Journal::in_memory().unwrap();
        j.link("t1", "o1").unwrap();
        j.link("t1", "o1").unwrap();
        let open = j.open_positions().unwrap();
        assert_eq!(open.mappings.len(), 1);
        assert_eq!(open.mappings[0], ("t1".to_string(), "o1".to_string()));
    }

    #[test]
    fn events_are_append_only_newest_first() {
        let j = Journal::in_memory().unwrap();
        j.log_event("INFO", "reconcile_start", json!({})).unwrap();
        j.log_event("WARN", "flatten_orphan", json!({"symbol": "EURUSD"}))
            .unwrap();
        let events = j.last_n_events(10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, "flatten_orphan");
        assert_eq!(events[1].kind, "reconcile_start");
        assert!(events[0].id > events[1].id);
    }

    #[test]
    fn pending_mappings_excludes_linked_and_closed() {
        let j = Journal::in_memory().unwrap();
        j.upsert_axfl_trade(&sample_trade("t1")).unwrap();
        j.upsert_axfl_trade(&sample_trade("t2")).unwrap();
        let mut closed = sample_trade("t3");
        closed.closed_at = Some(Utc::now());
        j.upsert_axfl_trade(&closed).unwrap();

        j.link("t1", "o1").unwrap();

        let pending = j.pending_mappings().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].axfl_id, "t2");
    }

    #[test]
    fn client_tag_lookup() {
        let j = Journal::in_memory().unwrap();
        j.upsert_broker_order(&sample_order("o1", "tag-1")).unwrap();
        let hit = j.broker_order_by_tag("tag-1").unwrap();
        assert_eq!(hit.unwrap().order_id, "o1");
        assert!(j.broker_order_by_tag("missing").unwrap().is_none());
    }

    #[test]
    fn extra_payload_round_trips() {
        let j = Journal::in_memory().unwrap();
        j.upsert_axfl_trade(&sample_trade("t1")).unwrap();
        let open = j.open_positions().unwrap();
        let extra = open.axfl_trades[0].extra.as_ref().unwrap();
        assert_eq!(
            extra["client_tag"].as_str().unwrap(),
            "AXFL::ema_trend::EURUSD::x::y"
        );
    }

    #[test]
    fn survives_reopen() {
        let dir = std::env::temp_dir().join(format!("axfl-journal-{}", std::process::id()));
        let path = dir.join("journal.db");
        {
            let j = Journal::open(&path).unwrap();
            j.upsert_axfl_trade(&sample_trade("t1")).unwrap();
        }
        {
            let j = Journal::open(&path).unwrap();
            let open = j.open_positions().unwrap();
            assert_eq!(open.axfl_trades.len(), 1);
        }
        let _ = std::fs::remove_dir_all(dir);
    }
}
