// =============================================================================
// OANDA practice broker adapter — best-effort mirroring of paper trades
// =============================================================================
//
// The paper book is the source of truth. Every method here is defensive:
// failures are recorded in internal counters and returned as typed results,
// never propagated to the dispatcher.
//
// Idempotency: `place_market` first looks for a MARKET_ORDER transaction in
// the last 24 hours whose clientExtensions.tag equals the given client_tag.
// A hit short-circuits with the existing order id and `idempotent = true`.
//
// Environment: practice by default; live only when explicitly configured.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use crate::symbols;
use crate::types::Side;

/// Request timeout for every broker call.
const HTTP_TIMEOUT_S: u64 = 10;
/// How far back the idempotency lookup scans broker transactions.
const IDEMPOTENCY_WINDOW_H: i64 = 24;

/// Outcome of a market-order placement.
#[derive(Debug, Clone, Default)]
pub struct PlaceResult {
    pub success: bool,
    pub order_id: Option<String>,
    pub idempotent: bool,
    pub error: Option<String>,
}

/// Outcome of a position close.
#[derive(Debug, Clone, Default)]
pub struct CloseResult {
    pub success: bool,
    pub error: Option<String>,
}

/// Net position in one instrument.
#[derive(Debug, Clone)]
pub struct PositionInfo {
    pub size: f64,
    pub avg_price: f64,
    pub unrealized: f64,
}

/// One open position as enumerated by the broker.
#[derive(Debug, Clone)]
pub struct BrokerPosition {
    pub instrument: String,
    pub units: f64,
    pub avg_price: f64,
    pub unrealized: f64,
}

/// One fill / market-order transaction.
#[derive(Debug, Clone)]
pub struct BrokerTrade {
    pub id: String,
    pub kind: String,
    pub instrument: String,
    pub units: f64,
    pub price: f64,
    pub time: Option<DateTime<Utc>>,
    pub client_tag: Option<String>,
}

/// Minimal account snapshot.
#[derive(Debug, Clone, Default)]
pub struct AccountInfo {
    pub ok: bool,
    pub id: Option<String>,
    pub balance: f64,
    pub currency: Option<String>,
    pub error: Option<String>,
}

/// Connection health for the status record.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BrokerStats {
    pub connected: bool,
    pub errors: u32,
    pub last_error: Option<String>,
    pub env: String,
}

pub struct OandaClient {
    api_key: String,
    account_id: String,
    env: String,
    base_url: String,
    client: reqwest::Client,
    connected: AtomicBool,
    errors: AtomicU32,
    last_error: Mutex<Option<String>>,
}

impl OandaClient {
    /// Build a client for `env` (`practice` or `live`).
    pub fn new(
        api_key: impl Into<String>,
        account_id: impl Into<String>,
        env: impl Into<String>,
    ) -> Self {
        let env = env.into();
        let base_url = match env.as_str() {
            "live" => "https://api-fxtrade.oanda.com".to_string(),
            _ => "https://api-fxpractice.oanda.com".to_string(),
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(HTTP_TIMEOUT_S))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key: api_key.into(),
            account_id: account_id.into(),
            env,
            base_url,
            client,
            connected: AtomicBool::new(false),
            errors: AtomicU32::new(0),
            last_error: Mutex::new(None),
        }
    }

    fn record_error(&self, err: impl Into<String>) {
        let err = err.into();
        self.errors.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(err);
    }

    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> anyhow::Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .query(query)
            .send()
            .await?;
        let status = resp.status();
        let body: Value = resp.json().await?;
        if !status.is_success() {
            anyhow::bail!("HTTP {status}: {body}");
        }
        Ok(body)
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// Place a FOK market order with on-fill SL/TP, idempotent on
    /// `client_tag` within the last 24 hours.
    #[instrument(skip(self, sl, tp), name = "oanda::place_market")]
    pub async fn place_market(
        &self,
        symbol: &str,
        side: Side,
        units: i64,
        sl: Option<f64>,
        tp: Option<f64>,
        client_tag: &str,
    ) -> PlaceResult {
        // Idempotency probe first: a repeat of the same tag must not place a
        // second order.
        match self.find_order_by_client_tag(client_tag).await {
            Ok(Some(order_id)) => {
                debug!(client_tag, order_id = %order_id, "idempotent hit, reusing existing order");
                return PlaceResult {
                    success: true,
                    order_id: Some(order_id),
                    idempotent: true,
                    error: None,
                };
            }
            Ok(None) => {}
            Err(e) => {
                // Lookup failure is not fatal for placement; note and proceed.
                warn!(error = %e, "client-tag lookup failed before placement");
            }
        }

        let signed_units = match side {
            Side::Long => units,
            Side::Short => -units,
        };

        let mut order = json!({
            "type": "MARKET",
            "instrument": symbols::instrument(symbol),
            "units": signed_units.to_string(),
            "timeInForce": "FOK",
            "positionFill": "DEFAULT",
            "clientExtensions": { "tag": client_tag },
        });
        if let Some(sl) = sl {
            order["stopLossOnFill"] = json!({ "price": format!("{sl:.5}") });
        }
        if let Some(tp) = tp {
            order["takeProfitOnFill"] = json!({ "price": format!("{tp:.5}") });
        }

        let url = format!("{}/v3/accounts/{}/orders", self.base_url, self.account_id);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({ "order": order }))
            .send()
            .await;

        match resp {
            Ok(resp) => {
                let status = resp.status();
                let body: Value = match resp.json().await {
                    Ok(b) => b,
                    Err(e) => {
                        self.record_error(format!("order response parse failed: {e}"));
                        return PlaceResult {
                            error: Some(e.to_string()),
                            ..Default::default()
                        };
                    }
                };

                let result = interpret_order_response(status.as_u16(), &body);
                if result.success {
                    debug!(
                        symbol,
                        units,
                        order_id = result.order_id.as_deref().unwrap_or(""),
                        "broker order placed"
                    );
                } else {
                    self.record_error(result.error.clone().unwrap_or_default());
                }
                result
            }
            Err(e) => {
                self.record_error(e.to_string());
                PlaceResult {
                    error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        }
    }

    /// Flatten the symbol's net position (netting mode).
    #[instrument(skip(self), name = "oanda::close_all")]
    pub async fn close_all(&self, symbol: &str) -> CloseResult {
        let url = format!(
            "{}/v3/accounts/{}/positions/{}/close",
            self.base_url,
            self.account_id,
            symbols::instrument(symbol)
        );
        let resp = self
            .client
            .put(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({ "longUnits": "ALL", "shortUnits": "ALL" }))
            .send()
            .await;

        match resp {
            Ok(resp) if resp.status().is_success() => {
                debug!(symbol, "broker position closed");
                CloseResult {
                    success: true,
                    error: None,
                }
            }
            Ok(resp) => {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                let err = format!("HTTP {status}: {text}");
                self.record_error(err.clone());
                CloseResult {
                    success: false,
                    error: Some(err),
                }
            }
            Err(e) => {
                self.record_error(e.to_string());
                CloseResult {
                    success: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Lookups
    // -------------------------------------------------------------------------

    /// Net position for one symbol, `None` when flat or on error.
    #[instrument(skip(self), name = "oanda::fetch_position")]
    pub async fn fetch_position(&self, symbol: &str) -> Option<PositionInfo> {
        let path = format!(
            "/v3/accounts/{}/positions/{}",
            self.account_id,
            symbols::instrument(symbol)
        );
        match self.get_json(&path, &[]).await {
            Ok(body) => parse_position(&body["position"]),
            Err(e) => {
                self.record_error(e.to_string());
                None
            }
        }
    }

    /// Every non-zero open position.
    #[instrument(skip(self), name = "oanda::get_open_positions")]
    pub async fn get_open_positions(&self) -> Vec<BrokerPosition> {
        let path = format!("/v3/accounts/{}/openPositions", self.account_id);
        match self.get_json(&path, &[]).await {
            Ok(body) => parse_open_positions(&body),
            Err(e) => {
                self.record_error(e.to_string());
                Vec::new()
            }
        }
    }

    /// Fills and market orders since `since`.
    #[instrument(skip(self), name = "oanda::get_trades_since")]
    pub async fn get_trades_since(&self, since: DateTime<Utc>) -> Vec<BrokerTrade> {
        let path = format!("/v3/accounts/{}/transactions", self.account_id);
        let query = [("from", since.to_rfc3339())];
        match self.get_json(&path, &query).await {
            Ok(body) => parse_transactions(&body),
            Err(e) => {
                self.record_error(e.to_string());
                Vec::new()
            }
        }
    }

    async fn find_order_by_client_tag(&self, client_tag: &str) -> anyhow::Result<Option<String>> {
        let since = Utc::now() - Duration::hours(IDEMPOTENCY_WINDOW_H);
        let path = format!("/v3/accounts/{}/transactions", self.account_id);
        let query = [("from", since.to_rfc3339())];
        let body = self.get_json(&path, &query).await?;
        Ok(find_tag_in_transactions(&body, client_tag))
    }

    // -------------------------------------------------------------------------
    // Health
    // -------------------------------------------------------------------------

    /// Auth check; also refreshes the `connected` flag.
    #[instrument(skip(self), name = "oanda::ping_auth")]
    pub async fn ping_auth(&self) -> bool {
        let path = format!("/v3/accounts/{}", self.account_id);
        match self.get_json(&path, &[]).await {
            Ok(_) => {
                self.connected.store(true, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.connected.store(false, Ordering::Relaxed);
                self.record_error(e.to_string());
                false
            }
        }
    }

    /// Minimal account info; never raises.
    #[instrument(skip(self), name = "oanda::get_account")]
    pub async fn get_account(&self) -> AccountInfo {
        let path = format!("/v3/accounts/{}", self.account_id);
        match self.get_json(&path, &[]).await {
            Ok(body) => {
                let account = &body["account"];
                AccountInfo {
                    ok: true,
                    id: account["id"].as_str().map(String::from),
                    balance: account["balance"]
                        .as_str()
                        .and_then(|s| s.parse().ok())
                        .or_else(|| account["balance"].as_f64())
                        .unwrap_or(0.0),
                    currency: account["currency"].as_str().map(String::from),
                    error: None,
                }
            }
            Err(e) => {
                self.record_error(e.to_string());
                AccountInfo {
                    error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        }
    }

    pub fn get_stats(&self) -> BrokerStats {
        BrokerStats {
            connected: self.connected.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
            env: self.env.clone(),
        }
    }
}

impl std::fmt::Debug for OandaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OandaClient")
            .field("api_key", &"<redacted>")
            .field("account_id", &self.account_id)
            .field("env", &self.env)
            .field("base_url", &self.base_url)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Response interpretation (pure, testable)
// ---------------------------------------------------------------------------

/// Interpret an order-placement response. 200/201 with a fill transaction is
/// a fill; an order-create transaction alone still counts as success
/// (pending).
fn interpret_order_response(status: u16, body: &Value) -> PlaceResult {
    if !(status == 200 || status == 201) {
        return PlaceResult {
            error: Some(format!("HTTP {status}: {body}")),
            ..Default::default()
        };
    }
    if let Some(id) = body["orderFillTransaction"]["id"].as_str() {
        return PlaceResult {
            success: true,
            order_id: Some(id.to_string()),
            idempotent: false,
            error: None,
        };
    }
    if let Some(id) = body["orderCreateTransaction"]["id"].as_str() {
        return PlaceResult {
            success: true,
            order_id: Some(id.to_string()),
            idempotent: false,
            error: None,
        };
    }
    PlaceResult {
        error: Some("order placed but no transaction id".to_string()),
        ..Default::default()
    }
}

fn parse_position(position: &Value) -> Option<PositionInfo> {
    let long_units: f64 = position["long"]["units"]
        .as_str()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0);
    let short_units: f64 = position["short"]["units"]
        .as_str()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0);
    let net = long_units + short_units;
    if net == 0.0 {
        return None;
    }

    let side_key = if long_units != 0.0 { "long" } else { "short" };
    let avg_price = position[side_key]["averagePrice"]
        .as_str()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0);
    let unrealized = position["unrealizedPL"]
        .as_str()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0);

    Some(PositionInfo {
        size: net,
        avg_price,
        unrealized,
    })
}

fn parse_open_positions(body: &Value) -> Vec<BrokerPosition> {
    let mut out = Vec::new();
    for pos in body["positions"].as_array().into_iter().flatten() {
        let inst = pos["instrument"].as_str().unwrap_or("").to_string();
        if let Some(info) = parse_position(pos) {
            out.push(BrokerPosition {
                instrument: inst,
                units: info.size,
                avg_price: info.avg_price,
                unrealized: info.unrealized,
            });
        }
    }
    out
}

fn parse_transactions(body: &Value) -> Vec<BrokerTrade> {
    let mut out = Vec::new();
    for txn in body["transactions"].as_array().into_iter().flatten() {
        let kind = txn["type"].as_str().unwrap_or("");
        if kind != "ORDER_FILL" && kind != "MARKET_ORDER" {
            continue;
        }
        out.push(BrokerTrade {
            id: txn["id"].as_str().unwrap_or("").to_string(),
            kind: kind.to_string(),
            instrument: txn["instrument"].as_str().unwrap_or("").to_string(),
            units: txn["units"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0),
            price: txn["price"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0),
            time: txn["time"]
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc)),
            client_tag: txn["clientExtensions"]["tag"].as_str().map(String::from),
        });
    }
    out
}

fn find_tag_in_transactions(body: &Value, client_tag: &str) -> Option<String> {
    for txn in body["transactions"].as_array().into_iter().flatten() {
        if txn["type"].as_str() == Some("MARKET_ORDER")
            && txn["clientExtensions"]["tag"].as_str() == Some(client_tag)
        {
            return txn["id"].as_str().map(String::from);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
