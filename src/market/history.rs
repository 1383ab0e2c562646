// =============================================================================
// Historical 1-minute bar loaders — TwelveData / Finnhub / Yahoo fallback
// =============================================================================
//
// Warm-up and replay both pull 1-minute bars through here. Under `auto` the
// sources are tried in order (twelvedata, finnhub, yahoo) and the first one
// that returns data wins; a symbol fails only when every source fails.
// Credentials come from the environment as comma-separated key lists and
// rotate on rate limits.
// =============================================================================

use anyhow::{bail, Context, Result};
use chrono::{Duration, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::market::Bar;
use crate::symbols::{slash_form, suffix_form, venue_form};

const HTTP_TIMEOUT_S: u64 = 20;

pub struct HistoryProvider {
    source: String,
    venue: String,
    client: reqwest::Client,
    twelvedata_keys: Vec<String>,
    finnhub_keys: Vec<String>,
    /// Which provider actually served the last successful request.
    pub last_source_used: Option<String>,
    pub last_symbol_used: Option<String>,
}

impl HistoryProvider {
    pub fn new(source: impl Into<String>, venue: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(HTTP_TIMEOUT_S))
            .build()
            .expect("failed to build reqwest client");

        Self {
            source: source.into(),
            venue: venue.into(),
            client,
            twelvedata_keys: keys_from_env("TWELVEDATA_API_KEYS"),
            finnhub_keys: keys_from_env("FINNHUB_API_KEYS"),
            last_source_used: None,
            last_symbol_used: None,
        }
    }

    /// Fetch `days` of 1-minute bars for `symbol`, oldest first.
    pub async fn intraday_1m(&mut self, symbol: &str, days: u32) -> Result<Vec<Bar>> {
        let order: Vec<&str> = match self.source.as_str() {
            "twelvedata" => vec!["twelvedata"],
            "finnhub" => vec!["finnhub"],
            "yfinance" | "yf" => vec!["yfinance"],
            _ => vec!["twelvedata", "finnhub", "yfinance"],
        };

        let mut last_err = None;
        for source in order {
            let result = match source {
                "twelvedata" => self.fetch_twelvedata(symbol, days).await,
                "finnhub" => self.fetch_finnhub(symbol, days).await,
                _ => self.fetch_yahoo(symbol, days).await,
            };
            match result {
                Ok(bars) if !bars.is_empty() => {
                    info!(symbol, source, bars = bars.len(), "history loaded");
                    self.last_source_used = Some(source.to_string());
                    return Ok(bars);
                }
                Ok(_) => {
                    warn!(symbol, source, "history source returned no bars");
                    last_err = Some(anyhow::anyhow!("{source} returned no bars"));
                }
                Err(e) => {
                    warn!(symbol, source, error = %e, "history source failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no history source configured")))
            .with_context(|| format!("all history sources failed for {symbol}"))
    }

    async fn fetch_twelvedata(&mut self, symbol: &str, days: u32) -> Result<Vec<Bar>> {
        if self.twelvedata_keys.is_empty() {
            bail!("TWELVEDATA_API_KEYS not set");
        }
        let td_symbol = slash_form(symbol);
        // Keys rotate on rate limits: try each once.
        let keys = self.twelvedata_keys.clone();
        let mut last_err = None;
        for key in &keys {
            let url = "https://api.twelvedata.com/time_series";
            let outputsize = (days as u64 * 1440).min(5000).to_string();
            let resp = self
                .client
                .get(url)
                .query(&[
                    ("symbol", td_symbol.as_str()),
                    ("interval", "1min"),
                    ("outputsize", outputsize.as_str()),
                    ("timezone", "UTC"),
                    ("apikey", key.as_str()),
                ])
                .send()
                .await
                .context("twelvedata request failed")?;
            let status = resp.status();
            let body: Value = resp.json().await.context("twelvedata parse failed")?;

            if status.as_u16() == 429 || body["code"].as_u64() == Some(429) {
                debug!(symbol, "twelvedata rate limited, rotating key");
                last_err = Some(anyhow::anyhow!("twelvedata rate limited"));
                continue;
            }
            if !status.is_success() {
                bail!("twelvedata HTTP {status}: {body}");
            }
            self.last_symbol_used = Some(td_symbol.clone());
            return parse_twelvedata(&body);
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("twelvedata failed")))
    }

    async fn fetch_finnhub(&mut self, symbol: &str, days: u32) -> Result<Vec<Bar>> {
        if self.finnhub_keys.is_empty() {
            bail!("FINNHUB_API_KEYS not set");
        }
        let fh_symbol = venue_form(symbol, &self.venue);
        let to = Utc::now().timestamp();
        let from = (Utc::now() - Duration::days(days as i64)).timestamp();

        let keys = self.finnhub_keys.clone();
        let mut last_err = None;
        for key in &keys {
            let url = "https://finnhub.io/api/v1/forex/candle";
            let resp = self
                .client
                .get(url)
                .query(&[
                    ("symbol", fh_symbol.as_str()),
                    ("resolution", "1"),
                    ("from", from.to_string().as_str()),
                    ("to", to.to_string().as_str()),
                    ("token", key.as_str()),
                ])
                .send()
                .await
                .context("finnhub request failed")?;
            let status = resp.status();
            if status.as_u16() == 429 || status.as_u16() == 403 {
                debug!(symbol, "finnhub rate limited, rotating key");
                last_err = Some(anyhow::anyhow!("finnhub rate limited"));
                continue;
            }
            let body: Value = resp.json().await.context("finnhub parse failed")?;
            if !status.is_success() {
                bail!("finnhub HTTP {status}: {body}");
            }
            self.last_symbol_used = Some(fh_symbol.clone());
            return parse_finnhub(&body);
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("finnhub failed")))
    }

    async fn fetch_yahoo(&mut self, symbol: &str, days: u32) -> Result<Vec<Bar>> {
        let yf_symbol = suffix_form(symbol);
        let url = format!("https://query1.finance.yahoo.com/v8/finance/chart/{yf_symbol}");
        let range = format!("{}d", days.clamp(1, 7));
        let resp = self
            .client
            .get(&url)
            .query(&[("interval", "1m"), ("range", range.as_str())])
            .send()
            .await
            .context("yahoo request failed")?;
        let status = resp.status();
        let body: Value = resp.json().await.context("yahoo parse failed")?;
        if !status.is_success() {
            bail!("yahoo HTTP {status}: {body}");
        }
        self.last_symbol_used = Some(yf_symbol);
        parse_yahoo(&body)
    }
}

impl std::fmt::Debug for HistoryProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryProvider")
            .field("source", &self.source)
            .field("venue", &self.venue)
            .field("twelvedata_keys", &self.twelvedata_keys.len())
            .field("finnhub_keys", &self.finnhub_keys.len())
            .finish()
    }
}

fn keys_from_env(var: &str) -> Vec<String> {
    std::env::var(var)
        .unwrap_or_default()
        .split(',')
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect()
}

// ---------------------------------------------------------------------------
// Response parsing (pure, testable)
// ---------------------------------------------------------------------------

/// TwelveData time_series: `values` newest-first with string OHLC.
fn parse_twelvedata(body: &Value) -> Result<Vec<Bar>> {
    if body["status"].as_str() == Some("error") {
        bail!("twelvedata error: {}", body["message"]);
    }
    let values = body["values"]
        .as_array()
        .context("twelvedata response missing 'values'")?;

    let mut bars = Vec::with_capacity(values.len());
    for v in values {
        let dt = v["datetime"].as_str().context("missing datetime")?;
        let naive = NaiveDateTime::parse_from_str(dt, "%Y-%m-%d %H:%M:%S")
            .with_context(|| format!("bad twelvedata datetime '{dt}'"))?;
        bars.push(Bar::new(
            Utc.from_utc_datetime(&naive),
            str_f64(&v["open"])?,
            str_f64(&v["high"])?,
            str_f64(&v["low"])?,
            str_f64(&v["close"])?,
            v["volume"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0),
        ));
    }
    bars.sort_by_key(|b| b.time);
    Ok(bars)
}

/// Finnhub forex candle: parallel arrays, `s == "ok"`.
fn parse_finnhub(body: &Value) -> Result<Vec<Bar>> {
    match body["s"].as_str() {
        Some("ok") => {}
        Some("no_data") => return Ok(Vec::new()),
        other => bail!("finnhub status {:?}", other),
    }
    let t = body["t"].as_array().context("missing t")?;
    let o = body["o"].as_array().context("missing o")?;
    let h = body["h"].as_array().context("missing h")?;
    let l = body["l"].as_array().context("missing l")?;
    let c = body["c"].as_array().context("missing c")?;

    let mut bars = Vec::with_capacity(t.len());
    for i in 0..t.len() {
        let ts = t[i].as_i64().context("bad timestamp")?;
        let time = Utc
            .timestamp_opt(ts, 0)
            .single()
            .context("timestamp out of range")?;
        bars.push(Bar::new(
            time,
            o.get(i).and_then(Value::as_f64).context("bad open")?,
            h.get(i).and_then(Value::as_f64).context("bad high")?,
            l.get(i).and_then(Value::as_f64).context("bad low")?,
            c.get(i).and_then(Value::as_f64).context("bad close")?,
            body["v"]
                .as_array()
                .and_then(|v| v.get(i))
                .and_then(Value::as_u64)
                .unwrap_or(0),
        ));
    }
    bars.sort_by_key(|b| b.time);
    Ok(bars)
}

/// Yahoo chart API: timestamps + quote arrays with possible nulls.
fn parse_yahoo(body: &Value) -> Result<Vec<Bar>> {
    let result = &body["chart"]["result"][0];
    if result.is_null() {
        bail!("yahoo chart response empty: {}", body["chart"]["error"]);
    }
    let timestamps = result["timestamp"].as_array().context("missing timestamp")?;
    let quote = &result["indicators"]["quote"][0];

    let mut bars = Vec::with_capacity(timestamps.len());
    for (i, ts) in timestamps.iter().enumerate() {
        let (Some(ts), Some(open), Some(high), Some(low), Some(close)) = (
            ts.as_i64(),
            quote["open"][i].as_f64(),
            quote["high"][i].as_f64(),
            quote["low"][i].as_f64(),
            quote["close"][i].as_f64(),
        ) else {
            // Yahoo pads gaps with nulls.
            continue;
        };
        let time = Utc
            .timestamp_opt(ts, 0)
            .single()
            .context("timestamp out of range")?;
        bars.push(Bar::new(
            time,
            open,
            high,
            low,
            close,
            quote["volume"][i].as_u64().unwrap_or(0),
        ));
    }
    bars.sort_by_key(|b| b.time);
    Ok(bars)
}

fn str_f64(v: &Value) -> Result<f64> {
    if let Some(s) = v.as_str() {
        s.parse()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = v.as_f64() {
        Ok(n)
    } else {
        bail!("expected string or number, got: {v}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn twelvedata_parses_and_sorts_ascending() {
        let body = json!({
            "meta": { "symbol": "EUR/USD" },
            "values": [
                { "datetime": "2025-10-20 09:02:00", "open": "1.1002", "high": "1.1003", "low": "1.1001", "close": "1.1002" },
                { "datetime": "2025-10-20 09:01:00", "open": "1.1000", "high": "1.1002", "low": "1.0999", "close": "1.1001" }
            ],
            "status": "ok"
        });
        let bars = parse_twelvedata(&body).unwrap();
        assert_eq!(bars.len(), 2);
        assert!(bars[0].time < bars[1].time);
        assert!((bars[0].open - 1.1000).abs() < 1e-9);
    }

    #[test]
    fn twelvedata_error_status_fails() {
        let body = json!({ "status": "error", "message": "invalid api key" });
        assert!(parse_twelvedata(&body).is_err());
    }

    #[test]
    fn finnhub_parses_parallel_arrays() {
        let body = json!({
            "s": "ok",
            "t": [1760950800, 1760950860],
            "o": [1.1000, 1.1001],
            "h": [1.1002, 1.1003],
            "l": [1.0999, 1.1000],
            "c": [1.1001, 1.1002],
            "v": [10, 12]
        });
        let bars = parse_finnhub(&body).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].volume, 10);
        assert!(bars[0].time < bars[1].time);
    }

    #[test]
    fn finnhub_no_data_is_empty_not_error() {
        let body = json!({ "s": "no_data" });
        assert!(parse_finnhub(&body).unwrap().is_empty());
    }

    #[test]
    fn yahoo_skips_null_rows() {
        let body = json!({
            "chart": {
                "result": [{
                    "timestamp": [1760950800, 1760950860, 1760950920],
                    "indicators": { "quote": [{
                        "open":  [1.10, null, 1.12],
                        "high":  [1.11, null, 1.13],
                        "low":   [1.09, null, 1.11],
                        "close": [1.105, null, 1.125],
                        "volume": [0, null, 0]
                    }]}
                }]
            }
        });
        let bars = parse_yahoo(&body).unwrap();
        assert_eq!(bars.len(), 2);
    }

    #[test]
    fn yahoo_empty_result_fails() {
        let body = json!({ "chart": { "result": null, "error": { "code": "Not Found" } } });
        assert!(parse_yahoo(&body).is_err());
    }
}
