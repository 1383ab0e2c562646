// =============================================================================
// Live tick feed — WebSocket reader with key rotation and a bounded buffer
// =============================================================================
//
// The reader runs on its own task and appends ticks to a bounded buffer; the
// dispatcher drains it on its own schedule. When the buffer overflows, the
// oldest ticks are dropped so a stalled dispatcher does not disconnect the
// feed.
//
// Connection rules:
//   - token in the query string, one subscribe message per symbol
//   - a server ping (or any message) resets the 30-second heartbeat;
//     silence beyond that forces a reconnect
//   - 429/403 rotates to the next credential
//   - reconnect back-off doubles up to 60 seconds
//   - after ~3 x |keys| consecutive failed connects the feed gives up and
//     the engine degrades to replay
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::symbols::{from_instrument, pip_size, venue_form};

const WS_URL: &str = "wss://ws.finnhub.io";
const HEARTBEAT_TIMEOUT_S: u64 = 30;
const MAX_BACKOFF_S: u64 = 60;
/// Default ceiling for the tick buffer before drop-oldest kicks in.
pub const DEFAULT_BUFFER_CAPACITY: usize = 10_000;

/// One market tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub symbol: String,
    pub time: DateTime<Utc>,
    pub bid: f64,
    pub ask: f64,
}

/// Single-producer / single-consumer bounded buffer with drop-oldest
/// semantics under one lock.
pub struct TickBuffer {
    inner: Mutex<VecDeque<Tick>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl TickBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, tick: Tick) {
        let mut buf = self.inner.lock();
        buf.push_back(tick);
        while buf.len() > self.capacity {
            buf.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Take everything currently buffered, FIFO order.
    pub fn drain(&self) -> Vec<Tick> {
        let mut buf = self.inner.lock();
        buf.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// State shared between the reader task and the dispatcher.
pub struct FeedState {
    pub buffer: TickBuffer,
    connected: AtomicBool,
    errors: AtomicU32,
    key_index: AtomicUsize,
    gave_up: AtomicBool,
}

/// Snapshot for the status record.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FeedStats {
    pub connected: bool,
    pub errors: u32,
    pub key_index: usize,
    pub buffer_len: usize,
    pub dropped_ticks: u64,
}

impl FeedState {
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            buffer: TickBuffer::new(buffer_capacity),
            connected: AtomicBool::new(false),
            errors: AtomicU32::new(0),
            key_index: AtomicUsize::new(0),
            gave_up: AtomicBool::new(false),
        }
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Set when the reader exhausted its connection attempts; the dispatcher
    /// should degrade to replay.
    pub fn gave_up(&self) -> bool {
        self.gave_up.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> FeedStats {
        FeedStats {
            connected: self.connected(),
            errors: self.errors.load(Ordering::Relaxed),
            key_index: self.key_index.load(Ordering::Relaxed),
            buffer_len: self.buffer.len(),
            dropped_ticks: self.buffer.dropped(),
        }
    }

    fn rotate_key(&self, key_count: usize) {
        let next = (self.key_index.load(Ordering::Relaxed) + 1) % key_count.max(1);
        self.key_index.store(next, Ordering::Relaxed);
        info!(key_index = next, "rotated feed credential");
    }
}

/// What one WebSocket text frame meant.
#[derive(Debug, PartialEq)]
enum Parsed {
    Ping,
    Trades(Vec<Tick>),
    Other,
}

/// Parse a feed message. Trade frames carry
/// `{"type":"trade","data":[{"s":"OANDA:EUR_USD","p":1.085,"t":ms}]}`; bid
/// and ask are approximated one pip around the trade price.
fn parse_message(text: &str) -> Parsed {
    let Ok(root) = serde_json::from_str::<Value>(text) else {
        return Parsed::Other;
    };
    match root["type"].as_str() {
        Some("ping") => Parsed::Ping,
        Some("trade") => {
            let mut ticks = Vec::new();
            for t in root["data"].as_array().into_iter().flatten() {
                let (Some(s), Some(p), Some(ms)) =
                    (t["s"].as_str(), t["p"].as_f64(), t["t"].as_i64())
                else {
                    continue;
                };
                let symbol = from_instrument(s);
                let Some(time) = Utc.timestamp_millis_opt(ms).single() else {
                    continue;
                };
                let half = pip_size(&symbol) / 2.0;
                ticks.push(Tick {
                    symbol,
                    time,
                    bid: p - half,
                    ask: p + half,
                });
            }
            Parsed::Trades(ticks)
        }
        _ => Parsed::Other,
    }
}

/// Run the reader until shutdown or give-up. Spawned as its own task.
pub async fn run_feed(
    state: Arc<FeedState>,
    venue: String,
    symbols: Vec<String>,
    api_keys: Vec<String>,
    shutdown: Arc<AtomicBool>,
) {
    if api_keys.is_empty() {
        warn!("no feed credentials configured, giving up immediately");
        state.gave_up.store(true, Ordering::Relaxed);
        return;
    }

    let max_failures = 3 * api_keys.len();
    let mut consecutive_failures = 0usize;
    let mut backoff_s = 1u64;

    while !shutdown.load(Ordering::Relaxed) {
        let key = &api_keys[state.key_index.load(Ordering::Relaxed) % api_keys.len()];
        let url = format!("{WS_URL}?token={key}");

        match connect_async(&url).await {
            Ok((ws_stream, _response)) => {
                consecutive_failures = 0;
                backoff_s = 1;
                state.connected.store(true, Ordering::Relaxed);
                info!(
                    key_index = state.key_index.load(Ordering::Relaxed),
                    "feed connected"
                );

                let (mut write, mut read) = ws_stream.split();

                let mut subscribe_failed = false;
                for symbol in &symbols {
                    let msg = json!({ "type": "subscribe", "symbol": venue_form(symbol, &venue) });
                    if let Err(e) = write.send(Message::Text(msg.to_string())).await {
                        error!(symbol = %symbol, error = %e, "subscribe failed");
                        state.errors.fetch_add(1, Ordering::Relaxed);
                        subscribe_failed = true;
                        break;
                    }
                    debug!(symbol = %symbol, "subscribed");
                }

                if !subscribe_failed {
                    let mut last_heartbeat = tokio::time::Instant::now();
                    loop {
                        if shutdown.load(Ordering::Relaxed) {
                            let _ = write.send(Message::Close(None)).await;
                            state.connected.store(false, Ordering::Relaxed);
                            return;
                        }

                        match tokio::time::timeout(
                            std::time::Duration::from_secs(1),
                            read.next(),
                        )
                        .await
                        {
                            Ok(Some(Ok(Message::Text(text)))) => match parse_message(&text) {
                                Parsed::Ping => last_heartbeat = tokio::time::Instant::now(),
                                Parsed::Trades(ticks) => {
                                    last_heartbeat = tokio::time::Instant::now();
                                    for tick in ticks {
                                        state.buffer.push(tick);
                                    }
                                }
                                Parsed::Other => {}
                            },
                            Ok(Some(Ok(Message::Ping(_)))) => {
                                last_heartbeat = tokio::time::Instant::now();
                            }
                            Ok(Some(Ok(_))) => {}
                            Ok(Some(Err(e))) => {
                                error!(error = %e, "feed read error");
                                state.errors.fetch_add(1, Ordering::Relaxed);
                                let msg = e.to_string();
                                if msg.contains("429") || msg.contains("403") {
                                    state.rotate_key(api_keys.len());
                                }
                                break;
                            }
                            Ok(None) => {
                                warn!("feed stream ended");
                                break;
                            }
                            Err(_) => {
                                if last_heartbeat.elapsed().as_secs() > HEARTBEAT_TIMEOUT_S {
                                    warn!("heartbeat missing, forcing reconnect");
                                    state.errors.fetch_add(1, Ordering::Relaxed);
                                    break;
                                }
                            }
                        }
                    }
                }

                state.connected.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                state.errors.fetch_add(1, Ordering::Relaxed);
                consecutive_failures += 1;
                let msg = e.to_string();
                if msg.contains("429") || msg.contains("403") {
                    state.rotate_key(api_keys.len());
                }
                if consecutive_failures >= max_failures {
                    error!(
                        attempts = consecutive_failures,
                        "feed unavailable, giving up"
                    );
                    state.gave_up.store(true, Ordering::Relaxed);
                    return;
                }
                warn!(
                    error = %msg,
                    attempt = consecutive_failures,
                    backoff_s,
                    "feed connect failed, retrying"
                );
                tokio::time::sleep(std::time::Duration::from_secs(backoff_s)).await;
                backoff_s = (backoff_s * 2).min(MAX_BACKOFF_S);
            }
        }
    }
    state.connected.store(false, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(symbol: &str, n: i64) -> Tick {
        Tick {
            symbol: symbol.to_string(),
            time: Utc.timestamp_millis_opt(1_760_000_000_000 + n).single().unwrap(),
            bid: 1.0,
            ask: 1.0002,
        }
    }

    #[test]
    fn buffer_drops_oldest_beyond_capacity() {
        let buf = TickBuffer::new(3);
        for i in 0..5 {
            buf.push(tick("EURUSD", i));
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.dropped(), 2);
        let drained = buf.drain();
        // The two oldest ticks are gone.
        assert_eq!(drained[0].time.timestamp_millis() % 1000, 2);
        assert!(buf.is_empty());
    }

    #[test]
    fn drain_preserves_fifo_order() {
        let buf = TickBuffer::new(100);
        for i in 0..10 {
            buf.push(tick("EURUSD", i));
        }
        let drained = buf.drain();
        for w in drained.windows(2) {
            assert!(w[0].time <= w[1].time);
        }
    }

    #[test]
    fn parse_ping() {
        assert_eq!(parse_message(r#"{"type":"ping"}"#), Parsed::Ping);
    }

    #[test]
    fn parse_trade_frame() {
        let text = r#"{"type":"trade","data":[
            {"s":"OANDA:EUR_USD","p":1.0850,"t":1760000000000,"v":1},
            {"s":"OANDA:XAU_USD","p":2650.5,"t":1760000000500,"v":1}
        ]}"#;
        let Parsed::Trades(ticks) = parse_message(text) else {
            panic!("expected trades");
        };
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].symbol, "EURUSD");
        // bid/ask straddle the trade price by half a pip.
        assert!(ticks[0].bid < 1.0850 && ticks[0].ask > 1.0850);
        assert!((ticks[0].ask - ticks[0].bid - 0.0001).abs() < 1e-9);
        assert_eq!(ticks[1].symbol, "XAUUSD");
        assert!((ticks[1].ask - ticks[1].bid - 0.1).abs() < 1e-9);
    }

    #[test]
    fn malformed_frames_are_other() {
        assert_eq!(parse_message("not json"), Parsed::Other);
        assert_eq!(parse_message(r#"{"type":"news"}"#), Parsed::Other);
        // Trade frame with garbage entries parses to an empty tick list.
        let Parsed::Trades(ticks) = parse_message(r#"{"type":"trade","data":[{"s":"X"}]}"#) else {
            panic!("expected trades");
        };
        assert!(ticks.is_empty());
    }

    #[test]
    fn feed_state_snapshot() {
        let state = FeedState::new(10);
        state.buffer.push(tick("EURUSD", 0));
        let stats = state.stats();
        assert!(!stats.connected);
        assert_eq!(stats.buffer_len, 1);
        assert_eq!(stats.errors, 0);
        assert!(!state.gave_up());
    }
}
