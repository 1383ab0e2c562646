// =============================================================================
// Notifier — bounded, best-effort event sink
// =============================================================================
//
// Events go into a bounded channel consumed by a background task that POSTs
// them to an optional webhook. Sends never block: a full queue drops the
// event and bumps a counter. Delivery failures are logged and forgotten;
// nothing here may affect trading.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct NotifyEvent {
    pub level: String,
    pub kind: String,
    pub payload: Value,
}

pub struct Notifier {
    tx: Option<mpsc::Sender<NotifyEvent>>,
    dropped: Arc<AtomicU64>,
}

impl Notifier {
    /// With a webhook URL the background sender is spawned; without one the
    /// notifier is a no-op sink.
    pub fn new(webhook_url: Option<String>) -> Self {
        let dropped = Arc::new(AtomicU64::new(0));
        let tx = webhook_url.map(|url| {
            let (tx, mut rx) = mpsc::channel::<NotifyEvent>(QUEUE_CAPACITY);
            tokio::spawn(async move {
                let client = reqwest::Client::builder()
                    .timeout(std::time::Duration::from_secs(10))
                    .build()
                    .expect("failed to build reqwest client");
                while let Some(event) = rx.recv().await {
                    match client.post(&url).json(&event).send().await {
                        Ok(resp) if resp.status().is_success() => {
                            debug!(kind = %event.kind, "notification delivered");
                        }
                        Ok(resp) => {
                            debug!(kind = %event.kind, status = %resp.status(), "notification rejected");
                        }
                        Err(e) => {
                            debug!(kind = %event.kind, error = %e, "notification failed");
                        }
                    }
                }
            });
            tx
        });
        Self { tx, dropped }
    }

    /// A sink that drops everything (tests, replay without a webhook).
    pub fn disabled() -> Self {
        Self {
            tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    fn send(&self, level: &str, kind: &str, payload: Value) {
        let Some(tx) = &self.tx else {
            return;
        };
        let event = NotifyEvent {
            level: level.to_string(),
            kind: kind.to_string(),
            payload,
        };
        if tx.try_send(event).is_err() {
            // Queue full or sender gone; trading must not wait on it.
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(kind, "notification dropped");
        }
    }

    pub fn info(&self, kind: &str, payload: Value) {
        self.send("INFO", kind, payload);
    }

    pub fn warn(&self, kind: &str, payload: Value) {
        self.send("WARN", kind, payload);
    }

    pub fn event(&self, kind: &str, payload: Value) {
        self.send("EVENT", kind, payload);
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("enabled", &self.tx.is_some())
            .field("dropped", &self.dropped())
            .finish()
    }
}
