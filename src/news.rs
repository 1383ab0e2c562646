// =============================================================================
// Economic news calendar — padded blackout windows around high-impact events
// =============================================================================
//
// Events come from a CSV with columns:
//   date (YYYY-MM-DD), time_utc (HH:MM), currencies (comma-separated),
//   impact, title
//
// A blackout window expands an event by a before/after pad. A symbol is
// affected when its constituent currencies intersect the event's currencies;
// gold and silver count as USD-quoted.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::symbols::currencies;

/// One calendar event.
#[derive(Debug, Clone)]
pub struct NewsEvent {
    pub time: DateTime<Utc>,
    pub currencies: Vec<String>,
    pub impact: String,
    pub title: String,
}

/// An event expanded by its pads.
#[derive(Debug, Clone, Serialize)]
pub struct EventWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub event_time: DateTime<Utc>,
    pub currencies: Vec<String>,
    pub impact: String,
    pub title: String,
}

#[derive(Debug, Deserialize)]
struct EventRow {
    date: String,
    time_utc: String,
    currencies: String,
    impact: String,
    title: String,
}

/// Load events from CSV, sorted by time.
pub fn load_events_csv(path: impl AsRef<Path>) -> Result<Vec<NewsEvent>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("news events CSV not found: {}", path.display()))?;

    let mut events = Vec::new();
    for row in reader.deserialize() {
        let row: EventRow = row.context("malformed news CSV row")?;
        events.push(parse_event(&row)?);
    }
    events.sort_by_key(|e| e.time);
    Ok(events)
}

fn parse_event(row: &EventRow) -> Result<NewsEvent> {
    let date = NaiveDate::parse_from_str(row.date.trim(), "%Y-%m-%d")
        .with_context(|| format!("bad event date '{}'", row.date))?;
    let time = NaiveTime::parse_from_str(row.time_utc.trim(), "%H:%M")
        .with_context(|| format!("bad event time '{}'", row.time_utc))?;
    let currencies = row
        .currencies
        .split(',')
        .map(|c| c.trim().to_uppercase())
        .filter(|c| !c.is_empty())
        .collect();

    Ok(NewsEvent {
        time: Utc.from_utc_datetime(&date.and_time(time)),
        currencies,
        impact: row.impact.trim().to_lowercase(),
        title: row.title.trim().to_string(),
    })
}

/// Windows for every event in `[now, now + lookahead_h]`, each padded by
/// `before_m` / `after_m` minutes.
pub fn upcoming_windows(
    events: &[NewsEvent],
    now: DateTime<Utc>,
    before_m: i64,
    after_m: i64,
    lookahead_h: i64,
) -> Vec<EventWindow> {
    let horizon = now + Duration::hours(lookahead_h);
    events
        .iter()
        .filter(|e| e.time >= now && e.time <= horizon)
        .map(|e| EventWindow {
            start: e.time - Duration::minutes(before_m),
            end: e.time + Duration::minutes(after_m),
            event_time: e.time,
            currencies: e.currencies.clone(),
            impact: e.impact.clone(),
            title: e.title.clone(),
        })
        .collect()
}

/// Whether the symbol's currencies intersect the event's.
pub fn affects_symbol(symbol: &str, event_currencies: &[String]) -> bool {
    let own = currencies(symbol);
    event_currencies
        .iter()
        .any(|c| own.iter().any(|o| o.eq_ignore_ascii_case(c)))
}

/// True iff some window contains `now` and affects `symbol`.
pub fn is_in_event_window(symbol: &str, now: DateTime<Utc>, windows: &[EventWindow]) -> bool {
    windows
        .iter()
        .any(|w| w.start <= now && now <= w.end && affects_symbol(symbol, &w.currencies))
}
