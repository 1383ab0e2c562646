// =============================================================================
// UTC session windows and calendar gates
// =============================================================================
//
// All session logic is minute-granular and UTC-anchored. A window is a
// half-open range [start, end): a bar stamped exactly at the end minute is
// outside, so back-to-back windows never overlap.
// =============================================================================

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};

/// A UTC trading window, e.g. London 07:00-10:00.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionWindow {
    pub start_h: u32,
    pub start_m: u32,
    pub end_h: u32,
    pub end_m: u32,
}

impl SessionWindow {
    pub fn new(start_h: u32, start_m: u32, end_h: u32, end_m: u32) -> Self {
        Self {
            start_h,
            start_m,
            end_h,
            end_m,
        }
    }

    /// Parse `"HH:MM"` start/end strings.
    pub fn parse(start: &str, end: &str) -> Result<Self> {
        let (start_h, start_m) = parse_hhmm(start)?;
        let (end_h, end_m) = parse_hhmm(end)?;
        Ok(Self::new(start_h, start_m, end_h, end_m))
    }

    /// Minute-granular containment: `start <= t < end`. Seconds are ignored.
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        let start_min = self.start_h * 60 + self.start_m;
        let end_min = self.end_h * 60 + self.end_m;
        let current_min = ts.hour() * 60 + ts.minute();
        start_min <= current_min && current_min < end_min
    }
}

impl std::fmt::Display for SessionWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:02}:{:02}-{:02}:{:02}",
            self.start_h, self.start_m, self.end_h, self.end_m
        )
    }
}

fn parse_hhmm(s: &str) -> Result<(u32, u32)> {
    let (h, m) = s
        .split_once(':')
        .with_context(|| format!("expected HH:MM, got '{s}'"))?;
    let h: u32 = h.trim().parse().with_context(|| format!("bad hour in '{s}'"))?;
    let m: u32 = m.trim().parse().with_context(|| format!("bad minute in '{s}'"))?;
    if h > 23 || m > 59 {
        bail!("time out of range: '{s}'");
    }
    Ok((h, m))
}

/// True if the timestamp falls inside any of the given windows.
pub fn in_any_window(ts: DateTime<Utc>, windows: &[SessionWindow]) -> bool {
    windows.iter().any(|w| w.contains(ts))
}

/// Saturday / Sunday gate (UTC).
pub fn is_weekend(ts: DateTime<Utc>) -> bool {
    matches!(ts.weekday(), Weekday::Sat | Weekday::Sun)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        // 2025-10-20 is a Monday.
        Utc.with_ymd_and_hms(2025, 10, 20, h, m, s).unwrap()
    }

    #[test]
    fn parse_hhmm_window() {
        let w = SessionWindow::parse("07:00", "10:00").unwrap();
        assert_eq!(w, SessionWindow::new(7, 0, 10, 0));
        assert_eq!(w.to_string(), "07:00-10:00");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(SessionWindow::parse("7", "10:00").is_err());
        assert!(SessionWindow::parse("25:00", "10:00").is_err());
        assert!(SessionWindow::parse("07:61", "10:00").is_err());
    }

    #[test]
    fn containment_is_half_open() {
        let w = SessionWindow::new(7, 0, 10, 0);
        assert!(!w.contains(at(6, 59, 59)));
        assert!(w.contains(at(7, 0, 0)));
        assert!(w.contains(at(9, 59, 0)));
        // Exactly at the end minute is outside.
        assert!(!w.contains(at(10, 0, 0)));
    }

    #[test]
    fn seconds_are_ignored() {
        let w = SessionWindow::new(12, 30, 16, 0);
        assert!(w.contains(at(12, 30, 59)));
        assert!(!w.contains(at(12, 29, 59)));
    }

    #[test]
    fn back_to_back_windows_do_not_overlap() {
        let a = SessionWindow::new(7, 0, 10, 0);
        let b = SessionWindow::new(10, 0, 12, 0);
        let boundary = at(10, 0, 0);
        assert!(!a.contains(boundary));
        assert!(b.contains(boundary));
    }

    #[test]
    fn any_window_union() {
        let windows = [
            SessionWindow::new(7, 0, 10, 0),
            SessionWindow::new(12, 30, 16, 0),
        ];
        assert!(in_any_window(at(8, 0, 0), &windows));
        assert!(in_any_window(at(13, 0, 0), &windows));
        assert!(!in_any_window(at(11, 0, 0), &windows));
    }

    #[test]
    fn weekend_gate() {
        let sat = Utc.with_ymd_and_hms(2025, 10, 18, 12, 0, 0).unwrap();
        let sun = Utc.with_ymd_and_hms(2025, 10, 19, 12, 0, 0).unwrap();
        let mon = Utc.with_ymd_and_hms(2025, 10, 20, 12, 0, 0).unwrap();
        assert!(is_weekend(sat));
        assert!(is_weekend(sun));
        assert!(!is_weekend(mon));
    }
}
