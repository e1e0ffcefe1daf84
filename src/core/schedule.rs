//! Wall-clock admission predicates.
//!
//! Three independent predicates ANDed together: date range, weekday set and
//! time-of-day window. A missing predicate is vacuously true.

use std::collections::HashSet;

use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveTime, Timelike, Weekday};

/// Which schedule predicate rejected the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleDenial {
    Date,
    Day,
    Time,
}

impl ScheduleDenial {
    /// Human-readable denial reason for log lines.
    pub fn reason(&self) -> &'static str {
        match self {
            ScheduleDenial::Date => "connection not allowed on this date",
            ScheduleDenial::Day => "connection not allowed on this day",
            ScheduleDenial::Time => "connection not allowed at this time",
        }
    }
}

/// Immutable schedule compiled from configuration.
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    /// Inclusive [start, end] date range in local time.
    pub date_range: Option<(NaiveDate, NaiveDate)>,
    /// Allowed weekdays; empty means any day.
    pub days: HashSet<Weekday>,
    /// Inclusive [start, end] time-of-day window; wraps midnight when
    /// start >= end.
    pub window: Option<(NaiveTime, NaiveTime)>,
}

impl Schedule {
    /// True when no predicate is configured.
    pub fn is_empty(&self) -> bool {
        self.date_range.is_none() && self.days.is_empty() && self.window.is_none()
    }

    /// Evaluate all predicates at `now`, returning the first failure.
    pub fn evaluate(&self, now: DateTime<Local>) -> Result<(), ScheduleDenial> {
        if let Some((start, end)) = self.date_range {
            let today = now.date_naive();
            if today < start || today > end {
                return Err(ScheduleDenial::Date);
            }
        }
        if !self.days.is_empty() && !self.days.contains(&now.weekday()) {
            return Err(ScheduleDenial::Day);
        }
        if let Some((start, end)) = self.window {
            if !time_in_window(start, end, now.time()) {
                return Err(ScheduleDenial::Time);
            }
        }
        Ok(())
    }
}

/// Inclusive window membership with midnight wrap-around.
///
/// Comparison is on whole minutes; seconds are ignored like the HH:MM
/// configuration format.
pub fn time_in_window(start: NaiveTime, end: NaiveTime, now: NaiveTime) -> bool {
    let t = truncate_to_minute(now);
    let start = truncate_to_minute(start);
    let end = truncate_to_minute(end);
    if start < end {
        start <= t && t <= end
    } else {
        t >= start || t <= end
    }
}

fn truncate_to_minute(t: NaiveTime) -> NaiveTime {
    NaiveTime::from_hms_opt(t.hour(), t.minute(), 0).unwrap_or(t)
}
