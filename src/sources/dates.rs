//! Report dates as Vital Knowledge prints them, in US/Eastern time.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use chrono_tz::{Tz, US::Eastern};

const DATE_TIME_FORMATS: [&str; 2] = ["%b %d, %Y %I:%M %p", "%B %d, %Y %I:%M %p"];
const DATE_FORMATS: [&str; 2] = ["%b %d, %Y", "%B %d, %Y"];

/// Parse `"Dec 3, 2025 05:20 AM"` style strings. Full month names work too,
/// and a string whose first three words form a date parses as midnight.
pub fn parse_report_date(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    for fmt in DATE_TIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt);
        }
    }
    let date_part = raw.split_whitespace().take(3).collect::<Vec<_>>().join(" ");
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&date_part, fmt).ok())
        .map(|d| d.and_time(NaiveTime::MIN))
}

/// Inclusive window of report times a run cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: DateTime<Tz>,
    pub end: DateTime<Tz>,
}

impl DateWindow {
    /// From noon Eastern `days_back` days ago up to `now`.
    pub fn lookback(now: DateTime<Tz>, days_back: u32) -> Self {
        let start_day = (now - Duration::days(i64::from(days_back))).date_naive();
        let noon = start_day.and_time(NaiveTime::from_hms_opt(12, 0, 0).unwrap_or(NaiveTime::MIN));
        let start = Eastern
            .from_local_datetime(&noon)
            .earliest()
            .unwrap_or_else(|| now - Duration::days(i64::from(days_back)));
        Self { start, end: now }
    }

    pub fn lookback_from_now(days_back: u32) -> Self {
        Self::lookback(chrono::Utc::now().with_timezone(&Eastern), days_back)
    }

    /// Whether a naive report time, read as Eastern, falls inside the window.
    pub fn contains(&self, local: NaiveDateTime) -> bool {
        match Eastern.from_local_datetime(&local).earliest() {
            Some(at) => self.start <= at && at <= self.end,
            None => false,
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "{} to {}",
            self.start.format("%Y-%m-%d %H:%M ET"),
            self.end.format("%Y-%m-%d %H:%M ET")
        )
    }
}
