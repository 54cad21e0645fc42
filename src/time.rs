use chrono::{DateTime, Duration, Local, NaiveDateTime, TimeZone, Timelike, Utc};
use std::fmt::Display;

use crate::data::DayKey;

pub const MIN_SYNC_DAYS: i64 = 1;
pub const MAX_SYNC_DAYS: i64 = 30;
pub const DEFAULT_SYNC_DAYS: i64 = 7;

/// Local hour at which "last night" begins.
const LAST_NIGHT_HOUR: u32 = 20;

pub fn clamp_sync_days(days: i64) -> i64 {
    days.clamp(MIN_SYNC_DAYS, MAX_SYNC_DAYS)
}

/// Half-open query range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The look-back window ending at `now`, with `days` clamped first.
    pub fn last_days(now: DateTime<Utc>, days: i64) -> Self {
        Self::new(now - Duration::days(clamp_sync_days(days)), now)
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        start < self.end && end > self.start
    }
}

pub fn day_key<Tz>(tz: &Tz, at: DateTime<Utc>) -> DayKey
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    at.with_timezone(tz).format("%Y-%m-%d").to_string()
}

/// From 20:00 local on the most recent evening that has started, until `now`.
pub fn last_night_window<Tz: TimeZone>(tz: &Tz, now: DateTime<Utc>) -> TimeWindow {
    let local_now = now.with_timezone(tz);
    let today = local_now.date_naive();
    let anchor_day = if local_now.hour() >= LAST_NIGHT_HOUR {
        today
    } else {
        today.pred_opt().unwrap_or(today)
    };
    let anchor = anchor_day.and_time(local_hour(LAST_NIGHT_HOUR));
    TimeWindow::new(resolve_local(tz, anchor), now)
}

/// Local midnight today until 24 hours later.
pub fn today_window<Tz: TimeZone>(tz: &Tz, now: DateTime<Utc>) -> TimeWindow {
    let midnight = now.with_timezone(tz).date_naive().and_time(local_hour(0));
    let start = resolve_local(tz, midnight);
    TimeWindow::new(start, start + Duration::hours(24))
}

fn local_hour(hour: u32) -> chrono::NaiveTime {
    chrono::NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or(chrono::NaiveTime::MIN)
}

/// Local wall time to an instant; times skipped by a DST jump move forward.
fn resolve_local<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}

/// `3660 -> "1h 1m"`, `59 -> "0m"`.
pub fn format_duration(seconds: i64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m", minutes)
    }
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Epoch milliseconds as local `HH:MM:SS dd/mm/YYYY`, or "Never" for 0.
pub fn format_timestamp_ms(ms: i64) -> String {
    if ms == 0 {
        return "Never".to_string();
    }
    match Utc.timestamp_millis_opt(ms).single() {
        Some(at) => at.with_timezone(&Local).format("%H:%M:%S %d/%m/%Y").to_string(),
        None => "Never".to_string(),
    }
}
