//! Calendar math for the daily jobs.
//!
//! Everything here is pure: callers pass `now` and a zone, nothing reads the clock.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Wall-clock `hour:minute:00` in some zone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct DailyTime {
    hour: u32,
    minute: u32,
}

impl DailyTime {
    /// Panics on an out-of-range hour or minute; in a `const` this fails the build.
    pub const fn new(hour: u32, minute: u32) -> Self {
        assert!(hour < 24, "hour out of range");
        assert!(minute < 60, "minute out of range");
        Self { hour, minute }
    }

    /// This time of day on `date` in `zone`.
    pub fn on(&self, zone: &Tz, date: NaiveDate) -> DateTime<Tz> {
        let time = NaiveTime::MIN + Duration::minutes(i64::from(self.hour * 60 + self.minute));
        let naive = date.and_time(time);
        // Gap (spring-forward): fall back to reading the wall time as UTC.
        zone.from_local_datetime(&naive)
            .earliest()
            .unwrap_or_else(|| zone.from_utc_datetime(&naive))
    }
}

/// Daily half-open range `[start, end)` in local wall-clock time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    pub start: DailyTime,
    pub end: DailyTime,
}

impl Window {
    pub const fn new(start: DailyTime, end: DailyTime) -> Self {
        Self { start, end }
    }

    /// Today's window bounds, "today" being the calendar day of `now` in `zone`.
    pub fn bounds(&self, now: DateTime<Utc>, zone: &Tz) -> (DateTime<Tz>, DateTime<Tz>) {
        let today = now.with_timezone(zone).date_naive();
        (self.start.on(zone, today), self.end.on(zone, today))
    }

    pub fn contains(&self, now: DateTime<Utc>, zone: &Tz) -> bool {
        let (start, end) = self.bounds(now, zone);
        start <= now && now < end
    }
}

/// Next `at` in `zone` strictly after `now`.
pub fn next_trigger(now: DateTime<Utc>, zone: &Tz, at: DailyTime) -> DateTime<Tz> {
    let today = now.with_timezone(zone).date_naive();
    let scheduled = at.on(zone, today);
    if now < scheduled {
        return scheduled;
    }
    match today.succ_opt() {
        Some(tomorrow) => at.on(zone, tomorrow),
        None => scheduled + Duration::days(1),
    }
}

/// First cleanup trigger after process start.
///
/// Inside the window and already past today's trigger: fire now. Inside the
/// window but early: today's trigger. Outside the window: the next trigger.
pub fn first_cleanup_trigger(
    now: DateTime<Utc>,
    zone: &Tz,
    at: DailyTime,
    window: Window,
) -> DateTime<Tz> {
    if !window.contains(now, zone) {
        return next_trigger(now, zone, at);
    }
    let scheduled_today = at.on(zone, now.with_timezone(zone).date_naive());
    if now >= scheduled_today {
        return now.with_timezone(zone);
    }
    scheduled_today
}

/// First provision trigger after process start: today's trigger if it is
/// still ahead, otherwise fire now.
pub fn first_provision_trigger(now: DateTime<Utc>, zone: &Tz, at: DailyTime) -> DateTime<Tz> {
    let scheduled_today = at.on(zone, now.with_timezone(zone).date_naive());
    if now < scheduled_today {
        return scheduled_today;
    }
    now.with_timezone(zone)
}
