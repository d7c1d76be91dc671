// =============================================================================
// Trading calendar — external collaborator, spec §1/§6
// =============================================================================
//
// The HK trading calendar computation itself is out of scope (spec §1); we
// define the narrow capability the engine actually consumes — is this date a
// trading day / half day, and how many trading minutes elapsed between two
// instants — and a simple pluggable implementation. A production deployment
// would back this with the broker's `is_trading_day`/`get_trading_days`
// (spec §6 Quote context) rather than the fixed session windows used here.
// =============================================================================

use std::collections::HashSet;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc, Weekday};

/// Hong Kong is UTC+8 year-round (no daylight saving).
const HK_OFFSET_HOURS: i64 = 8;

/// Pluggable trading-calendar snapshot, spec §3 `trading_calendar_snapshot`.
pub trait TradingCalendar: Send + Sync {
    fn is_trading_day(&self, date: NaiveDate) -> bool;
    fn is_half_day(&self, date: NaiveDate) -> bool;

    /// Trading minutes elapsed strictly between `from` and `to` (both UTC),
    /// counting only time inside the morning/afternoon sessions of trading
    /// days. Used by the order recorder's smart-close stage-2 timeout (spec
    /// §4.3) to measure "elapsed" in trading time rather than wall time.
    fn elapsed_trading_minutes(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
        if to <= from {
            return 0;
        }

        let mut total = Duration::zero();
        let mut day = from.date_naive();
        let last_day = to.date_naive();

        while day <= last_day {
            if self.is_trading_day(day) {
                for (start, end) in self.sessions(day) {
                    let window_start = start.max(from);
                    let window_end = end.min(to);
                    if window_end > window_start {
                        total += window_end - window_start;
                    }
                }
            }
            day = day.succ_opt().expect("date overflow");
        }

        total.num_minutes()
    }

    /// Morning/afternoon session windows (UTC) for `date`. A half day omits
    /// the afternoon session.
    fn sessions(&self, date: NaiveDate) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        let morning = hk_time_on(date, 9, 30)..hk_time_on(date, 12, 0);
        let mut windows = vec![(morning.start, morning.end)];
        if !self.is_half_day(date) {
            let afternoon = hk_time_on(date, 13, 0)..hk_time_on(date, 16, 0);
            windows.push((afternoon.start, afternoon.end));
        }
        windows
    }
}

fn hk_time_on(date: NaiveDate, hour: u32, minute: u32) -> DateTime<Utc> {
    let naive = date
        .and_time(NaiveTime::from_hms_opt(hour, minute, 0).expect("valid time"))
        - Duration::hours(HK_OFFSET_HOURS);
    Utc.from_utc_datetime(&naive)
}

/// Whether `now` falls inside a continuous HK trading session (spec §4.11
/// step 2, `is_continuous_hk_session`). Does not consult holidays — callers
/// pass a calendar-aware day check separately via `is_trading_day`.
pub fn is_continuous_hk_session(now: DateTime<Utc>, is_half_day: bool) -> bool {
    let date = now.date_naive();
    let morning = hk_time_on(date, 9, 30)..hk_time_on(date, 12, 0);
    if morning.contains(&now) {
        return true;
    }
    let afternoon_end_hour = 16;
    let afternoon = hk_time_on(date, 13, 0)..hk_time_on(date, afternoon_end_hour, 0);
    if is_half_day {
        // Half days close at noon; there is no afternoon session.
        return false;
    }
    afternoon.contains(&now)
}

/// A calendar driven by an explicit holiday/half-day set, with plain
/// weekday/weekend inference otherwise. Suitable for tests and as the
/// default until a broker-backed calendar is wired in.
#[derive(Debug, Clone, Default)]
pub struct SimpleHkCalendar {
    holidays: HashSet<NaiveDate>,
    half_days: HashSet<NaiveDate>,
}

impl SimpleHkCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_holidays(mut self, dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        self.holidays.extend(dates);
        self
    }

    pub fn with_half_days(mut self, dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        self.half_days.extend(dates);
        self
    }
}

impl TradingCalendar for SimpleHkCalendar {
    fn is_trading_day(&self, date: NaiveDate) -> bool {
        let is_weekend = matches!(date.weekday(), Weekday::Sat | Weekday::Sun);
        !is_weekend && !self.holidays.contains(&date)
    }

    fn is_half_day(&self, date: NaiveDate) -> bool {
        self.half_days.contains(&date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn weekend_is_never_a_trading_day() {
        let cal = SimpleHkCalendar::new();
        // 2026-08-01 is a Saturday.
        assert!(!cal.is_trading_day(ymd(2026, 8, 1)));
    }

    #[test]
    fn holiday_overrides_weekday() {
        let cal = SimpleHkCalendar::new().with_holidays([ymd(2026, 7, 29)]);
        assert!(!cal.is_trading_day(ymd(2026, 7, 29)));
        assert!(cal.is_trading_day(ymd(2026, 7, 28)));
    }

    #[test]
    fn elapsed_trading_minutes_skips_lunch_and_overnight() {
        let cal = SimpleHkCalendar::new();
        let day = ymd(2026, 7, 28); // Tuesday
        let from = hk_time_on(day, 11, 30);
        let to = hk_time_on(day, 13, 30);
        // 30 min before lunch + 30 min after lunch = 60, the 13:00-13:30 window
        // counts, 12:00-13:00 lunch does not.
        assert_eq!(cal.elapsed_trading_minutes(from, to), 60);
    }

    #[test]
    fn elapsed_trading_minutes_skips_non_trading_days() {
        let cal = SimpleHkCalendar::new();
        let fri = ymd(2026, 7, 31); // Friday
        let mon = ymd(2026, 8, 3); // Monday
        let from = hk_time_on(fri, 15, 30);
        let to = hk_time_on(mon, 9, 45);
        // 30 min remaining Friday session + 15 min into Monday morning.
        assert_eq!(cal.elapsed_trading_minutes(from, to), 45);
    }

    #[test]
    fn half_day_has_no_afternoon_session() {
        let cal = SimpleHkCalendar::new().with_half_days([ymd(2026, 7, 28)]);
        let from = hk_time_on(ymd(2026, 7, 28), 9, 30);
        let to = hk_time_on(ymd(2026, 7, 28), 16, 0);
        assert_eq!(cal.elapsed_trading_minutes(from, to), 150); // only the morning session
    }

    #[test]
    fn continuous_session_detects_morning_and_afternoon() {
        let day = ymd(2026, 7, 28);
        assert!(is_continuous_hk_session(hk_time_on(day, 10, 0), false));
        assert!(is_continuous_hk_session(hk_time_on(day, 14, 0), false));
        assert!(!is_continuous_hk_session(hk_time_on(day, 12, 30), false));
        assert!(!is_continuous_hk_session(hk_time_on(day, 14, 0), true));
    }
}
