//! Trading clock and U.S. equity session calendar.
//!
//! Every component receives an injected [`Clock`] rather than reading a
//! module-level "now": the live clock reads the OS, the sim clock is a
//! pointer advanced by the backtest driver. All engine timestamps are
//! Eastern; the single source-zone conversion happens on signal ingestion.

use anyhow::{Context, Result};
use chrono::{
    DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone, Weekday,
};
use chrono_tz::Tz;
use chrono_tz::US::Eastern;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::RwLock;

/// Engine-wide timestamp type: Eastern wall-clock with zone offset.
pub type EtDateTime = DateTime<Tz>;

/// Injected time source.
pub trait Clock: Send + Sync {
    fn now_eastern(&self) -> EtDateTime;
}

/// Wall-clock time in Eastern.
pub struct LiveClock;

impl Clock for LiveClock {
    fn now_eastern(&self) -> EtDateTime {
        chrono::Utc::now().with_timezone(&Eastern)
    }
}

/// Backtest clock, advanced externally by the replay driver.
pub struct SimClock {
    now: RwLock<EtDateTime>,
}

impl SimClock {
    pub fn new(start: EtDateTime) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    pub fn set(&self, t: EtDateTime) {
        *self.now.write().expect("sim clock poisoned") = t;
    }
}

impl Clock for SimClock {
    fn now_eastern(&self) -> EtDateTime {
        *self.now.read().expect("sim clock poisoned")
    }
}

/// Convert a naive timestamp in the producer's zone to Eastern.
///
/// Ambiguous local times (DST fall-back) resolve to the earlier instant;
/// nonexistent times (spring-forward gap) shift to the post-transition
/// offset.
pub fn to_eastern(naive: NaiveDateTime, source: Tz) -> EtDateTime {
    localize(naive, source).with_timezone(&Eastern)
}

/// Attach the Eastern zone to a naive local date + time.
pub fn at_eastern(date: NaiveDate, time: NaiveTime) -> EtDateTime {
    localize(date.and_time(time), Eastern)
}

fn localize(naive: NaiveDateTime, tz: Tz) -> DateTime<Tz> {
    match tz.from_local_datetime(&naive) {
        chrono::LocalResult::Single(t) => t,
        chrono::LocalResult::Ambiguous(earlier, _) => earlier,
        chrono::LocalResult::None => {
            // Spring-forward gap: the hour does not exist locally.
            tz.from_utc_datetime(&(naive - Duration::hours(tz_offset_hours(tz))))
        }
    }
}

fn tz_offset_hours(tz: Tz) -> i64 {
    // Approximate standard offset, only used for the nonexistent-time edge.
    let probe = NaiveDate::from_ymd_opt(2024, 1, 15)
        .and_then(|d| d.and_hms_opt(12, 0, 0))
        .map(|n| tz.from_utc_datetime(&n));
    probe
        .map(|t| i64::from(t.offset().fix().local_minus_utc()) / 3600)
        .unwrap_or(0)
}

/// Shape of the on-disk calendar override file.
#[derive(Debug, Deserialize)]
struct CalendarOverrides {
    #[serde(default)]
    holidays: Vec<NaiveDate>,
    #[serde(default)]
    half_days: Vec<NaiveDate>,
}

/// U.S. equity session calendar with full holidays and half-days.
pub struct TradingCalendar {
    holidays: BTreeSet<NaiveDate>,
    half_days: BTreeSet<NaiveDate>,
}

const SESSION_OPEN: (u32, u32) = (9, 30);
const SESSION_CLOSE: (u32, u32) = (16, 0);
const HALF_DAY_CLOSE: (u32, u32) = (13, 0);

impl TradingCalendar {
    /// Calendar with the bundled NYSE holiday table (2023-2026).
    pub fn builtin() -> Self {
        let holidays = BUILTIN_HOLIDAYS
            .iter()
            .filter_map(|(y, m, d)| NaiveDate::from_ymd_opt(*y, *m, *d))
            .collect();
        let half_days = BUILTIN_HALF_DAYS
            .iter()
            .filter_map(|(y, m, d)| NaiveDate::from_ymd_opt(*y, *m, *d))
            .collect();
        Self {
            holidays,
            half_days,
        }
    }

    /// Builtin table extended with a cached JSON override file
    /// (`{"holidays": [..], "half_days": [..]}`).
    pub fn with_overrides<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut calendar = Self::builtin();
        let content = std::fs::read_to_string(path.as_ref()).with_context(|| {
            format!("failed to read calendar file {}", path.as_ref().display())
        })?;
        let overrides: CalendarOverrides =
            serde_json::from_str(&content).context("invalid calendar override file")?;
        calendar.holidays.extend(overrides.holidays);
        calendar.half_days.extend(overrides.half_days);
        Ok(calendar)
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(&date)
    }

    pub fn is_half_day(&self, date: NaiveDate) -> bool {
        self.half_days.contains(&date)
    }

    /// Advance `n` trading days forward; the start date itself never counts.
    pub fn add_trading_days(&self, date: NaiveDate, n: u32) -> NaiveDate {
        let mut current = date;
        let mut remaining = n;
        while remaining > 0 {
            current += Duration::days(1);
            if self.is_trading_day(current) {
                remaining -= 1;
            }
        }
        current
    }

    /// Trading days in `(from, to]`: exclusive of `from`, inclusive of `to`.
    pub fn count_trading_days_between(&self, from: NaiveDate, to: NaiveDate) -> u32 {
        if to <= from {
            return 0;
        }
        let mut count = 0;
        let mut current = from + Duration::days(1);
        while current <= to {
            if self.is_trading_day(current) {
                count += 1;
            }
            current += Duration::days(1);
        }
        count
    }

    pub fn session_open(&self, date: NaiveDate) -> EtDateTime {
        let (h, m) = SESSION_OPEN;
        at_eastern(date, NaiveTime::from_hms_opt(h, m, 0).unwrap_or_default())
    }

    pub fn session_close(&self, date: NaiveDate) -> EtDateTime {
        let (h, m) = if self.is_half_day(date) {
            HALF_DAY_CLOSE
        } else {
            SESSION_CLOSE
        };
        at_eastern(date, NaiveTime::from_hms_opt(h, m, 0).unwrap_or_default())
    }
}

// NYSE full closures. Source list kept flat so a glance shows the coverage.
const BUILTIN_HOLIDAYS: &[(i32, u32, u32)] = &[
    // 2023
    (2023, 1, 2),
    (2023, 1, 16),
    (2023, 2, 20),
    (2023, 4, 7),
    (2023, 5, 29),
    (2023, 6, 19),
    (2023, 7, 4),
    (2023, 9, 4),
    (2023, 11, 23),
    (2023, 12, 25),
    // 2024
    (2024, 1, 1),
    (2024, 1, 15),
    (2024, 2, 19),
    (2024, 3, 29),
    (2024, 5, 27),
    (2024, 6, 19),
    (2024, 7, 4),
    (2024, 9, 2),
    (2024, 11, 28),
    (2024, 12, 25),
    // 2025 (includes the Jan 9 national day of mourning)
    (2025, 1, 1),
    (2025, 1, 9),
    (2025, 1, 20),
    (2025, 2, 17),
    (2025, 4, 18),
    (2025, 5, 26),
    (2025, 6, 19),
    (2025, 7, 4),
    (2025, 9, 1),
    (2025, 11, 27),
    (2025, 12, 25),
    // 2026
    (2026, 1, 1),
    (2026, 1, 19),
    (2026, 2, 16),
    (2026, 4, 3),
    (2026, 5, 25),
    (2026, 6, 19),
    (2026, 7, 3),
    (2026, 9, 7),
    (2026, 11, 26),
    (2026, 12, 25),
];

// Early closes at 13:00 Eastern.
const BUILTIN_HALF_DAYS: &[(i32, u32, u32)] = &[
    (2023, 7, 3),
    (2023, 11, 24),
    (2024, 7, 3),
    (2024, 11, 29),
    (2024, 12, 24),
    (2025, 7, 3),
    (2025, 11, 28),
    (2025, 12, 24),
    (2026, 11, 27),
    (2026, 12, 24),
];

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use chrono_tz::Asia::Shanghai;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_weekends_and_holidays_are_not_trading_days() {
        let cal = TradingCalendar::builtin();
        assert!(cal.is_trading_day(d(2024, 6, 3))); // Monday
        assert!(!cal.is_trading_day(d(2024, 6, 1))); // Saturday
        assert!(!cal.is_trading_day(d(2024, 7, 4))); // Independence Day
        assert!(!cal.is_trading_day(d(2024, 3, 29))); // Good Friday
    }

    #[test]
    fn test_add_trading_days_excludes_start() {
        let cal = TradingCalendar::builtin();
        // Monday 2024-06-03 + 6 trading days: 04,05,06,07 then 10,11.
        assert_eq!(cal.add_trading_days(d(2024, 6, 3), 6), d(2024, 6, 11));
        // Friday + 1 skips the weekend.
        assert_eq!(cal.add_trading_days(d(2024, 6, 7), 1), d(2024, 6, 10));
    }

    #[test]
    fn test_add_trading_days_skips_holidays() {
        let cal = TradingCalendar::builtin();
        // Wed 2024-07-03 + 1 skips July 4th and lands on Friday.
        assert_eq!(cal.add_trading_days(d(2024, 7, 3), 1), d(2024, 7, 5));
    }

    #[test]
    fn test_count_trading_days_exclusive_from() {
        let cal = TradingCalendar::builtin();
        assert_eq!(cal.count_trading_days_between(d(2024, 6, 3), d(2024, 6, 3)), 0);
        assert_eq!(cal.count_trading_days_between(d(2024, 6, 3), d(2024, 6, 11)), 6);
        assert_eq!(cal.count_trading_days_between(d(2024, 6, 7), d(2024, 6, 10)), 1);
    }

    #[test]
    fn test_session_bounds_and_half_days() {
        let cal = TradingCalendar::builtin();
        let open = cal.session_open(d(2024, 6, 3));
        assert_eq!((open.hour(), open.minute()), (9, 30));

        let close = cal.session_close(d(2024, 6, 3));
        assert_eq!((close.hour(), close.minute()), (16, 0));

        // Day after Thanksgiving 2024 closes at 13:00.
        let half = cal.session_close(d(2024, 11, 29));
        assert_eq!((half.hour(), half.minute()), (13, 0));
    }

    #[test]
    fn test_to_eastern_from_source_zone() {
        // 03:35 in Shanghai on June 4 is 15:35 Eastern on June 3 (EDT, UTC-4).
        let naive = d(2024, 6, 4).and_hms_opt(3, 35, 0).unwrap();
        let et = to_eastern(naive, Shanghai);
        assert_eq!(et.date_naive(), d(2024, 6, 3));
        assert_eq!((et.hour(), et.minute()), (15, 35));
    }

    #[test]
    fn test_sim_clock_advances() {
        let start = at_eastern(d(2024, 6, 3), NaiveTime::from_hms_opt(9, 30, 0).unwrap());
        let clock = SimClock::new(start);
        assert_eq!(clock.now_eastern(), start);

        let later = start + Duration::minutes(5);
        clock.set(later);
        assert_eq!(clock.now_eastern(), later);
    }
}
