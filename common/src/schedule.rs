use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::config::{ScheduleConfig, TimezoneConfig};

/// Daily hour range during which networking is permitted.
///
/// `end_hour <= start_hour` means the window spans midnight. A window with
/// `start_hour == end_hour` is therefore always active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_hour: u8,
    pub end_hour: u8,
}

impl Default for TimeWindow {
    fn default() -> Self {
        Self {
            start_hour: 5,
            end_hour: 8,
        }
    }
}

impl TimeWindow {
    pub fn new(start_hour: u8, end_hour: u8) -> Self {
        let mut window = Self {
            start_hour,
            end_hour,
        };
        window.sanitize();
        window
    }

    pub fn sanitize(&mut self) {
        self.start_hour = self.start_hour.min(23);
        self.end_hour = self.end_hour.min(23);
    }

    pub fn wraps_midnight(&self) -> bool {
        self.end_hour <= self.start_hour
    }

    pub fn contains_hour(&self, hour: u8) -> bool {
        if self.wraps_midnight() {
            hour >= self.start_hour || hour < self.end_hour
        } else {
            self.start_hour <= hour && hour < self.end_hour
        }
    }
}

/// The `ordinal`-th `weekday` of `month`, e.g. the second Sunday of March.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DstTransition {
    pub month: u32,
    pub weekday: Weekday,
    pub ordinal: u32,
}

impl DstTransition {
    pub fn day_in(&self, year: i32) -> Option<u32> {
        nth_weekday_of_month(year, self.month, self.weekday, self.ordinal)
    }
}

/// DST is active from `start` (inclusive) until `end` (exclusive), by date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DstRule {
    pub start: DstTransition,
    pub end: DstTransition,
}

impl DstRule {
    pub const NORTH_AMERICA: Self = Self {
        start: DstTransition {
            month: 3,
            weekday: Weekday::Sun,
            ordinal: 2,
        },
        end: DstTransition {
            month: 11,
            weekday: Weekday::Sun,
            ordinal: 1,
        },
    };

    pub fn is_active(&self, year: i32, month: u32, day: u32) -> bool {
        let (Some(start_day), Some(end_day)) = (self.start.day_in(year), self.end.day_in(year))
        else {
            return false;
        };

        if month < self.start.month || month > self.end.month {
            false
        } else if month > self.start.month && month < self.end.month {
            true
        } else if month == self.start.month {
            day >= start_day
        } else {
            day < end_day
        }
    }
}

/// Day of month of the `n`-th `weekday` in `month`.
///
/// Weekdays are counted Monday = 0 through Sunday = 6 for both the first day
/// of the month and the target.
pub fn nth_weekday_of_month(year: i32, month: u32, weekday: Weekday, n: u32) -> Option<u32> {
    if n == 0 {
        return None;
    }
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let first_weekday = first.weekday().num_days_from_monday();
    let target_weekday = weekday.num_days_from_monday();
    let days_until = (target_weekday + 7 - first_weekday) % 7;
    Some(1 + days_until + (n - 1) * 7)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimezoneRule {
    pub base_offset_hours: i32,
    pub dst: Option<DstRule>,
    pub standard_abbrev: String,
    pub daylight_abbrev: String,
}

impl TimezoneRule {
    pub fn fixed(base_offset_hours: i32) -> Self {
        Self {
            base_offset_hours,
            dst: None,
            standard_abbrev: format!("UTC{base_offset_hours:+}"),
            daylight_abbrev: format!("UTC{:+}", base_offset_hours + 1),
        }
    }

    pub fn from_config(config: &TimezoneConfig) -> Self {
        Self {
            base_offset_hours: config.base_utc_offset_hours,
            dst: config.observe_dst.then_some(DstRule::NORTH_AMERICA),
            standard_abbrev: config.standard_abbrev.clone(),
            daylight_abbrev: config.daylight_abbrev.clone(),
        }
    }

    /// DST is evaluated on the UTC calendar date of `now`.
    pub fn is_dst(&self, now: DateTime<Utc>) -> bool {
        self.dst
            .map(|rule| rule.is_active(now.year(), now.month(), now.day()))
            .unwrap_or(false)
    }

    pub fn effective_offset(&self, now: DateTime<Utc>) -> i32 {
        if self.is_dst(now) {
            self.base_offset_hours + 1
        } else {
            self.base_offset_hours
        }
    }

    pub fn local_hour(&self, now: DateTime<Utc>) -> u8 {
        (now.hour() as i32 + self.effective_offset(now)).rem_euclid(24) as u8
    }

    pub fn is_within_window(&self, now: DateTime<Utc>, window: &TimeWindow) -> bool {
        window.contains_hour(self.local_hour(now))
    }

    pub fn local_time_label(&self, now: DateTime<Utc>) -> String {
        let abbrev = if self.is_dst(now) {
            &self.daylight_abbrev
        } else {
            &self.standard_abbrev
        };
        format!(
            "{:02}:{:02}:{:02} {}",
            self.local_hour(now),
            now.minute(),
            now.second(),
            abbrev
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleDecision {
    pub local_hour: u8,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSchedule {
    pub window: TimeWindow,
    pub timezone: TimezoneRule,
}

impl NetworkSchedule {
    pub fn new(window: TimeWindow, timezone: TimezoneRule) -> Self {
        Self { window, timezone }
    }

    pub fn from_config(config: &ScheduleConfig) -> Self {
        Self::new(config.window, TimezoneRule::from_config(&config.timezone))
    }

    pub fn decide(&self, now: DateTime<Utc>) -> ScheduleDecision {
        let local_hour = self.timezone.local_hour(now);
        ScheduleDecision {
            local_hour,
            active: self.window.contains_hour(local_hour),
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.timezone.is_within_window(now, &self.window)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Offset, TimeZone};
    use pretty_assertions::assert_eq;

    use super::*;

    fn utc(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, hour, 0, 0).unwrap()
    }

    fn pacific() -> TimezoneRule {
        TimezoneRule::from_config(&TimezoneConfig::default())
    }

    #[test]
    fn plain_window_is_start_inclusive_end_exclusive() {
        for start in 0..24u8 {
            for end in (start + 1)..24u8 {
                let window = TimeWindow::new(start, end);
                for hour in 0..24u8 {
                    assert_eq!(
                        window.contains_hour(hour),
                        start <= hour && hour < end,
                        "window {start}..{end} hour {hour}"
                    );
                }
            }
        }
    }

    #[test]
    fn wrapping_window_spans_midnight() {
        for start in 0..24u8 {
            for end in 0..=start {
                let window = TimeWindow::new(start, end);
                for hour in 0..24u8 {
                    assert_eq!(window.contains_hour(hour), hour >= start || hour < end);
                }
            }
        }

        let late = TimeWindow::new(23, 1);
        assert!(late.contains_hour(23));
        assert!(late.contains_hour(0));
        assert!(!late.contains_hour(1));
        assert!(!late.contains_hour(22));
    }

    #[test]
    fn equal_bounds_are_always_active() {
        let window = TimeWindow::new(6, 6);
        assert!((0..24).all(|hour| window.contains_hour(hour)));
    }

    #[test]
    fn finds_nth_weekday() {
        // March 2025 starts on a Saturday.
        assert_eq!(nth_weekday_of_month(2025, 3, Weekday::Sun, 2), Some(9));
        // November 2025 starts on a Saturday.
        assert_eq!(nth_weekday_of_month(2025, 11, Weekday::Sun, 1), Some(2));
        // March 2026 starts on a Sunday.
        assert_eq!(nth_weekday_of_month(2026, 3, Weekday::Sun, 2), Some(8));
        assert_eq!(nth_weekday_of_month(2026, 3, Weekday::Mon, 1), Some(2));
        assert_eq!(nth_weekday_of_month(2026, 13, Weekday::Mon, 1), None);
        assert_eq!(nth_weekday_of_month(2026, 3, Weekday::Mon, 0), None);
    }

    #[test]
    fn dst_boundaries_follow_transition_days() {
        let rule = DstRule::NORTH_AMERICA;

        assert!(!rule.is_active(2025, 3, 8));
        assert!(rule.is_active(2025, 3, 9));
        assert!(rule.is_active(2025, 7, 1));
        assert!(rule.is_active(2025, 10, 31));
        assert!(rule.is_active(2025, 11, 1));
        assert!(!rule.is_active(2025, 11, 2));
        assert!(!rule.is_active(2025, 12, 25));
        assert!(!rule.is_active(2025, 1, 15));
    }

    #[test]
    fn dst_rule_matches_los_angeles_zone() {
        let rule = DstRule::NORTH_AMERICA;
        let zone = chrono_tz::America::Los_Angeles;

        let mut date = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let last = NaiveDate::from_ymd_opt(2032, 12, 31).unwrap();
        while date <= last {
            let noon = zone
                .with_ymd_and_hms(date.year(), date.month(), date.day(), 12, 0, 0)
                .single()
                .unwrap();
            let zone_dst = noon.offset().fix().local_minus_utc() == -7 * 3600;
            assert_eq!(
                rule.is_active(date.year(), date.month(), date.day()),
                zone_dst,
                "mismatch on {date}"
            );
            date = date.succ_opt().unwrap();
        }
    }

    #[test]
    fn effective_offset_is_base_or_base_plus_one() {
        let tz = pacific();
        assert_eq!(tz.effective_offset(utc(2025, 1, 10, 12)), -8);
        assert_eq!(tz.effective_offset(utc(2025, 6, 10, 12)), -7);

        let fixed = TimezoneRule::fixed(5);
        assert_eq!(fixed.effective_offset(utc(2025, 6, 10, 12)), 5);
    }

    #[test]
    fn local_hour_wraps_without_going_negative() {
        let tz = pacific();
        // 03:00 UTC in January is 19:00 PST on the previous day.
        assert_eq!(tz.local_hour(utc(2025, 1, 10, 3)), 19);
        // 03:00 UTC in July is 20:00 PDT.
        assert_eq!(tz.local_hour(utc(2025, 7, 10, 3)), 20);

        for offset in -12..=14 {
            let tz = TimezoneRule::fixed(offset);
            for hour in 0..24 {
                assert!(tz.local_hour(utc(2025, 2, 1, hour)) < 24);
            }
        }
    }

    #[test]
    fn schedule_decision_uses_local_hour() {
        let schedule = NetworkSchedule::new(TimeWindow::new(5, 8), pacific());

        // 14:00 UTC in July is 07:00 PDT.
        let inside = schedule.decide(utc(2025, 7, 10, 14));
        assert_eq!(inside.local_hour, 7);
        assert!(inside.active);

        // 15:00 UTC in July is 08:00 PDT, the exclusive end.
        let boundary = schedule.decide(utc(2025, 7, 10, 15));
        assert_eq!(boundary.local_hour, 8);
        assert!(!boundary.active);
        assert!(!schedule.is_active(utc(2025, 7, 10, 15)));
    }

    #[test]
    fn labels_local_time_with_zone_abbreviation() {
        let tz = pacific();
        let winter = Utc.with_ymd_and_hms(2025, 1, 10, 14, 5, 9).unwrap();
        let summer = Utc.with_ymd_and_hms(2025, 7, 10, 14, 5, 9).unwrap();

        assert_eq!(tz.local_time_label(winter), "06:05:09 PST");
        assert_eq!(tz.local_time_label(summer), "07:05:09 PDT");
    }
}
