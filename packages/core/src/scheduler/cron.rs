//! Five-field crontab expressions evaluated in UTC.
//!
//! `minute hour day-of-month month day-of-week`, each field accepting `*`,
//! numbers, lists (`1,15`), ranges (`1-5`) and steps (`*/10`, `8-18/2`).
//! Day-of-week runs 0-7 with both 0 and 7 meaning Sunday. When both day
//! fields are restricted a time matches if either one does.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};

use crate::metrics::MetricsError;

/// Give up looking for a match this many years past the start. Only
/// impossible dates such as `0 0 31 2 *` get this far.
const SEARCH_YEARS: i32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Field {
    bits: u64,
    /// The field was written starting with `*`.
    star: bool,
}

impl Field {
    fn contains(&self, value: u32) -> bool {
        self.bits & (1u64 << value) != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    source: String,
    minutes: Field,
    hours: Field,
    days: Field,
    months: Field,
    weekdays: Field,
}

impl CronSchedule {
    pub fn as_str(&self) -> &str {
        &self.source
    }

    fn day_matches(&self, at: &DateTime<Utc>) -> bool {
        let dom = self.days.contains(at.day());
        let dow = self.weekdays.contains(at.weekday().num_days_from_sunday());
        match (self.days.star, self.weekdays.star) {
            (false, false) => dom || dow,
            _ => dom && dow,
        }
    }

    /// The first matching minute strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let limit = start.year() + SEARCH_YEARS;
        let mut t = start;

        while t.year() <= limit {
            if !self.months.contains(t.month()) {
                t = first_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(&t) {
                t = Utc
                    .with_ymd_and_hms(t.year(), t.month(), t.day(), 0, 0, 0)
                    .single()?
                    + Duration::days(1);
                continue;
            }
            if !self.hours.contains(t.hour()) {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }
}

fn first_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
}

fn invalid(expr: &str, detail: impl fmt::Display) -> MetricsError {
    MetricsError::invalid_trigger(format!("invalid cron expression '{}': {}", expr, detail))
}

fn parse_number(text: &str, expr: &str) -> Result<u32, MetricsError> {
    text.parse::<u32>()
        .map_err(|_| invalid(expr, format!("'{}' is not a number", text)))
}

fn parse_field(text: &str, min: u32, max: u32, expr: &str) -> Result<Field, MetricsError> {
    let mut bits = 0u64;

    for part in text.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step = parse_number(step, expr)?;
                if step == 0 {
                    return Err(invalid(expr, "step must be positive"));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (parse_number(lo, expr)?, parse_number(hi, expr)?)
        } else {
            let single = parse_number(range, expr)?;
            // `5/15` runs from 5 to the end of the field.
            (single, if step.is_some() { max } else { single })
        };

        if lo < min || hi > max || lo > hi {
            return Err(invalid(
                expr,
                format!("'{}' is outside {}-{}", part, min, max),
            ));
        }

        let step = step.unwrap_or(1) as usize;
        for value in (lo..=hi).step_by(step) {
            bits |= 1u64 << value;
        }
    }

    Ok(Field {
        bits,
        star: text.starts_with('*'),
    })
}

impl FromStr for CronSchedule {
    type Err = MetricsError;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let [minute, hour, day, month, weekday] = fields[..] else {
            return Err(invalid(expr, format!("expected 5 fields, got {}", fields.len())));
        };

        let mut weekdays = parse_field(weekday, 0, 7, expr)?;
        if weekdays.contains(7) {
            weekdays.bits = (weekdays.bits | 1) & !(1u64 << 7);
        }

        Ok(Self {
            source: fields.join(" "),
            minutes: parse_field(minute, 0, 59, expr)?,
            hours: parse_field(hour, 0, 23, expr)?,
            days: parse_field(day, 1, 31, expr)?,
            months: parse_field(month, 1, 12, expr)?,
            weekdays,
        })
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn next(expr: &str, from: DateTime<Utc>) -> DateTime<Utc> {
        expr.parse::<CronSchedule>().unwrap().next_after(from).unwrap()
    }

    #[test]
    fn hourly_at_minute_one() {
        assert_eq!(next("1 * * * *", at(2025, 3, 1, 10, 0)), at(2025, 3, 1, 10, 1));
        assert_eq!(next("1 * * * *", at(2025, 3, 1, 10, 1)), at(2025, 3, 1, 11, 1));
    }

    #[test]
    fn daily_rolls_over_to_tomorrow() {
        assert_eq!(next("0 2 * * *", at(2025, 3, 1, 2, 0)), at(2025, 3, 2, 2, 0));
        assert_eq!(next("0 3 * * *", at(2025, 12, 31, 23, 59)), at(2026, 1, 1, 3, 0));
    }

    #[test]
    fn seconds_are_truncated_before_searching() {
        let from = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 30).unwrap();
        assert_eq!(next("* * * * *", from), at(2025, 3, 1, 10, 1));
    }

    #[test]
    fn steps_lists_and_ranges() {
        assert_eq!(next("*/15 * * * *", at(2025, 3, 1, 10, 1)), at(2025, 3, 1, 10, 15));
        assert_eq!(next("0 8-18/4 * * *", at(2025, 3, 1, 13, 0)), at(2025, 3, 1, 16, 0));
        assert_eq!(next("5,35 * * * *", at(2025, 3, 1, 10, 5)), at(2025, 3, 1, 10, 35));
        assert_eq!(next("10/20 * * * *", at(2025, 3, 1, 10, 31)), at(2025, 3, 1, 10, 50));
    }

    #[test]
    fn sunday_is_zero_or_seven() {
        // 2025-03-01 is a Saturday.
        assert_eq!(next("0 0 * * 0", at(2025, 3, 1, 12, 0)), at(2025, 3, 2, 0, 0));
        assert_eq!(next("0 0 * * 7", at(2025, 3, 1, 12, 0)), at(2025, 3, 2, 0, 0));
    }

    #[test]
    fn restricted_day_fields_match_either() {
        // The 10th, or any Monday. 2025-03-03 is a Monday.
        assert_eq!(next("0 0 10 * 1", at(2025, 3, 1, 0, 0)), at(2025, 3, 3, 0, 0));
        // Only day-of-month restricted: weekday is ignored.
        assert_eq!(next("0 0 10 * *", at(2025, 3, 1, 0, 0)), at(2025, 3, 10, 0, 0));
    }

    #[test]
    fn month_restriction_skips_ahead() {
        assert_eq!(next("0 0 1 6 *", at(2025, 3, 1, 0, 0)), at(2025, 6, 1, 0, 0));
    }

    #[test]
    fn leap_day_is_found() {
        assert_eq!(next("0 0 29 2 *", at(2025, 3, 1, 0, 0)), at(2028, 2, 29, 0, 0));
    }

    #[test]
    fn impossible_date_has_no_next_run() {
        let cron: CronSchedule = "0 0 31 2 *".parse().unwrap();
        assert!(cron.next_after(at(2025, 1, 1, 0, 0)).is_none());
    }

    #[test]
    fn malformed_expressions_are_invalid_triggers() {
        for expr in ["", "* * * *", "60 * * * *", "* 24 * * *", "* * 0 * *", "*/0 * * * *", "a * * * *", "5-1 * * * *", "* * * * * *"] {
            let err = expr.parse::<CronSchedule>().unwrap_err();
            assert_eq!(err.kind(), "InvalidTrigger", "expr {expr:?}");
        }
    }

    #[test]
    fn display_normalises_whitespace() {
        let cron: CronSchedule = "  0   2 * *  * ".parse().unwrap();
        assert_eq!(cron.to_string(), "0 2 * * *");
    }
}
