//! Five-field cron expressions
//!
//! `minute hour day-of-month month day-of-week`, evaluated in UTC. Fields
//! accept `*`, numbers, ranges `a-b`, lists `a,b` and steps `*/n`, `a-b/n`
//! or `a/n`. Day-of-week runs 0-6 from Sunday, with 7 also meaning Sunday.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};

/// How far ahead [`CronSchedule::next_after`] searches
const SEARCH_YEARS: i64 = 4;

/// A cron expression that failed to parse
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid cron expression {expression:?}: {reason}")]
pub struct CronError {
    pub expression: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59 };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23 };
const DAY_OF_MONTH: FieldSpec = FieldSpec { name: "day of month", min: 1, max: 31 };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12 };
const DAY_OF_WEEK: FieldSpec = FieldSpec { name: "day of week", min: 0, max: 7 };

/// Set of allowed values for one field, as a bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Field {
    bits: u64,
    /// False when the field starts with `*`
    restricted: bool,
}

impl Field {
    fn contains(&self, value: u32) -> bool {
        self.bits & (1u64 << value) != 0
    }
}

fn parse_number(raw: &str, spec: FieldSpec) -> Result<u32, String> {
    let value: u32 = raw
        .parse()
        .map_err(|_| format!("{} value {raw:?} is not a number", spec.name))?;
    if value < spec.min || value > spec.max {
        return Err(format!(
            "{} value {value} is outside {}-{}",
            spec.name, spec.min, spec.max
        ));
    }
    Ok(value)
}

fn parse_field(raw: &str, spec: FieldSpec) -> Result<Field, String> {
    let mut bits = 0u64;

    for part in raw.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| format!("{} step {step:?} is invalid", spec.name))?;
                (range, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            let (a, b) = (parse_number(a, spec)?, parse_number(b, spec)?);
            if a > b {
                return Err(format!("{} range {range:?} is reversed", spec.name));
            }
            (a, b)
        } else {
            let a = parse_number(range, spec)?;
            // `a/n` means every n-th value starting at a
            (a, if step.is_some() { spec.max } else { a })
        };

        let step = step.unwrap_or(1) as usize;
        for value in (start..=end).step_by(step) {
            bits |= 1u64 << value;
        }
    }

    Ok(Field {
        bits,
        restricted: !raw.starts_with('*'),
    })
}

/// A parsed cron expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    minutes: Field,
    hours: Field,
    days_of_month: Field,
    months: Field,
    days_of_week: Field,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let error = |reason: String| CronError {
            expression: expression.to_string(),
            reason,
        };

        let fields: Vec<&str> = expression.split_whitespace().collect();
        let [minute, hour, dom, month, dow] = fields[..] else {
            return Err(error(format!("expected 5 fields, found {}", fields.len())));
        };

        let mut days_of_week = parse_field(dow, DAY_OF_WEEK).map_err(error)?;
        // 7 is an alias for Sunday
        if days_of_week.contains(7) {
            days_of_week.bits = (days_of_week.bits & !(1u64 << 7)) | 1;
        }

        Ok(Self {
            expression: fields.join(" "),
            minutes: parse_field(minute, MINUTE).map_err(error)?,
            hours: parse_field(hour, HOUR).map_err(error)?,
            days_of_month: parse_field(dom, DAY_OF_MONTH).map_err(error)?,
            months: parse_field(month, MONTH).map_err(error)?,
            days_of_week,
        })
    }

    /// Whether the schedule fires on this calendar day
    fn matches_day(&self, t: DateTime<Utc>) -> bool {
        let dom = self.days_of_month.contains(t.day());
        let dow = self.days_of_week.contains(t.weekday().num_days_from_sunday());

        // Both restricted: either may match
        if self.days_of_month.restricted && self.days_of_week.restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// Whether the schedule fires at this minute
    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        self.months.contains(t.month())
            && self.matches_day(t)
            && self.hours.contains(t.hour())
            && self.minutes.contains(t.minute())
    }

    /// The first matching minute strictly after `after`
    ///
    /// Returns `None` if nothing matches within four years, which is the
    /// case for impossible dates such as `0 0 31 2 *`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let limit = after + Duration::days(366 * SEARCH_YEARS);
        let mut t = after.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);

        while t <= limit {
            if !self.months.contains(t.month()) {
                let (year, month) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()?;
                continue;
            }

            if !self.matches_day(t) {
                t = t.date_naive().succ_opt()?.and_hms_opt(0, 0, 0)?.and_utc();
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

    pub fn as_str(&self) -> &str {
        &self.expression
    }
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn next(expr: &str, after: &str) -> Option<DateTime<Utc>> {
        CronSchedule::parse(expr).unwrap().next_after(at(after))
    }

    #[test]
    fn test_every_minute_is_strictly_after() {
        assert_eq!(
            next("* * * * *", "2024-01-01T10:15:00Z"),
            Some(at("2024-01-01T10:16:00Z"))
        );
        assert_eq!(
            next("* * * * *", "2024-01-01T10:15:42Z"),
            Some(at("2024-01-01T10:16:00Z"))
        );
    }

    #[test]
    fn test_every_other_day_at_midnight() {
        // Days 1, 3, 5, ... of each month
        assert_eq!(
            next("0 0 */2 * *", "2024-01-01T00:00:00Z"),
            Some(at("2024-01-03T00:00:00Z"))
        );
        assert_eq!(
            next("0 0 */2 * *", "2024-01-31T00:00:00Z"),
            Some(at("2024-02-01T00:00:00Z"))
        );
    }

    #[test]
    fn test_lists_ranges_and_steps() {
        let schedule = CronSchedule::parse("0,30 9-17/4 * * *").unwrap();
        assert!(schedule.matches(at("2024-05-01T09:30:00Z")));
        assert!(schedule.matches(at("2024-05-01T13:00:00Z")));
        assert!(schedule.matches(at("2024-05-01T17:30:00Z")));
        assert!(!schedule.matches(at("2024-05-01T10:00:00Z")));
        assert!(!schedule.matches(at("2024-05-01T09:15:00Z")));

        assert_eq!(
            schedule.next_after(at("2024-05-01T17:30:00Z")),
            Some(at("2024-05-02T09:00:00Z"))
        );
    }

    #[test]
    fn test_day_of_week_and_sunday_alias() {
        // 2024-06-01 is a Saturday
        assert_eq!(
            next("30 6 * * 1-5", "2024-06-01T00:00:00Z"),
            Some(at("2024-06-03T06:30:00Z"))
        );
        assert_eq!(
            next("0 12 * * 7", "2024-06-01T00:00:00Z"),
            Some(at("2024-06-02T12:00:00Z"))
        );
    }

    #[test]
    fn test_restricted_day_fields_are_ored() {
        // The 15th, or any Monday
        let schedule = CronSchedule::parse("0 0 15 * 1").unwrap();
        assert!(schedule.matches(at("2024-06-15T00:00:00Z"))); // Saturday the 15th
        assert!(schedule.matches(at("2024-06-03T00:00:00Z"))); // Monday the 3rd
        assert!(!schedule.matches(at("2024-06-04T00:00:00Z")));

        // Unrestricted day-of-week does not widen day-of-month
        let monthly = CronSchedule::parse("0 0 15 * *").unwrap();
        assert!(!monthly.matches(at("2024-06-03T00:00:00Z")));
    }

    #[test]
    fn test_year_rollover_and_leap_day() {
        assert_eq!(
            next("0 0 1 1 *", "2024-06-01T00:00:00Z"),
            Some(at("2025-01-01T00:00:00Z"))
        );
        assert_eq!(
            next("0 0 29 2 *", "2024-03-01T00:00:00Z"),
            Some(at("2028-02-29T00:00:00Z"))
        );
    }

    #[test]
    fn test_impossible_date_has_no_next() {
        assert_eq!(next("0 0 31 2 *", "2024-01-01T00:00:00Z"), None);
    }

    #[test]
    fn test_parse_errors() {
        for expr in [
            "",
            "* * * *",
            "* * * * * *",
            "60 * * * *",
            "* 24 * * *",
            "* * 0 * *",
            "* * * 13 *",
            "* * * * 8",
            "*/0 * * * *",
            "5-1 * * * *",
            "a * * * *",
        ] {
            assert!(CronSchedule::parse(expr).is_err(), "{expr:?} should not parse");
        }
    }

    #[test]
    fn test_display_normalizes_whitespace() {
        let schedule: CronSchedule = "0  0   */2 * *".parse().unwrap();
        assert_eq!(schedule.to_string(), "0 0 */2 * *");
    }
}
