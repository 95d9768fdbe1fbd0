//! Cron expressions as operators write them.
//!
//! Accepted forms:
//! - five fields `minute hour day-of-month month day-of-week`
//! - six fields with a leading seconds column
//! - descriptors `@yearly @annually @monthly @weekly @daily @midnight @hourly`,
//!   with or without the `@`
//!
//! Day-of-week uses the usual numbering (0-7, Sunday is 0 and 7) or
//! three-letter names. Matching is delegated to the `cron` crate, whose
//! week starts at 1 = Sunday, so that field is rewritten before parsing.
//!
//! When both day-of-month and day-of-week are restricted, a time matches if
//! either day field matches, as in classic cron. The `cron` crate requires
//! both, so such expressions are split into one schedule per day field.
//! All times are UTC.

use crate::errors::{AppError, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

const DAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

#[derive(Clone)]
pub struct CronExpression {
    source: String,
    schedules: Vec<::cron::Schedule>,
}

impl fmt::Debug for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronExpression").field(&self.source).finish()
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for CronExpression {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl CronExpression {
    pub fn parse(expr: &str) -> Result<Self> {
        let source = expr.trim();
        if source.is_empty() {
            return Err(invalid(expr, "expression is empty"));
        }

        let normalized = match descriptor(source) {
            Some(fields) => vec![fields.to_string()],
            None if source.starts_with('@') => {
                return Err(invalid(expr, "unsupported descriptor"));
            }
            None => normalize_fields(source).map_err(|reason| invalid(expr, &reason))?,
        };

        let schedules = normalized
            .iter()
            .map(|fields| ::cron::Schedule::from_str(fields))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| invalid(expr, &e.to_string()))?;
        if schedules.iter().all(|s| s.upcoming(Utc).next().is_none()) {
            return Err(invalid(expr, "expression never fires"));
        }

        Ok(Self {
            source: source.to_string(),
            schedules,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First fire time strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedules.iter().filter_map(|s| s.after(&now).next()).min()
    }
}

fn invalid(expr: &str, reason: &str) -> AppError {
    AppError::Validation(format!("invalid cron expression '{}': {}", expr.trim(), reason))
}

// Six-field equivalents in `cron` crate syntax.
fn descriptor(expr: &str) -> Option<&'static str> {
    let name = expr.strip_prefix('@').unwrap_or(expr).to_ascii_lowercase();
    match name.as_str() {
        "yearly" | "annually" => Some("0 0 0 1 1 *"),
        "monthly" => Some("0 0 0 1 * *"),
        "weekly" => Some("0 0 0 * * 1"),
        "daily" | "midnight" => Some("0 0 0 * * *"),
        "hourly" => Some("0 0 * * * *"),
        _ => None,
    }
}

const DAY_OF_MONTH: usize = 3;
const DAY_OF_WEEK: usize = 5;

fn normalize_fields(expr: &str) -> std::result::Result<Vec<String>, String> {
    let mut fields: Vec<String> = expr.split_whitespace().map(str::to_string).collect();
    match fields.len() {
        5 => fields.insert(0, "0".to_string()),
        6 => {}
        n => return Err(format!("expected 5 or 6 fields, found {}", n)),
    }
    let both_restricted = is_restricted(&fields[DAY_OF_MONTH]) && is_restricted(&fields[DAY_OF_WEEK]);
    fields[DAY_OF_WEEK] = translate_day_of_week(&fields[DAY_OF_WEEK])?;

    if both_restricted {
        let mut by_month_day = fields.clone();
        by_month_day[DAY_OF_WEEK] = "*".to_string();
        let mut by_week_day = fields;
        by_week_day[DAY_OF_MONTH] = "*".to_string();
        return Ok(vec![by_month_day.join(" "), by_week_day.join(" ")]);
    }
    Ok(vec![fields.join(" ")])
}

fn is_restricted(field: &str) -> bool {
    !matches!(field, "*" | "?" | "*/1")
}

/// Rewrites a 0-7 (Sunday = 0 or 7) day-of-week field into an explicit
/// 1-7 (Sunday = 1) list.
fn translate_day_of_week(field: &str) -> std::result::Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut days = BTreeSet::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid day-of-week step '{}'", step))?;
                if step == 0 {
                    return Err("day-of-week step must be positive".to_string());
                }
                (range, step)
            }
            None => (item, 1),
        };

        let (start, end) = if range == "*" {
            (0, 6)
        } else if let Some((a, b)) = range.split_once('-') {
            (day_value(a)?, day_value(b)?)
        } else {
            let day = day_value(range)?;
            if step > 1 { (day, day.max(6)) } else { (day, day) }
        };
        if start > end {
            return Err(format!("day-of-week range '{}' runs backwards", range));
        }

        for day in (start..=end).step_by(step as usize) {
            days.insert(day % 7 + 1);
        }
    }

    Ok(days.iter().map(u32::to_string).collect::<Vec<_>>().join(","))
}

fn day_value(token: &str) -> std::result::Result<u32, String> {
    if let Ok(n) = token.parse::<u32>() {
        return if n <= 7 {
            Ok(n)
        } else {
            Err(format!("day-of-week {} is out of range 0-7", n))
        };
    }
    let lower = token.to_ascii_lowercase();
    DAY_NAMES
        .iter()
        .position(|name| lower == *name)
        .map(|i| i as u32)
        .ok_or_else(|| format!("unknown day-of-week '{}'", token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Weekday};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    fn next(expr: &str, now: DateTime<Utc>) -> DateTime<Utc> {
        CronExpression::parse(expr).unwrap().next_after(now).unwrap()
    }

    // 2024-01-01 is a Monday.
    const MONDAY: (i32, u32, u32) = (2024, 1, 1);

    #[test]
    fn test_five_field_daily() {
        let (y, m, d) = MONDAY;
        assert_eq!(next("0 3 * * *", at(y, m, d, 2, 59, 59)), at(y, m, d, 3, 0, 0));
        assert_eq!(next("0 3 * * *", at(y, m, d, 3, 0, 0)), at(y, m, 2, 3, 0, 0));
    }

    #[test]
    fn test_next_is_strictly_after_and_stable() {
        let now = at(2024, 5, 17, 12, 0, 0);
        let expr = CronExpression::parse("*/15 * * * *").unwrap();
        let first = expr.next_after(now).unwrap();
        assert!(first > now);
        assert_eq!(first, at(2024, 5, 17, 12, 15, 0));
        assert_eq!(expr.next_after(now), Some(first));
    }

    #[test]
    fn test_six_field_with_seconds() {
        let (y, m, d) = MONDAY;
        assert_eq!(next("30 0 3 * * *", at(y, m, d, 0, 0, 0)), at(y, m, d, 3, 0, 30));
    }

    #[test]
    fn test_sunday_is_zero_and_seven() {
        let now = at(2024, 1, 1, 12, 0, 0);
        let sunday = at(2024, 1, 7, 0, 0, 0);
        assert_eq!(next("0 0 * * 0", now), sunday);
        assert_eq!(next("0 0 * * 7", now), sunday);
        assert_eq!(next("0 0 * * sun", now), sunday);
        assert_eq!(next("0 0 * * SUN", now), sunday);
    }

    #[test]
    fn test_weekday_ranges() {
        // Friday 10:00 -> Monday 09:00
        let friday = at(2024, 1, 5, 10, 0, 0);
        assert_eq!(next("0 9 * * 1-5", friday), at(2024, 1, 8, 9, 0, 0));
        assert_eq!(next("0 9 * * mon-fri", friday), at(2024, 1, 8, 9, 0, 0));

        let fired = next("0 0 * * 5-7", at(2024, 1, 6, 1, 0, 0));
        assert_eq!(fired.weekday(), Weekday::Sun);
        assert_eq!(next("0 0 * * 1,3", at(2024, 1, 1, 1, 0, 0)).weekday(), Weekday::Wed);
    }

    #[test]
    fn test_descriptors() {
        let now = at(2024, 3, 15, 10, 30, 0);
        assert_eq!(next("@hourly", now), at(2024, 3, 15, 11, 0, 0));
        assert_eq!(next("@daily", now), at(2024, 3, 16, 0, 0, 0));
        assert_eq!(next("@midnight", now), at(2024, 3, 16, 0, 0, 0));
        assert_eq!(next("daily", now), at(2024, 3, 16, 0, 0, 0));
        assert_eq!(next("@weekly", now), at(2024, 3, 17, 0, 0, 0));
        assert_eq!(next("@monthly", now), at(2024, 4, 1, 0, 0, 0));
        assert_eq!(next("@yearly", now), at(2025, 1, 1, 0, 0, 0));
        assert_eq!(next("@annually", now), at(2025, 1, 1, 0, 0, 0));
    }

    #[test]
    fn test_invalid_expressions() {
        for expr in [
            "",
            "   ",
            "* * *",
            "61 * * * *",
            "0 25 * * *",
            "0 0 * * 8",
            "0 0 * * funday",
            "0 0 * * 5-1",
            "@every 5m",
            "@reboot",
            "0 0 30 2 *",
        ] {
            assert!(
                matches!(CronExpression::parse(expr), Err(AppError::Validation(_))),
                "{:?} should be rejected",
                expr
            );
        }
    }

    #[test]
    fn test_day_of_month_or_day_of_week() {
        // 1st of the month or any Monday.
        assert_eq!(next("0 0 1 * 1", at(2024, 1, 2, 12, 0, 0)), at(2024, 1, 8, 0, 0, 0));
        assert_eq!(next("0 0 1 * 1", at(2024, 1, 29, 12, 0, 0)), at(2024, 2, 1, 0, 0, 0));
        assert_eq!(next("0 0 1 * mon", at(2024, 1, 29, 12, 0, 0)), at(2024, 2, 1, 0, 0, 0));
        // One restricted day field behaves as before.
        assert_eq!(next("0 0 1 * *", at(2024, 1, 2, 12, 0, 0)), at(2024, 2, 1, 0, 0, 0));
        assert_eq!(next("0 0 * * 1", at(2024, 1, 2, 12, 0, 0)), at(2024, 1, 8, 0, 0, 0));
        assert_eq!(next("0 0 1 * */1", at(2024, 1, 2, 12, 0, 0)), at(2024, 2, 1, 0, 0, 0));
    }

    #[test]
    fn test_impossible_day_of_month_still_fires_on_weekday() {
        // Feb 30 never exists, but Sundays in February do.
        let fired = next("0 0 30 2 0", at(2024, 1, 1, 0, 0, 0));
        assert_eq!(fired, at(2024, 2, 4, 0, 0, 0));
        assert_eq!(fired.weekday(), Weekday::Sun);
    }

    #[test]
    fn test_source_text_is_preserved() {
        let expr: CronExpression = "  0 3 * * 0 ".parse().unwrap();
        assert_eq!(expr.as_str(), "0 3 * * 0");
        assert_eq!(expr.to_string(), "0 3 * * 0");
    }
}
