//! Schedule expressions.
//!
//! A chain's `run_at` is either an event prefix (`@reboot`, `@every D`,
//! `@after D`) or a classic five-field CRON expression (minute, hour, day,
//! month, day-of-week) with `*`, value lists, ranges, steps and combinations.
//! Runtime CRON matching happens server-side; the matcher here backs import
//! validation and serves as the independent reference implementation the
//! tests compare against the in-database one.

use std::str::FromStr;
use std::time::Duration;

use chrono::{Datelike, NaiveDateTime, Timelike};

use crate::error::{Error, Result};

/// A parsed `run_at` schedule expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Fire once on every daemon start
    Reboot,
    /// Repeat with the next start `D` after the start of the current run
    Every(Duration),
    /// Repeat with the next start `D` after the completion of the current run
    After(Duration),
    /// Five-field CRON expression
    Cron(CronExpr),
}

impl FromStr for Schedule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == "@reboot" {
            return Ok(Schedule::Reboot);
        }
        if let Some(rest) = s.strip_prefix("@every") {
            return Ok(Schedule::Every(parse_interval(rest)?));
        }
        if let Some(rest) = s.strip_prefix("@after") {
            return Ok(Schedule::After(parse_interval(rest)?));
        }
        if s.starts_with('@') {
            return Err(Error::validation(format!("unknown schedule prefix in {s:?}")));
        }
        Ok(Schedule::Cron(s.parse()?))
    }
}

/// One CRON field: `None` is unrestricted (`*`), otherwise a bit set of
/// admitted values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet(Option<u64>);

impl FieldSet {
    const ANY: FieldSet = FieldSet(None);

    fn contains(&self, value: u32) -> bool {
        match self.0 {
            None => true,
            Some(bits) => value < 64 && bits >> value & 1 == 1,
        }
    }

    fn insert(&mut self, value: u32) {
        let bits = self.0.get_or_insert(0);
        *bits |= 1 << value;
    }
}

/// Inclusive value range of one CRON field
#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
}

const FIELDS: [FieldSpec; 5] = [
    FieldSpec { name: "minute", min: 0, max: 59 },
    FieldSpec { name: "hour", min: 0, max: 23 },
    FieldSpec { name: "day", min: 1, max: 31 },
    FieldSpec { name: "month", min: 1, max: 12 },
    FieldSpec { name: "day_of_week", min: 0, max: 7 },
];

/// A parsed five-field CRON expression.
///
/// A timestamp matches when all five fields admit it; day-of-week uses
/// 0 = Sunday with 7 accepted as an alias for 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minute: FieldSet,
    hour: FieldSet,
    day: FieldSet,
    month: FieldSet,
    dow: FieldSet,
}

impl FromStr for CronExpr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(Error::validation(format!(
                "cron expression must have 5 fields, got {} in {s:?}",
                fields.len()
            )));
        }
        let mut sets = [FieldSet::ANY; 5];
        for (i, (field, spec)) in fields.iter().zip(FIELDS.iter()).enumerate() {
            sets[i] = parse_field(field, spec)?;
        }
        let [minute, hour, day, month, dow] = sets;
        Ok(CronExpr { minute, hour, day, month, dow })
    }
}

impl CronExpr {
    /// Whether the expression fires at the given minute.
    ///
    /// Seconds are ignored; the schedule axis has one-minute resolution.
    pub fn matches(&self, at: NaiveDateTime) -> bool {
        self.minute.contains(at.minute())
            && self.hour.contains(at.hour())
            && self.day.contains(at.day())
            && self.month.contains(at.month())
            && self.dow.contains(at.weekday().num_days_from_sunday())
    }
}

fn parse_field(field: &str, spec: &FieldSpec) -> Result<FieldSet> {
    let mut set = FieldSet(Some(0));
    for item in field.split(',') {
        if item == "*" {
            return Ok(FieldSet::ANY);
        }
        let (range_part, step) = match item.split_once('/') {
            Some((r, s)) => (r, Some(parse_value(s, spec)?)),
            None => (item, None),
        };
        let (lo, hi) = if range_part == "*" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range_part.split_once('-') {
            (parse_value(a, spec)?, parse_value(b, spec)?)
        } else {
            let v = parse_value(range_part, spec)?;
            // a bare value with a step extends to the field maximum
            if step.is_some() { (v, spec.max) } else { (v, v) }
        };
        if lo < spec.min || hi > spec.max {
            return Err(Error::validation(format!(
                "{} value out of range {}-{} in {item:?}",
                spec.name, spec.min, spec.max
            )));
        }
        if lo > hi {
            return Err(Error::validation(format!(
                "inverted {} range in {item:?}",
                spec.name
            )));
        }
        let step = match step {
            Some(0) => return Err(Error::validation(format!("zero step in {item:?}"))),
            Some(s) => s,
            None => 1,
        };
        let mut v = lo;
        while v <= hi {
            // 7 in day_of_week is an alias for Sunday
            set.insert(if spec.name == "day_of_week" && v == 7 { 0 } else { v });
            v += step;
        }
    }
    Ok(set)
}

fn parse_value(s: &str, spec: &FieldSpec) -> Result<u32> {
    s.parse::<u32>().map_err(|_| {
        Error::validation(format!("bad {} value {s:?} in cron expression", spec.name))
    })
}

/// Parse the interval part of an `@every` / `@after` schedule.
///
/// Accepted forms mirror what the database accepts for an interval: a bare
/// number of seconds, `HH:MM` / `HH:MM:SS`, or one or more `<number> <unit>`
/// terms with the usual unit spellings (`ms`, `s`, `min`, `hours`, `days`,
/// `weeks`, ...). The database parser remains authoritative at runtime.
pub fn parse_interval(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::validation("empty interval"));
    }

    // HH:MM[:SS]
    if s.contains(':') {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() > 3 {
            return Err(Error::validation(format!("malformed interval {s:?}")));
        }
        let mut seconds: u64 = 0;
        for part in &parts {
            let v: u64 = part
                .parse()
                .map_err(|_| Error::validation(format!("malformed interval {s:?}")))?;
            seconds = seconds * 60 + v;
        }
        if parts.len() == 2 {
            // HH:MM has hour resolution on the left
            seconds *= 60;
        }
        return nonzero(Duration::from_secs(seconds), s);
    }

    if let Ok(seconds) = s.parse::<u64>() {
        return nonzero(Duration::from_secs(seconds), s);
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return Err(Error::validation(format!("malformed interval {s:?}")));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|_| Error::validation(format!("malformed interval {s:?}")))?;
        rest = rest[digits..].trim_start();
        let unit_len = rest.chars().take_while(|c| c.is_ascii_alphabetic()).count();
        let unit = &rest[..unit_len];
        rest = rest[unit_len..].trim_start();
        total += match unit {
            "ms" | "millisecond" | "milliseconds" => Duration::from_millis(value),
            "" | "s" | "sec" | "secs" | "second" | "seconds" => Duration::from_secs(value),
            "m" | "min" | "mins" | "minute" | "minutes" => Duration::from_secs(value * 60),
            "h" | "hour" | "hours" => Duration::from_secs(value * 3600),
            "d" | "day" | "days" => Duration::from_secs(value * 86_400),
            "w" | "week" | "weeks" => Duration::from_secs(value * 604_800),
            _ => {
                return Err(Error::validation(format!(
                    "unknown interval unit {unit:?} in {s:?}"
                )))
            }
        };
    }
    nonzero(total, s)
}

fn nonzero(d: Duration, s: &str) -> Result<Duration> {
    if d.is_zero() {
        Err(Error::validation(format!("interval {s:?} must be positive")))
    } else {
        Ok(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d).unwrap().and_hms_opt(h, mi, 0).unwrap()
    }

    fn cron(s: &str) -> CronExpr {
        s.parse().unwrap()
    }

    #[test]
    fn test_wildcard_matches_everything() {
        let c = cron("* * * * *");
        assert!(c.matches(at(2024, 1, 1, 0, 0)));
        assert!(c.matches(at(2024, 12, 31, 23, 59)));
    }

    #[test]
    fn test_fixed_minute_hour() {
        let c = cron("5 0 * 8 *");
        assert!(c.matches(at(2024, 8, 1, 0, 5)));
        assert!(!c.matches(at(2024, 8, 1, 0, 6)));
        assert!(!c.matches(at(2024, 9, 1, 0, 5)));
    }

    #[test]
    fn test_lists_ranges_steps() {
        let c = cron("1,15,30 9-17 * * *");
        assert!(c.matches(at(2024, 3, 4, 9, 15)));
        assert!(c.matches(at(2024, 3, 4, 17, 30)));
        assert!(!c.matches(at(2024, 3, 4, 8, 15)));
        assert!(!c.matches(at(2024, 3, 4, 9, 16)));

        let c = cron("*/15 * * * *");
        for minute in [0, 15, 30, 45] {
            assert!(c.matches(at(2024, 3, 4, 12, minute)));
        }
        assert!(!c.matches(at(2024, 3, 4, 12, 20)));

        let c = cron("10-30/5 * * * *");
        for minute in [10, 15, 20, 25, 30] {
            assert!(c.matches(at(2024, 3, 4, 12, minute)));
        }
        assert!(!c.matches(at(2024, 3, 4, 12, 35)));
    }

    #[test]
    fn test_step_from_value() {
        // N/S runs from N to the field maximum
        let c = cron("* 20/2 * * *");
        assert!(c.matches(at(2024, 3, 4, 20, 0)));
        assert!(c.matches(at(2024, 3, 4, 22, 0)));
        assert!(!c.matches(at(2024, 3, 4, 21, 0)));
        assert!(!c.matches(at(2024, 3, 4, 18, 0)));
    }

    #[test]
    fn test_all_fields_must_match() {
        // day AND day-of-week both restrict
        let c = cron("0 0 1 1 0");
        // 2023-01-01 was a Sunday
        assert!(c.matches(at(2023, 1, 1, 0, 0)));
        // 2024-01-01 was a Monday
        assert!(!c.matches(at(2024, 1, 1, 0, 0)));
    }

    #[test]
    fn test_sunday_aliases() {
        let seven: CronExpr = cron("0 0 * * 7");
        let zero: CronExpr = cron("0 0 * * 0");
        let sunday = at(2024, 3, 3, 0, 0);
        assert!(seven.matches(sunday));
        assert!(zero.matches(sunday));
        assert_eq!(seven, zero);
    }

    #[test]
    fn test_rejects_malformed_expressions() {
        for bad in [
            "* * * *",
            "* * * * * *",
            "60 * * * *",
            "* 24 * * *",
            "* * 0 * *",
            "* * * 13 *",
            "* * * * 8",
            "a * * * *",
            "5-1 * * * *",
            "*/0 * * * *",
            "1--2 * * * *",
        ] {
            assert!(bad.parse::<CronExpr>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_schedule_classification() {
        assert_eq!("@reboot".parse::<Schedule>().unwrap(), Schedule::Reboot);
        assert_eq!(
            "@every 5m".parse::<Schedule>().unwrap(),
            Schedule::Every(Duration::from_secs(300))
        );
        assert_eq!(
            "@after 2s".parse::<Schedule>().unwrap(),
            Schedule::After(Duration::from_secs(2))
        );
        assert!(matches!("* * * * *".parse::<Schedule>().unwrap(), Schedule::Cron(_)));
        assert!("@daily".parse::<Schedule>().is_err());
        assert!("@every".parse::<Schedule>().is_err());
    }

    #[test]
    fn test_interval_forms() {
        assert_eq!(parse_interval("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_interval("00:05:00").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_interval("01:30").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_interval("2 hours").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_interval("1h 30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_interval("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_interval("1 week").unwrap(), Duration::from_secs(604_800));
    }

    #[test]
    fn test_interval_rejects_garbage() {
        for bad in ["", "0", "abc", "5 fortnights", "1:2:3:4", "-5s"] {
            assert!(parse_interval(bad).is_err(), "accepted {bad:?}");
        }
    }
}
