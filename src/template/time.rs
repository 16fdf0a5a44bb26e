//! Time-Range Resolver
//!
//! Converts dashboard time expressions into epoch-millisecond boundaries.
//!
//! # Supported Syntax
//!
//! ```text
//! now
//! now-7d            now+1h
//! now/d             now-1d/d     (rounded to the unit)
//! 1700000000000     (epoch millis)
//! 2024-01-31T12:00:00Z
//! 2024-01-31 12:00:00
//! 2024-01-31
//! ```
//!
//! Relative units use fixed lengths: a month is 30.44 days (2 629 800 s) and
//! a year is 365.25 days (31 557 600 s). Dashboards compute relative ranges
//! with the same approximations, so calendar arithmetic is not attempted.
//!
//! A trailing `/unit` truncates to the start of that calendar unit (UTC,
//! weeks start on Monday). As the end of a range it rounds up to the last
//! millisecond of the unit instead, so `now/d` .. `now/d` covers today.

use crate::template::error::{TemplateError, TemplateResult};
use chrono::{
    DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone,
    Timelike, Utc,
};
use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{char, digit1, multispace0},
    combinator::{all_consuming, map_res, opt, value},
    sequence::{pair, preceded, tuple},
    IResult,
};
use serde::{Deserialize, Serialize};

/// Unit of a relative time offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    /// 30.44 days
    Month,
    /// 365.25 days
    Year,
}

impl TimeUnit {
    /// Length of the unit in seconds
    pub fn seconds(&self) -> i64 {
        match self {
            Self::Second => 1,
            Self::Minute => 60,
            Self::Hour => 3_600,
            Self::Day => 86_400,
            Self::Week => 604_800,
            Self::Month => 2_629_800,
            Self::Year => 31_557_600,
        }
    }

    /// Short suffix used in expressions (`m` is minutes, `M` is months)
    pub fn suffix(&self) -> char {
        match self {
            Self::Second => 's',
            Self::Minute => 'm',
            Self::Hour => 'h',
            Self::Day => 'd',
            Self::Week => 'w',
            Self::Month => 'M',
            Self::Year => 'y',
        }
    }
}

/// A single time boundary expression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeSpec {
    /// `now` shifted by `amount` units (negative is the past), then
    /// optionally rounded to a calendar unit
    Relative {
        amount: i64,
        unit: TimeUnit,
        round: Option<TimeUnit>,
    },
    /// Fixed instant
    Absolute { epoch_millis: i64 },
}

impl TimeSpec {
    /// `now` itself
    pub fn now() -> Self {
        Self::Relative {
            amount: 0,
            unit: TimeUnit::Second,
            round: None,
        }
    }

    /// Parse an expression such as `now-7d` or `2024-01-31`
    pub fn parse(input: &str) -> TemplateResult<Self> {
        let input = input.trim();

        if let Ok((_, spec)) = all_consuming(parse_relative)(input) {
            return Ok(spec);
        }
        if let Ok((_, millis)) = all_consuming(parse_epoch_millis)(input) {
            return Ok(Self::Absolute {
                epoch_millis: millis,
            });
        }
        parse_datetime(input)
            .map(|epoch_millis| Self::Absolute { epoch_millis })
            .ok_or_else(|| TemplateError::InvalidTimeSpec(input.to_string()))
    }

    /// Resolve against `now` (epoch millis), rounding down
    pub fn resolve(&self, now_millis: i64) -> TemplateResult<i64> {
        self.resolve_bound(now_millis, false)
    }

    /// Resolve as a range boundary; `round_up` is set for the end of a range
    pub fn resolve_bound(&self, now_millis: i64, round_up: bool) -> TemplateResult<i64> {
        match *self {
            Self::Absolute { epoch_millis } => Ok(epoch_millis),
            Self::Relative {
                amount,
                unit,
                round,
            } => amount
                .checked_mul(unit.seconds())
                .and_then(|secs| secs.checked_mul(1000))
                .and_then(|offset| now_millis.checked_add(offset))
                .and_then(|shifted| match round {
                    Some(round) => round_millis(shifted, round, round_up),
                    None => Some(shifted),
                })
                .ok_or_else(|| TemplateError::InvalidTimeSpec(self.to_string())),
        }
    }
}

impl std::fmt::Display for TimeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Relative {
                amount,
                unit,
                round,
            } => {
                write!(f, "now")?;
                if *amount < 0 {
                    write!(f, "-{}{}", amount.unsigned_abs(), unit.suffix())?;
                } else if *amount > 0 {
                    write!(f, "+{}{}", amount, unit.suffix())?;
                }
                match round {
                    Some(round) => write!(f, "/{}", round.suffix()),
                    None => Ok(()),
                }
            }
            Self::Absolute { epoch_millis } => write!(f, "{}", epoch_millis),
        }
    }
}

/// Parse an expression and resolve it in one step
pub fn resolve(input: &str, now: DateTime<Utc>) -> TemplateResult<i64> {
    TimeSpec::parse(input)?.resolve(now.timestamp_millis())
}

/// Unresolved dashboard time range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: TimeSpec,
    pub to: TimeSpec,
}

impl TimeRange {
    pub fn new(from: TimeSpec, to: TimeSpec) -> Self {
        Self { from, to }
    }

    /// Parse both boundaries
    pub fn parse(from: &str, to: &str) -> TemplateResult<Self> {
        Ok(Self {
            from: TimeSpec::parse(from)?,
            to: TimeSpec::parse(to)?,
        })
    }

    /// Resolve both boundaries against the same `now`
    pub fn resolve(&self, now: DateTime<Utc>) -> TemplateResult<ResolvedTimeRange> {
        let now_millis = now.timestamp_millis();
        ResolvedTimeRange::new(
            self.from.resolve_bound(now_millis, false)?,
            self.to.resolve_bound(now_millis, true)?,
        )
    }
}

impl Default for TimeRange {
    /// Last 7 days
    fn default() -> Self {
        Self {
            from: TimeSpec::Relative {
                amount: -7,
                unit: TimeUnit::Day,
                round: None,
            },
            to: TimeSpec::now(),
        }
    }
}

/// Concrete boundaries, `from_millis <= to_millis`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolvedTimeRange {
    pub from_millis: i64,
    pub to_millis: i64,
}

impl ResolvedTimeRange {
    pub fn new(from_millis: i64, to_millis: i64) -> TemplateResult<Self> {
        if from_millis > to_millis {
            return Err(TemplateError::InvalidTimeRange {
                from: from_millis,
                to: to_millis,
            });
        }
        Ok(Self {
            from_millis,
            to_millis,
        })
    }

    /// `from` as an ISO-8601 UTC string with millisecond precision
    pub fn from_iso(&self) -> String {
        iso_millis(self.from_millis)
    }

    /// `to` as an ISO-8601 UTC string with millisecond precision
    pub fn to_iso(&self) -> String {
        iso_millis(self.to_millis)
    }

    pub fn duration_millis(&self) -> i64 {
        self.to_millis - self.from_millis
    }
}

fn iso_millis(millis: i64) -> String {
    match Utc.timestamp_millis_opt(millis).single() {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => millis.to_string(),
    }
}

/// Parse `now`, `now-7d`, `now+1h`, `now-1d/d`
fn parse_relative(input: &str) -> IResult<&str, TimeSpec> {
    let (input, _) = tag("now")(input)?;
    let (input, offset) = opt(tuple((
        preceded(multispace0, alt((value(-1i64, char('-')), value(1i64, char('+'))))),
        preceded(multispace0, map_res(digit1, |s: &str| s.parse::<i64>())),
        parse_unit,
    )))(input)?;
    let (input, round) = opt(preceded(pair(multispace0, char('/')), parse_unit))(input)?;

    let (amount, unit) = match offset {
        Some((sign, amount, unit)) => (sign * amount, unit),
        None => (0, TimeUnit::Second),
    };
    Ok((input, TimeSpec::Relative { amount, unit, round }))
}

/// Start of the calendar unit containing `millis`, or its last millisecond
fn round_millis(millis: i64, unit: TimeUnit, up: bool) -> Option<i64> {
    let instant = Utc.timestamp_millis_opt(millis).single()?;
    let date = instant.date_naive();
    let start = match unit {
        TimeUnit::Second => instant.naive_utc().with_nanosecond(0)?,
        TimeUnit::Minute => date.and_hms_opt(instant.hour(), instant.minute(), 0)?,
        TimeUnit::Hour => date.and_hms_opt(instant.hour(), 0, 0)?,
        TimeUnit::Day => date.and_hms_opt(0, 0, 0)?,
        TimeUnit::Week => date
            .checked_sub_signed(Duration::days(
                date.weekday().num_days_from_monday() as i64,
            ))?
            .and_hms_opt(0, 0, 0)?,
        TimeUnit::Month => NaiveDate::from_ymd_opt(date.year(), date.month(), 1)?.and_hms_opt(0, 0, 0)?,
        TimeUnit::Year => NaiveDate::from_ymd_opt(date.year(), 1, 1)?.and_hms_opt(0, 0, 0)?,
    };
    let start = Utc.from_utc_datetime(&start);
    if !up {
        return Some(start.timestamp_millis());
    }

    let next = match unit {
        TimeUnit::Month => start.checked_add_months(Months::new(1))?,
        TimeUnit::Year => start.checked_add_months(Months::new(12))?,
        fixed => start.checked_add_signed(Duration::seconds(fixed.seconds()))?,
    };
    Some(next.timestamp_millis() - 1)
}

/// Parse a unit suffix (case-sensitive: `m` minutes, `M` months)
fn parse_unit(input: &str) -> IResult<&str, TimeUnit> {
    alt((
        value(TimeUnit::Second, char('s')),
        value(TimeUnit::Minute, char('m')),
        value(TimeUnit::Hour, char('h')),
        value(TimeUnit::Day, char('d')),
        value(TimeUnit::Week, char('w')),
        value(TimeUnit::Month, char('M')),
        value(TimeUnit::Year, char('y')),
    ))(input)
}

fn parse_epoch_millis(input: &str) -> IResult<&str, i64> {
    map_res(
        pair(opt(char('-')), digit1),
        |(sign, digits): (Option<char>, &str)| {
            digits
                .parse::<i64>()
                .map(|v| if sign.is_some() { -v } else { v })
        },
    )(input)
}

fn parse_datetime(input: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.timestamp_millis());
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
            return Some(Utc.from_utc_datetime(&naive).timestamp_millis());
        }
    }
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive).timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_now() {
        assert_eq!(TimeSpec::parse("now").unwrap(), TimeSpec::now());
    }

    #[test]
    fn test_parse_relative() {
        assert_eq!(
            TimeSpec::parse("now-7d").unwrap(),
            TimeSpec::Relative {
                amount: -7,
                unit: TimeUnit::Day,
                round: None,
            }
        );
        assert_eq!(
            TimeSpec::parse("now+2h").unwrap(),
            TimeSpec::Relative {
                amount: 2,
                unit: TimeUnit::Hour,
                round: None,
            }
        );
    }

    #[test]
    fn test_minutes_and_months_differ() {
        let now = fixed_now().timestamp_millis();
        let minutes = TimeSpec::parse("now-1m").unwrap().resolve(now).unwrap();
        let months = TimeSpec::parse("now-1M").unwrap().resolve(now).unwrap();
        assert_eq!(now - minutes, 60_000);
        assert_eq!(now - months, 2_629_800_000);
    }

    #[test]
    fn test_unit_table() {
        let now = fixed_now();
        let base = now.timestamp_millis();
        assert_eq!(resolve("now-1s", now).unwrap(), base - 1_000);
        assert_eq!(resolve("now-1h", now).unwrap(), base - 3_600_000);
        assert_eq!(resolve("now-1d", now).unwrap(), base - 86_400_000);
        assert_eq!(resolve("now-1w", now).unwrap(), base - 604_800_000);
        assert_eq!(resolve("now-1y", now).unwrap(), base - 31_557_600_000);
    }

    #[test]
    fn test_absolute_passes_through() {
        let now = fixed_now();
        assert_eq!(resolve("1700000000000", now).unwrap(), 1_700_000_000_000);
        assert_eq!(
            resolve("2024-01-01T00:00:00Z", now).unwrap(),
            1_704_067_200_000
        );
        assert_eq!(resolve("2024-01-01", now).unwrap(), 1_704_067_200_000);
        assert_eq!(
            resolve("2024-01-01 00:00:10", now).unwrap(),
            1_704_067_210_000
        );
    }

    #[test]
    fn test_invalid_spec() {
        for bad in ["yesterday", "now-7x", "now-", "now-7d/x", "now/", ""] {
            assert!(
                matches!(TimeSpec::parse(bad), Err(TemplateError::InvalidTimeSpec(_))),
                "expected failure for {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_range_resolution() {
        let range = TimeRange::parse("now-1h", "now").unwrap();
        let resolved = range.resolve(fixed_now()).unwrap();
        assert_eq!(resolved.duration_millis(), 3_600_000);
        assert_eq!(resolved.to_iso(), "2024-03-01T12:00:00.000Z");
        assert_eq!(resolved.from_iso(), "2024-03-01T11:00:00.000Z");
    }

    #[test]
    fn test_inverted_range() {
        let range = TimeRange::parse("now", "now-1d").unwrap();
        assert!(matches!(
            range.resolve(fixed_now()),
            Err(TemplateError::InvalidTimeRange { .. })
        ));
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        for expr in ["now", "now-30m", "now+1w", "now-6M", "now/d", "now-1M/M"] {
            assert_eq!(TimeSpec::parse(expr).unwrap().to_string(), expr);
        }
    }

    #[test]
    fn test_overflow_is_invalid() {
        let spec = TimeSpec::Relative {
            amount: i64::MAX,
            unit: TimeUnit::Year,
            round: None,
        };
        assert!(spec.resolve(0).is_err());
    }

    #[test]
    fn test_parse_rounding_suffix() {
        assert_eq!(
            TimeSpec::parse("now-1d/d").unwrap(),
            TimeSpec::Relative {
                amount: -1,
                unit: TimeUnit::Day,
                round: Some(TimeUnit::Day),
            }
        );
        assert_eq!(
            TimeSpec::parse("now/w").unwrap(),
            TimeSpec::Relative {
                amount: 0,
                unit: TimeUnit::Second,
                round: Some(TimeUnit::Week),
            }
        );
    }

    #[test]
    fn test_rounded_range_boundaries() {
        let now = fixed_now();

        let yesterday = TimeRange::parse("now-1d/d", "now-1d/d").unwrap().resolve(now).unwrap();
        assert_eq!(yesterday.from_iso(), "2024-02-29T00:00:00.000Z");
        assert_eq!(yesterday.to_iso(), "2024-02-29T23:59:59.999Z");

        let this_month = TimeRange::parse("now/M", "now/M").unwrap().resolve(now).unwrap();
        assert_eq!(this_month.from_iso(), "2024-03-01T00:00:00.000Z");
        assert_eq!(this_month.to_iso(), "2024-03-31T23:59:59.999Z");

        // 2024-03-01 is a Friday
        let week = TimeRange::parse("now/w", "now").unwrap().resolve(now).unwrap();
        assert_eq!(week.from_iso(), "2024-02-26T00:00:00.000Z");
        assert_eq!(week.to_iso(), "2024-03-01T12:00:00.000Z");

        assert_eq!(
            resolve("now-1h/h", Utc.with_ymd_and_hms(2024, 3, 1, 12, 34, 56).unwrap()).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap().timestamp_millis()
        );
    }
}
