//! Embargo window resolution.
//!
//! An embargo window is the half-open interval `[start, end)` of record end
//! times that are old enough to leave the source repository:
//! `end = now - embargo_hours` and `start = end - window` when a window is
//! configured, otherwise unbounded in the past.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{EmbargoError, Result};

/// A half-open time interval `[begin, end)`; a missing bound is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timespan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub begin: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

impl Timespan {
    pub fn new(begin: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        Self { begin, end }
    }

    pub fn bounded(begin: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            begin: Some(begin),
            end: Some(end),
        }
    }

    /// Whether `instant` falls inside `[begin, end)`.
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.begin.is_none_or(|b| b <= instant) && self.end.is_none_or(|e| instant < e)
    }
}

/// The interval of record end times that are outside the embargo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbargoWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: DateTime<Utc>,
}

impl EmbargoWindow {
    /// Resolve the window for a reference instant.
    ///
    /// `embargo_hours` must be finite and non-negative, and both bounds
    /// must stay within the representable date range.
    pub fn resolve(
        now: DateTime<Utc>,
        embargo_hours: f64,
        window: Option<Duration>,
    ) -> Result<Self> {
        let embargo = hours_to_duration(embargo_hours)?;
        let end = now.checked_sub_signed(embargo).ok_or_else(|| {
            EmbargoError::validation(format!(
                "embargo of {embargo_hours} hours reaches before the earliest representable time"
            ))
        })?;
        let start = window
            .map(|w| {
                end.checked_sub_signed(w).ok_or_else(|| {
                    EmbargoError::validation(format!(
                        "window of {w} reaches before the earliest representable time"
                    ))
                })
            })
            .transpose()?;
        Ok(Self { start, end })
    }

    /// Whether a record ending at `instant` may leave the source repository.
    ///
    /// A record ending exactly at `end` is still embargoed; one ending
    /// exactly at `start` is admitted.
    pub fn admits(&self, instant: DateTime<Utc>) -> bool {
        self.start.is_none_or(|s| s <= instant) && instant < self.end
    }

    /// Whether a record with the given validity timespan is admitted. Records
    /// without an end are never admitted.
    pub fn admits_timespan(&self, timespan: Option<&Timespan>) -> bool {
        timespan.and_then(|t| t.end).is_some_and(|end| self.admits(end))
    }

    pub fn as_timespan(&self) -> Timespan {
        Timespan::new(self.start, Some(self.end))
    }
}

impl fmt::Display for EmbargoWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.start {
            Some(start) => write!(f, "[{}, {})", start.to_rfc3339(), self.end.to_rfc3339()),
            None => write!(f, "[-inf, {})", self.end.to_rfc3339()),
        }
    }
}

/// Convert fractional hours to a duration at microsecond precision.
pub fn hours_to_duration(hours: f64) -> Result<Duration> {
    if !hours.is_finite() || hours < 0.0 {
        return Err(EmbargoError::validation(format!(
            "embargo hours must be a non-negative number, got {hours}"
        )));
    }
    let micros = (hours * 3_600_000_000.0).round();
    if micros > i64::MAX as f64 {
        return Err(EmbargoError::validation(format!(
            "embargo hours out of range: {hours}"
        )));
    }
    Ok(Duration::microseconds(micros as i64))
}

/// Parse a reference instant.
///
/// Accepts RFC 3339 timestamps and naive ISO-8601 timestamps (with `T` or a
/// space separator and any fractional precision), the latter read as UTC.
pub fn parse_instant(input: &str) -> Result<DateTime<Utc>> {
    let trimmed = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(EmbargoError::validation(format!(
        "cannot parse time '{input}'; expected ISO-8601 such as 2020-01-17T16:55:11.3227"
    )))
}

/// Resolve the reference instant for a run, refusing instants in the future.
pub fn resolve_now(requested: Option<&str>, clock: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let Some(text) = requested else {
        return Ok(clock);
    };
    let now = parse_instant(text)?;
    if now > clock {
        return Err(EmbargoError::validation(format!(
            "--now is in the future: {}",
            now.to_rfc3339()
        )));
    }
    Ok(now)
}

/// Parse a quantity string such as `3hr 5min 20s` or `18.5hr` into a duration.
pub fn parse_window(input: &str) -> Result<Duration> {
    let invalid = |why: &str| EmbargoError::validation(format!("invalid window '{input}': {why}"));

    let mut chars = input.trim().chars().peekable();
    let mut total_micros = 0f64;
    let mut terms = 0;

    while chars.peek().is_some() {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut number = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_ascii_digit() || c == '.' {
                number.push(c);
                chars.next();
            } else {
                break;
            }
        }
        if number.is_empty() {
            return Err(invalid("expected a number"));
        }
        let value: f64 = number
            .parse()
            .map_err(|_| invalid(&format!("bad number '{number}'")))?;

        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        let mut unit = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_ascii_alphabetic() {
                unit.push(c);
                chars.next();
            } else {
                break;
            }
        }
        let seconds_per_unit = match unit.to_ascii_lowercase().as_str() {
            "d" | "day" | "days" => 86_400.0,
            "h" | "hr" | "hrs" | "hour" | "hours" => 3_600.0,
            "min" | "mins" | "minute" | "minutes" => 60.0,
            "s" | "sec" | "secs" | "second" | "seconds" => 1.0,
            "" => return Err(invalid(&format!("missing unit after '{number}'"))),
            other => return Err(invalid(&format!("unknown unit '{other}'"))),
        };
        total_micros += value * seconds_per_unit * 1_000_000.0;
        terms += 1;
    }

    if terms == 0 {
        return Err(invalid("empty"));
    }
    let micros = total_micros.round();
    if micros > i64::MAX as f64 {
        return Err(invalid("out of range"));
    }
    Ok(Duration::microseconds(micros as i64))
}
