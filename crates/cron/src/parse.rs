//! Durations, timestamps, and their display forms.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{Error, Result};

const UNITS: &[(&str, u64)] = &[
    ("d", 86_400_000),
    ("h", 3_600_000),
    ("m", 60_000),
    ("s", 1_000),
    ("ms", 1),
];

/// Current wall-clock time in epoch millis.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Parse `30s`, `5m`, `2h`, `1d`, `250ms`, or a compound such as `1h30m`.
pub fn parse_duration_ms(input: &str) -> Result<u64> {
    let input = input.trim();
    if input.is_empty() {
        return Err(Error::invalid_schedule("empty duration"));
    }

    let mut total: u64 = 0;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(Error::invalid_schedule(format!("expected a number in '{input}'")));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|_| Error::invalid_schedule(format!("number out of range in '{input}'")))?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        let Some((_, factor)) = UNITS.iter().find(|(name, _)| *name == unit) else {
            return Err(Error::invalid_schedule(if unit.is_empty() {
                format!("duration '{input}' is missing a unit (ms/s/m/h/d)")
            } else {
                format!("unknown duration unit '{unit}' (expected ms/s/m/h/d)")
            }));
        };
        total = value
            .checked_mul(*factor)
            .and_then(|ms| total.checked_add(ms))
            .ok_or_else(|| Error::invalid_schedule(format!("duration '{input}' is too large")))?;
        rest = &rest[unit_len..];
    }

    if total == 0 {
        return Err(Error::invalid_schedule("duration must be greater than zero"));
    }
    Ok(total)
}

pub fn parse_duration(input: &str) -> Result<Duration> {
    parse_duration_ms(input).map(Duration::from_millis)
}

/// Parse an RFC 3339 timestamp into epoch millis.
pub fn parse_absolute_time_ms(input: &str) -> Result<u64> {
    let dt = DateTime::parse_from_rfc3339(input.trim())
        .map_err(|e| Error::invalid_schedule(format!("invalid timestamp '{input}': {e}")))?;
    u64::try_from(dt.timestamp_millis())
        .map_err(|_| Error::invalid_schedule(format!("timestamp '{input}' is before 1970")))
}

/// Largest whole unit that represents `ms` exactly, e.g. `90s`, `2h`.
#[must_use]
pub fn format_duration_ms(ms: u64) -> String {
    UNITS
        .iter()
        .find(|(_, factor)| ms >= *factor && ms % factor == 0)
        .map(|(unit, factor)| format!("{}{unit}", ms / factor))
        .unwrap_or_else(|| format!("{ms}ms"))
}

/// RFC 3339 rendering of an epoch-millis timestamp.
#[must_use]
pub fn format_ms(ms: u64) -> String {
    i64::try_from(ms)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| format!("{ms}ms"))
}
