//! Scalar parsers shared by the coercion layer, the rule catalogue and config:
//! booleans, duration literals and time values in a configurable list of
//! layouts.

use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Local, NaiveDate, NaiveDateTime, TimeZone};
use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serializer};

const DEFAULT_LAYOUTS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y%m%d%H%M%S",
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%Y%m%d",
];

static LAYOUTS: LazyLock<RwLock<Vec<String>>> =
    LazyLock::new(|| RwLock::new(DEFAULT_LAYOUTS.iter().map(|s| (*s).to_owned()).collect()));

/// Replaces the list of layouts tried by [`parse_time`], in order.
pub fn set_time_layouts<I, S>(layouts: I)
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    *LAYOUTS.write() = layouts.into_iter().map(Into::into).collect();
}

/// The layouts currently tried by [`parse_time`].
pub fn time_layouts() -> Vec<String> {
    LAYOUTS.read().clone()
}

/// Parses a time in RFC 3339, RFC 2822 or any configured chrono layout.
///
/// Layouts without an offset are read in local time; date-only layouts
/// resolve to midnight.
pub fn parse_time(s: &str) -> Option<DateTime<FixedOffset>> {
    let s = s.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t);
    }
    if let Ok(t) = DateTime::parse_from_rfc2822(s) {
        return Some(t);
    }
    for layout in LAYOUTS.read().iter() {
        if let Ok(t) = DateTime::parse_from_str(s, layout) {
            return Some(t);
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, layout) {
            return local(naive);
        }
        if let Ok(date) = NaiveDate::parse_from_str(s, layout) {
            return date.and_hms_opt(0, 0, 0).and_then(local);
        }
    }
    None
}

fn local(naive: NaiveDateTime) -> Option<DateTime<FixedOffset>> {
    Local.from_local_datetime(&naive).earliest().map(|t| t.fixed_offset())
}

/// Parses the common boolean spellings; the empty string is `true`.
pub fn parse_bool(s: &str) -> Option<bool> {
    match s.trim() {
        "" | "1" | "t" | "T" | "true" | "TRUE" | "True" | "on" | "yes" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" | "off" | "no"   => Some(false),
        _ => None,
    }
}

/// Parses a duration literal: a sequence of decimal numbers with units
/// `ns`, `us`/`µs`, `ms`, `s`, `m`, `h`, e.g. `1h30m` or `2.5s`. `0` needs no unit.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s == "0" {
        return Some(Duration::ZERO);
    }
    if s.is_empty() {
        return None;
    }
    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return None;
        }
        let value: f64 = rest[..num_len].parse().ok()?;
        rest = &rest[num_len..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per = match &rest[..unit_len] {
            "ns"        => 1.0,
            "us" | "µs" => 1e3,
            "ms"        => 1e6,
            "s"         => 1e9,
            "m"         => 60e9,
            "h"         => 3600e9,
            _ => return None,
        };
        total += value * nanos_per;
        rest = &rest[unit_len..];
    }
    Some(Duration::from_nanos(total.round() as u64))
}

/// Formats a duration the way [`parse_duration`] reads it.
pub fn format_duration(d: Duration) -> String {
    if d.is_zero() {
        return "0s".to_owned();
    }
    let nanos = d.as_nanos();
    if nanos % 1_000_000_000 != 0 {
        return if nanos % 1_000_000 == 0 {
            format!("{}ms", nanos / 1_000_000)
        } else {
            format!("{nanos}ns")
        };
    }
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, secs % 3600 / 60, secs % 60);
    let mut out = String::new();
    if h > 0 {
        out.push_str(&format!("{h}h"));
    }
    if m > 0 {
        out.push_str(&format!("{m}m"));
    }
    if s > 0 {
        out.push_str(&format!("{s}s"));
    }
    out
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DurationRepr {
    Text(String),
    Nanos(u64),
}

/// Serde helper accepting either a duration literal or integer nanoseconds.
pub fn deserialize_duration<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    match DurationRepr::deserialize(d)? {
        DurationRepr::Text(s) => parse_duration(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid duration `{s}`"))),
        DurationRepr::Nanos(n) => Ok(Duration::from_nanos(n)),
    }
}

/// Serde helper writing a duration as a literal.
pub fn serialize_duration<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format_duration(*d))
}

/// Serde helper reading a time through [`parse_time`].
pub fn deserialize_time<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<FixedOffset>, D::Error> {
    let s = String::deserialize(d)?;
    parse_time(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid time `{s}`")))
}

#[cfg(test)]
mod tests {
    use chrono::{Datelike, Timelike};

    use super::*;

    #[test]
    fn durations() {
        assert_eq!(parse_duration("80ms"), Some(Duration::from_millis(80)));
        assert_eq!(parse_duration("1h30m"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration("2.5s"), Some(Duration::from_millis(2500)));
        assert_eq!(parse_duration("0"), Some(Duration::ZERO));
        assert_eq!(parse_duration("10"), None);
        assert_eq!(parse_duration("3d"), None);
        assert_eq!(format_duration(Duration::from_secs(5400)), "1h30m");
        assert_eq!(format_duration(Duration::from_millis(80)), "80ms");
    }

    #[test]
    fn booleans() {
        assert_eq!(parse_bool(""), Some(true));
        assert_eq!(parse_bool("FALSE"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn times() {
        let t = parse_time("2024-03-01T10:20:30Z").unwrap();
        assert_eq!((t.year(), t.month(), t.day(), t.hour()), (2024, 3, 1, 10));
        let d = parse_time("2024-03-01").unwrap();
        assert_eq!((d.year(), d.month(), d.day()), (2024, 3, 1));
        assert!(parse_time("yesterday").is_none());
    }
}
