//! Ordered chain of typed parse attempts
//!
//! Each rule either claims a raw field value with a typed result or passes.
//! The first rule that matches decides the value's type; a value no rule
//! claims stays a string.

use super::types::TypedValue;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};

/// Outcome of one parse attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Coercion {
    Matched(TypedValue),
    NoMatch,
}

type Rule = fn(&str) -> Coercion;

/// Rules in priority order. HL7 timestamps come first so that digit-only
/// values such as `19900101` are not captured as integers.
const CHAIN: [Rule; 5] = [hl7_timestamp, integer, float, iso_timestamp, boolean];

/// Run the chain over a non-null value
pub fn coerce(value: &str) -> Coercion {
    for rule in CHAIN {
        if let matched @ Coercion::Matched(_) = rule(value) {
            return matched;
        }
    }
    Coercion::NoMatch
}

/// HL7 DTM: `YYYYMMDD[HHMM[SS[.S[S[S[S]]]]]][+/-ZZZZ]`
pub fn hl7_timestamp(value: &str) -> Coercion {
    parse_hl7_timestamp(value)
        .map(|ts| Coercion::Matched(TypedValue::Timestamp(ts)))
        .unwrap_or(Coercion::NoMatch)
}

fn parse_hl7_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let (body, offset) = split_offset(value)?;
    let (main, fraction) = match body.split_once('.') {
        Some((main, fraction)) => (main, Some(fraction)),
        None => (body, None),
    };

    if !matches!(main.len(), 8 | 12 | 14) || !all_digits(main) {
        return None;
    }
    // A fraction only follows full seconds
    if fraction.is_some() && main.len() != 14 {
        return None;
    }

    let date = NaiveDate::from_ymd_opt(
        main[0..4].parse().ok()?,
        main[4..6].parse().ok()?,
        main[6..8].parse().ok()?,
    )?;

    let hour = digits_at(main, 8).unwrap_or(0);
    let minute = digits_at(main, 10).unwrap_or(0);
    let second = digits_at(main, 12).unwrap_or(0);

    let nanos = match fraction {
        Some(f) if (1..=4).contains(&f.len()) && all_digits(f) => {
            format!("{:0<9}", f).parse::<u32>().ok()?
        },
        Some(_) => return None,
        None => 0,
    };

    let time = NaiveTime::from_hms_nano_opt(hour, minute, second, nanos)?;
    let naive = date.and_time(time);

    match offset {
        Some(offset) => offset
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.with_timezone(&Utc)),
        None => Some(Utc.from_utc_datetime(&naive)),
    }
}

/// Split a trailing `+ZZZZ` / `-ZZZZ` offset. Returns `None` when an offset is
/// present but malformed.
fn split_offset(value: &str) -> Option<(&str, Option<FixedOffset>)> {
    let Some(idx) = value.rfind(['+', '-']) else {
        return Some((value, None));
    };

    let zone = &value[idx + 1..];
    if idx == 0 || zone.len() != 4 || !all_digits(zone) {
        return None;
    }

    let hours: i32 = zone[0..2].parse().ok()?;
    let minutes: i32 = zone[2..4].parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }

    let sign = if value[idx..].starts_with('-') { -1 } else { 1 };
    let seconds = sign * (hours * 3600 + minutes * 60);
    Some((&value[..idx], Some(FixedOffset::east_opt(seconds)?)))
}

/// Signed decimal integer without leading zeros
pub fn integer(value: &str) -> Coercion {
    let digits = value.strip_prefix(['+', '-']).unwrap_or(value);
    if digits.is_empty() || !all_digits(digits) || has_leading_zero(digits) {
        return Coercion::NoMatch;
    }

    match value.parse::<i64>() {
        Ok(i) => Coercion::Matched(TypedValue::Integer(i)),
        Err(_) => Coercion::NoMatch,
    }
}

/// Decimal number with a point, e.g. `98.6`, `-0.25`, `.5`
pub fn float(value: &str) -> Coercion {
    let unsigned = value.strip_prefix(['+', '-']).unwrap_or(value);
    let Some((whole, fraction)) = unsigned.split_once('.') else {
        return Coercion::NoMatch;
    };

    if (whole.is_empty() && fraction.is_empty())
        || !all_digits(whole)
        || !all_digits(fraction)
        || has_leading_zero(whole)
    {
        return Coercion::NoMatch;
    }

    match value.parse::<f64>() {
        Ok(f) if f.is_finite() => Coercion::Matched(TypedValue::Float(f)),
        _ => Coercion::NoMatch,
    }
}

const NAIVE_DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// RFC 3339 and the common ISO-8601 shapes
pub fn iso_timestamp(value: &str) -> Coercion {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Coercion::Matched(TypedValue::Timestamp(dt.with_timezone(&Utc)));
    }

    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Coercion::Matched(TypedValue::Timestamp(Utc.from_utc_datetime(&naive)));
        }
    }

    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Coercion::Matched(TypedValue::Timestamp(Utc.from_utc_datetime(&naive))))
        .unwrap_or(Coercion::NoMatch)
}

/// HL7 ID table 0136 (yes/no indicator)
pub fn boolean(value: &str) -> Coercion {
    match value {
        "Y" => Coercion::Matched(TypedValue::Boolean(true)),
        "N" => Coercion::Matched(TypedValue::Boolean(false)),
        _ => Coercion::NoMatch,
    }
}

fn all_digits(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_digit())
}

fn has_leading_zero(digits: &str) -> bool {
    digits.len() > 1 && digits.starts_with('0')
}

fn digits_at(s: &str, start: usize) -> Option<u32> {
    s.get(start..start + 2).and_then(|d| d.parse().ok())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::inference::types::ColumnType;

    fn kind(value: &str) -> Option<ColumnType> {
        match coerce(value) {
            Coercion::Matched(v) => Some(v.column_type()),
            Coercion::NoMatch => None,
        }
    }

    fn timestamp(value: &str) -> DateTime<Utc> {
        match hl7_timestamp(value) {
            Coercion::Matched(TypedValue::Timestamp(ts)) => ts,
            other => panic!("{value} did not parse as a timestamp: {other:?}"),
        }
    }

    #[test]
    fn test_chain_priorities() {
        assert_eq!(kind("20230401120000"), Some(ColumnType::Timestamp));
        assert_eq!(kind("19900101"), Some(ColumnType::Timestamp));
        assert_eq!(kind("42"), Some(ColumnType::Integer));
        assert_eq!(kind("-7"), Some(ColumnType::Integer));
        assert_eq!(kind("0"), Some(ColumnType::Integer));
        assert_eq!(kind("42.5"), Some(ColumnType::Float));
        assert_eq!(kind("2023-04-01T12:00:00Z"), Some(ColumnType::Timestamp));
        assert_eq!(kind("2023-04-01"), Some(ColumnType::Timestamp));
        assert_eq!(kind("Y"), Some(ColumnType::Boolean));
        assert_eq!(kind("N"), Some(ColumnType::Boolean));
    }

    #[test]
    fn test_unmatched_values_fall_through() {
        assert_eq!(kind("001"), None);
        assert_eq!(kind("007.5"), None);
        assert_eq!(kind("Alice"), None);
        assert_eq!(kind("8310-5^Body temperature"), None);
        assert_eq!(kind("yes"), None);
        assert_eq!(kind("1e5"), None);
        assert_eq!(kind("."), None);
        assert_eq!(kind("99999999999999999999"), None);
    }

    #[test]
    fn test_invalid_calendar_dates_are_not_timestamps() {
        assert_eq!(hl7_timestamp("20230230"), Coercion::NoMatch);
        assert_eq!(hl7_timestamp("20231301"), Coercion::NoMatch);
        assert_eq!(hl7_timestamp("202304011260"), Coercion::NoMatch);
        // A valid 8-digit number that is not a date is still an integer
        assert_eq!(kind("12345678"), Some(ColumnType::Integer));
    }

    #[test]
    fn test_hl7_timestamp_precisions() {
        use chrono::Timelike;

        assert_eq!(
            timestamp("202304011230").to_rfc3339(),
            "2023-04-01T12:30:00+00:00"
        );
        assert_eq!(timestamp("20230401123015.25").nanosecond(), 250_000_000);
        assert_eq!(hl7_timestamp("20230401123015.12345"), Coercion::NoMatch);
        assert_eq!(hl7_timestamp("202304011230.5"), Coercion::NoMatch);
    }

    #[test]
    fn test_hl7_timestamp_offset_converted_to_utc() {
        assert_eq!(
            timestamp("20230401120000-0500").to_rfc3339(),
            "2023-04-01T17:00:00+00:00"
        );
        assert_eq!(
            timestamp("20230401120000+0130").to_rfc3339(),
            "2023-04-01T10:30:00+00:00"
        );
        assert_eq!(hl7_timestamp("20230401120000+05"), Coercion::NoMatch);
    }

    #[test]
    fn test_float_shapes() {
        assert_eq!(float("98.6"), Coercion::Matched(TypedValue::Float(98.6)));
        assert_eq!(float("-0.25"), Coercion::Matched(TypedValue::Float(-0.25)));
        assert_eq!(float(".5"), Coercion::Matched(TypedValue::Float(0.5)));
        assert_eq!(float("5."), Coercion::Matched(TypedValue::Float(5.0)));
        assert_eq!(float("5"), Coercion::NoMatch);
        assert_eq!(float("1.2.3"), Coercion::NoMatch);
    }
}
