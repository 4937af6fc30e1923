//! GPX timestamp text conversion.
//!
//! Timestamps are written as ISO-8601 with the fractional part trimmed of
//! trailing zeros and a `Z` suffix. In time-zone-ignoring mode the suffix is
//! dropped on write, and any offset found on read is discarded so the wall
//! clock digits are taken as UTC.

use chrono::{DateTime, NaiveDateTime, Utc};

const NAIVE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

pub fn format_time(time: &DateTime<Utc>, ignore_time_zone: bool) -> String {
    let mut text = time.format("%Y-%m-%dT%H:%M:%S").to_string();
    let nanos = time.timestamp_subsec_nanos() % 1_000_000_000;
    if nanos > 0 {
        let fraction = format!("{nanos:09}");
        text.push('.');
        text.push_str(fraction.trim_end_matches('0'));
    }
    if !ignore_time_zone {
        text.push('Z');
    }
    text
}

pub fn parse_time(text: &str, ignore_time_zone: bool) -> Option<DateTime<Utc>> {
    let text = text.trim();
    let (naive_part, offset) = split_offset(text);
    if ignore_time_zone || offset.is_none() {
        return NaiveDateTime::parse_from_str(naive_part, NAIVE_FORMAT)
            .ok()
            .map(|naive| naive.and_utc());
    }
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Splits `2024-01-01T10:00:00+02:00` into the local part and its offset.
fn split_offset(text: &str) -> (&str, Option<&str>) {
    if let Some(stripped) = text.strip_suffix(['Z', 'z']) {
        return (stripped, Some("Z"));
    }
    if text.len() > 6 && text.is_char_boundary(text.len() - 6) {
        let (head, tail) = text.split_at(text.len() - 6);
        let bytes = tail.as_bytes();
        let looks_like_offset = matches!(bytes[0], b'+' | b'-')
            && bytes[1].is_ascii_digit()
            && bytes[2].is_ascii_digit()
            && bytes[3] == b':'
            && bytes[4].is_ascii_digit()
            && bytes[5].is_ascii_digit();
        if looks_like_offset {
            return (head, Some(tail));
        }
    }
    (text, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn test_format_whole_seconds() {
        let t = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(format_time(&t, false), "2024-03-09T07:05:01Z");
    }

    #[test]
    fn test_format_trims_fraction() {
        let t = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap().with_nanosecond(250_000_000).unwrap();
        assert_eq!(format_time(&t, false), "2024-03-09T07:05:01.25Z");
    }

    #[test]
    fn test_format_without_zone() {
        let t = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(format_time(&t, true), "2024-03-09T07:05:01");
    }

    #[test]
    fn test_parse_offset_is_applied() {
        let t = parse_time("2024-03-09T09:05:01+02:00", false).unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap());
    }

    #[test]
    fn test_parse_offset_ignored() {
        let t = parse_time("2024-03-09T09:05:01+02:00", true).unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2024, 3, 9, 9, 5, 1).unwrap());
    }

    #[test]
    fn test_parse_fraction_and_zulu() {
        let t = parse_time("2024-03-09T07:05:01.5Z", false).unwrap();
        assert_eq!(t.timestamp_subsec_millis(), 500);
    }

    #[test]
    fn test_parse_naive_as_utc() {
        let t = parse_time("2024-03-09T07:05:01", false).unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap());
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_time("yesterday", false).is_none());
        assert!(parse_time("", true).is_none());
    }

    #[test]
    fn test_format_parse_agree() {
        let t = Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 59).unwrap().with_nanosecond(123_456_000).unwrap();
        assert_eq!(parse_time(&format_time(&t, false), false), Some(t));
        assert_eq!(parse_time(&format_time(&t, true), true), Some(t));
    }
}
