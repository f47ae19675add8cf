//! Utilities to format date-time values the way the ingestion endpoint expects them.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};

/// Formats a timestamp as RFC 3339 with millisecond precision and a `Z` suffix.
///
/// # Example
///
/// ```
/// use chrono::{TimeZone, Utc};
///
/// let time = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap();
/// assert_eq!(courier_common::time::format_timestamp(time), "2026-03-01T12:30:00.000Z");
/// ```
pub fn format_timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Formats a duration as a time span `d.hh:mm:ss.fff`.
///
/// The day component is omitted for durations shorter than one day.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// let span = courier_common::time::format_timespan(Duration::from_millis(61_042));
/// assert_eq!(span, "00:01:01.042");
/// ```
pub fn format_timespan(duration: Duration) -> String {
    let total_ms = duration.as_millis();

    let ms = total_ms % 1000;
    let sec = (total_ms / 1000) % 60;
    let min = (total_ms / 60_000) % 60;
    let hour = (total_ms / 3_600_000) % 24;
    let days = total_ms / 86_400_000;

    if days > 0 {
        format!("{days}.{hour:02}:{min:02}:{sec:02}.{ms:03}")
    } else {
        format!("{hour:02}:{min:02}:{sec:02}.{ms:03}")
    }
}

/// Formats a millisecond count as a time span.
///
/// Negative or non-finite inputs are treated as zero.
pub fn format_timespan_ms(ms: f64) -> String {
    let ms = if ms.is_finite() && ms > 0.0 { ms } else { 0.0 };
    format_timespan(Duration::from_millis(ms.round() as u64))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_format_timestamp_millis() {
        let time = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        assert_eq!(format_timestamp(time), "2023-11-14T22:13:20.123Z");
    }

    #[test]
    fn test_format_timespan_zero() {
        assert_eq!(format_timespan(Duration::ZERO), "00:00:00.000");
    }

    #[test]
    fn test_format_timespan_days() {
        let duration = Duration::from_secs(2 * 86_400 + 3 * 3600 + 4 * 60 + 5);
        assert_eq!(format_timespan(duration), "2.03:04:05.000");
    }

    #[test]
    fn test_format_timespan_ms_invalid() {
        assert_eq!(format_timespan_ms(-5.0), "00:00:00.000");
        assert_eq!(format_timespan_ms(f64::NAN), "00:00:00.000");
        assert_eq!(format_timespan_ms(1500.4), "00:00:01.500");
    }
}
