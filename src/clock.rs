//! Wall-clock helpers shared by the cache, the pools and the access log.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, NaiveDateTime, Utc};

/// IMF-fixdate, the preferred HTTP date format (RFC 7231 §7.1.1.1).
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Milliseconds since the Unix epoch for `time` (0 for pre-epoch times).
pub fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Milliseconds since the Unix epoch, now.
pub fn now_millis() -> u64 {
    unix_millis(SystemTime::now())
}

/// Inverse of [`unix_millis`].
pub fn from_millis(millis: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis)
}

/// Format `time` as an HTTP date.
pub fn format_http_date(time: SystemTime) -> String {
    let datetime: DateTime<Utc> = time.into();
    datetime.format(HTTP_DATE_FORMAT).to_string()
}

/// Parse an HTTP date. Accepts IMF-fixdate and any RFC 2822 variant.
pub fn parse_http_date(value: &str) -> Option<SystemTime> {
    let value = value.trim();
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, HTTP_DATE_FORMAT) {
        return Some(naive.and_utc().into());
    }
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).into())
}

/// Truncate to whole seconds, the resolution of HTTP dates.
pub fn whole_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_date_round_trip_keeps_seconds() {
        let time = UNIX_EPOCH + Duration::from_secs(784_111_777);
        let formatted = format_http_date(time);
        assert_eq!(formatted, "Sun, 06 Nov 1994 08:49:37 GMT");
        assert_eq!(parse_http_date(&formatted), Some(time));
    }

    #[test]
    fn rejects_garbage_dates() {
        assert!(parse_http_date("not a date").is_none());
        assert!(parse_http_date("0").is_none());
    }
}
