//! Timezone-neutral date handling for METS and PREMIS timestamps.
//!
//! Archivematica writes a mix of `2020-05-19T08:04:16+00:00`,
//! `2020-05-19T08:04:16.123456Z` and bare `2020-07-30`. The wall-clock part is
//! kept as written; offsets and fractions are dropped.

use chrono::{NaiveDate, NaiveDateTime};

const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];

/// Stand-in for dates that cannot be read: one second after the Unix epoch.
pub fn unparseable_date() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1970, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 1))
        .unwrap_or_default()
}

/// Parse a timestamp, returning `None` when it matches no known shape.
pub fn parse_tz_neutral(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();

    if let Some(head) = value.get(..19) {
        let tail = &value[19..];
        let tail_ok = tail.is_empty()
            || tail.starts_with(['.', '+', '-', 'Z', 'z']);
        if tail_ok {
            for format in DATETIME_FORMATS {
                if let Ok(parsed) = NaiveDateTime::parse_from_str(head, format) {
                    return Some(parsed);
                }
            }
        }
    }

    if value.len() == 10 {
        return NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0));
    }

    None
}

/// Parse a timestamp, falling back to [`unparseable_date`].
pub fn normalize_date(value: &str) -> NaiveDateTime {
    parse_tz_neutral(value).unwrap_or_else(unparseable_date)
}
