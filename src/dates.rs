//! Tolerant parsing of Usenet Date headers.
//!
//! Tries a fixed, ordered list of standard layouts first (RFC 1123 and
//! RFC 822 shapes, with and without weekday and seconds). Inputs are
//! normalized before layout matching: comments stripped, named zones mapped
//! to numeric offsets, truncated offsets widened, the `+-HHMM` malformed
//! zone literal collapsed, and two-digit years expanded. When every layout
//! fails, a regex brute-force pass extracts the date components directly.

use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use regex::Regex;
use std::sync::OnceLock;

/// Layouts tried in order against the normalized string. Normalization
/// strips the weekday (frequently wrong in the wild, and chrono rejects a
/// mismatched one) and appends "+0000" to zone-less inputs, so every layout
/// is weekday-free and carries a numeric zone.
const LAYOUTS: &[&str] = &[
    "%d %b %Y %H:%M:%S %z",
    "%d %b %Y %H:%M %z",
    "%b %d %H:%M:%S %Y %z",
];

/// Two-digit year disambiguation: 60-99 are 19xx, everything else 20xx.
fn expand_two_digit_year(yy: i32) -> i32 {
    if (60..=99).contains(&yy) {
        1900 + yy
    } else {
        2000 + yy
    }
}

fn month_number(name: &str) -> Option<u32> {
    let m = match name.get(..3)?.to_ascii_lowercase().as_str() {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(m)
}

fn named_zone_offset(name: &str) -> Option<&'static str> {
    let offset = match name.to_ascii_uppercase().as_str() {
        "UT" | "GMT" | "UTC" | "Z" => "+0000",
        "EST" => "-0500",
        "EDT" => "-0400",
        "CST" => "-0600",
        "CDT" => "-0500",
        "MST" => "-0700",
        "MDT" => "-0600",
        "PST" => "-0800",
        "PDT" => "-0700",
        _ => return None,
    };
    Some(offset)
}

/// Normalize a raw Date header into a shape the layout list can match.
fn normalize(raw: &str) -> String {
    let mut s = raw.trim().to_string();

    // Strip trailing "(TZ)" comments.
    if let Some(idx) = s.find('(') {
        s.truncate(idx);
    }

    // Collapse runs of whitespace.
    s = s.split_whitespace().collect::<Vec<_>>().join(" ");

    // Drop the weekday token; it is often wrong and never needed.
    static WEEKDAY: OnceLock<Regex> = OnceLock::new();
    let weekday = WEEKDAY
        .get_or_init(|| Regex::new(r"(?i)^(mon|tue|wed|thu|fri|sat|sun)[a-z]*,? ").unwrap());
    if let Some(m) = weekday.find(&s) {
        s = s[m.end()..].to_string();
    }

    // The "+-HHMM" malformed zone literal means the sign that follows.
    s = s.replace("+-", "-").replace("-+", "+");

    // Map a trailing named zone to its numeric offset.
    if let Some(last) = s.rsplit(' ').next() {
        if let Some(offset) = named_zone_offset(last) {
            let head = s[..s.len() - last.len()].trim_end().to_string();
            s = format!("{} {}", head, offset);
        }
    }

    // Widen truncated numeric offsets: "-1" -> "-0100", "+130" -> "+0130".
    static SHORT_ZONE: OnceLock<Regex> = OnceLock::new();
    let short_zone =
        SHORT_ZONE.get_or_init(|| Regex::new(r" ([+-])(\d{1,3})$").unwrap());
    if let Some(caps) = short_zone.captures(&s) {
        let sign = &caps[1];
        let digits = &caps[2];
        let widened = match digits.len() {
            1 | 2 => format!("{}{:0>2}00", sign, digits),
            _ => format!("{}0{}", sign, digits),
        };
        let start = caps.get(0).unwrap().start();
        s = format!("{} {}", &s[..start], widened);
    }

    // Expand a two-digit year in the "dd Mon yy" position.
    static SHORT_YEAR: OnceLock<Regex> = OnceLock::new();
    let short_year = SHORT_YEAR
        .get_or_init(|| Regex::new(r"\b(\d{1,2} [A-Za-z]{3,9}) (\d{2})\b").unwrap());
    if let Some(caps) = short_year.captures(&s) {
        let yy: i32 = caps[2].parse().unwrap_or(0);
        let expanded = format!("{} {}", &caps[1], expand_two_digit_year(yy));
        let m = caps.get(0).unwrap();
        s = format!("{}{}{}", &s[..m.start()], expanded, &s[m.end()..]);
    }

    // Zone-less inputs are treated as UTC.
    static HAS_ZONE: OnceLock<Regex> = OnceLock::new();
    let has_zone = HAS_ZONE.get_or_init(|| Regex::new(r"[+-]\d{4}$").unwrap());
    if !has_zone.is_match(&s) {
        s.push_str(" +0000");
    }

    s
}

/// Parse a Date header, preserving the original zone offset.
///
/// Returns `None` only when both the layout list and the brute-force pass
/// fail; callers store zero time and log.
pub fn parse_date(raw: &str) -> Option<DateTime<FixedOffset>> {
    let normalized = normalize(raw);
    for layout in LAYOUTS {
        if let Ok(dt) = DateTime::parse_from_str(&normalized, layout) {
            return Some(dt);
        }
    }
    brute_force(&normalized)
}

/// Parse a Date header into UTC, or zero time when unparseable.
pub fn parse_date_or_epoch(raw: &str) -> DateTime<Utc> {
    match parse_date(raw) {
        Some(dt) => dt.with_timezone(&Utc),
        None => {
            tracing::debug!(date = %raw, "unparseable Date header, storing zero time");
            Utc.timestamp_opt(0, 0).unwrap()
        }
    }
}

/// Last-resort extraction of year, month, day, and time by regex.
///
/// The month must appear by name. Remaining standalone numbers are
/// consumed left to right: the first in 1..=31 becomes the day, the next
/// becomes the year (two-digit values disambiguated, but never taken from
/// the time fields, which the time regex already claimed).
fn brute_force(s: &str) -> Option<DateTime<FixedOffset>> {
    static TIME: OnceLock<Regex> = OnceLock::new();
    static MONTH: OnceLock<Regex> = OnceLock::new();
    static NUMBER: OnceLock<Regex> = OnceLock::new();
    static ZONE: OnceLock<Regex> = OnceLock::new();

    let time_re =
        TIME.get_or_init(|| Regex::new(r"\b(\d{1,2}):(\d{2})(?::(\d{2}))?\b").unwrap());
    let month_re = MONTH.get_or_init(|| {
        Regex::new(r"(?i)\b(jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\b")
            .unwrap()
    });
    let number_re = NUMBER.get_or_init(|| Regex::new(r"\b\d{1,4}\b").unwrap());
    let zone_re = ZONE.get_or_init(|| Regex::new(r"([+-])(\d{4})\b").unwrap());

    let time_caps = time_re.captures(s)?;
    let hour: u32 = time_caps[1].parse().ok()?;
    let minute: u32 = time_caps[2].parse().ok()?;
    let second: u32 = time_caps
        .get(3)
        .map(|m| m.as_str().parse().unwrap_or(0))
        .unwrap_or(0);
    let time_span = time_caps.get(0).unwrap().range();

    let month = month_number(&month_re.captures(s)?[1])?;

    let mut day: Option<u32> = None;
    let mut year: Option<i32> = None;
    for m in number_re.find_iter(s) {
        // Skip anything inside the matched time.
        if m.start() >= time_span.start && m.end() <= time_span.end {
            continue;
        }
        // Skip the zone offset digits.
        if let Some(z) = zone_re.find(s) {
            if m.start() >= z.start() && m.end() <= z.end() {
                continue;
            }
        }
        let value: i32 = m.as_str().parse().ok()?;
        if m.as_str().len() == 4 {
            year.get_or_insert(value);
        } else if day.is_none() && (1..=31).contains(&value) {
            day = Some(value as u32);
        } else if year.is_none() {
            year = Some(expand_two_digit_year(value));
        }
    }
    let day = day?;
    let year = year?;

    let offset_secs = match zone_re.captures(s) {
        Some(caps) => {
            let hh: i32 = caps[2][..2].parse().ok()?;
            let mm: i32 = caps[2][2..].parse().ok()?;
            let magnitude = hh * 3600 + mm * 60;
            if &caps[1] == "-" {
                -magnitude
            } else {
                magnitude
            }
        }
        None => 0,
    };

    let offset = FixedOffset::east_opt(offset_secs)?;
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    let naive = date.and_hms_opt(hour, minute, second)?;
    offset.from_local_datetime(&naive).single()
}
