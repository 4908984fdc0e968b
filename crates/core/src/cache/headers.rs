//! Response header handling: splitting header lines, extracting validators,
//! hop-by-hop filtering, 304 merging and HTTP dates.

use super::entry::EntryFields;
use chrono::{DateTime, NaiveDateTime, Utc};

/// Headers that are meaningful for a single transport leg and are never
/// written to a metadata file.
pub const HOP_BY_HOP: [&str; 6] =
    ["Connection", "Keep-Alive", "Proxy-Authenticate", "Proxy-Authorization", "Transfer-Encoding", "Upgrade"];

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Split a header line into its name and trimmed value.
///
/// Returns `None` for blank lines and lines without a colon.
pub fn split_header(line: &str) -> Option<(&str, &str)> {
    let (name, value) = line.split_once(':')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name, value.trim()))
}

fn header_name(line: &str) -> &str {
    line.split_once(':').map_or(line, |(name, _)| name).trim()
}

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Drop hop-by-hop headers and lines that are not headers at all.
pub fn filter_hop_by_hop(headers: &[String]) -> Vec<String> {
    headers
        .iter()
        .filter(|line| split_header(line).is_some_and(|(name, _)| !is_hop_by_hop(name)))
        .map(|line| line.trim_end_matches(['\r', '\n']).to_string())
        .collect()
}

/// Merge the headers of a `304` response into the stored ones.
///
/// Stored headers keep their position. Every new line whose
/// (case-insensitive) name is already stored replaces all stored lines of
/// that name, at the position of the first one; new names are appended in
/// the order they arrived.
pub fn merge_headers(stored: &[String], fresh: &[String]) -> Vec<String> {
    let fresh = filter_hop_by_hop(fresh);
    let mut merged: Vec<String> = Vec::with_capacity(stored.len() + fresh.len());

    for line in stored {
        let name = header_name(line);
        if !fresh.iter().any(|f| has_name(f, name)) {
            merged.push(line.clone());
        } else if !merged.iter().any(|m| has_name(m, name)) {
            merged.extend(fresh.iter().filter(|f| has_name(f, name)).cloned());
        }
    }
    for line in &fresh {
        let name = header_name(line);
        if !stored.iter().any(|s| has_name(s, name)) {
            merged.push(line.clone());
        }
    }
    merged
}

fn has_name(line: &str, name: &str) -> bool {
    header_name(line).eq_ignore_ascii_case(name)
}

/// One directive of a `Cache-Control` value, name lower-cased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub name: String,
    pub argument: Option<String>,
}

/// Split a `Cache-Control` value into its comma-separated directives.
pub fn cache_control_directives(value: &str) -> Vec<Directive> {
    value
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(|d| match d.split_once('=') {
            Some((name, arg)) => Directive {
                name: name.trim().to_ascii_lowercase(),
                argument: Some(arg.trim().trim_matches('"').to_string()),
            },
            None => Directive { name: d.to_ascii_lowercase(), argument: None },
        })
        .collect()
}

/// Largest delta-seconds value kept; larger ones are clamped to it
/// (RFC 9111 §1.2.2).
pub const MAX_DELTA_SECONDS: i64 = 1 << 31;

fn parse_seconds(value: &str) -> Option<i64> {
    let value = value.trim();
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(value.parse::<i64>().map_or(MAX_DELTA_SECONDS, |v| v.min(MAX_DELTA_SECONDS)))
}

/// Read the validators and caching directives of a response into `fields`.
///
/// Headers absent from `headers` leave the previous value in place, so the
/// same function serves both a fresh store and a `304` merge. A
/// `Content-Length` above `max_entry_size` marks the response not cacheable.
pub fn apply_response_headers(fields: &mut EntryFields, headers: &[String], max_entry_size: u64) {
    for line in headers {
        let Some((name, value)) = split_header(line) else {
            continue;
        };

        if name.eq_ignore_ascii_case("ETag") {
            fields.etag = Some(value.to_string()).filter(|v| !v.is_empty());
        } else if name.eq_ignore_ascii_case("Last-Modified") {
            fields.lm = parse_http_date(value);
        } else if name.eq_ignore_ascii_case("Expires") {
            // An unparseable Expires means "already expired" (RFC 2616 §14.21).
            fields.expires = Some(parse_http_date(value).unwrap_or(0));
        } else if name.eq_ignore_ascii_case("Date") {
            fields.date = parse_http_date(value);
        } else if name.eq_ignore_ascii_case("Age") {
            fields.age = parse_seconds(value);
        } else if name.eq_ignore_ascii_case("Content-Length") {
            if value.parse::<u64>().is_ok_and(|length| length > max_entry_size) {
                fields.no_cache = true;
            }
        } else if name.eq_ignore_ascii_case("Cache-Control") {
            for directive in cache_control_directives(value) {
                match directive.name.as_str() {
                    "no-cache" | "no-store" => fields.no_cache = true,
                    "must-revalidate" => fields.must_revalidate = true,
                    "max-age" => {
                        if let Some(seconds) = directive.argument.as_deref().and_then(parse_seconds) {
                            fields.max_age = Some(seconds);
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Parse an HTTP date (IMF-fixdate, RFC 850 or asctime) into epoch seconds.
pub fn parse_http_date(value: &str) -> Option<i64> {
    let value = value.trim();

    if let Ok(dt) = NaiveDateTime::parse_from_str(value, HTTP_DATE_FORMAT) {
        return Some(dt.and_utc().timestamp());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%A, %d-%b-%y %H:%M:%S GMT") {
        return Some(dt.and_utc().timestamp());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%a %b %e %H:%M:%S %Y") {
        return Some(dt.and_utc().timestamp());
    }
    DateTime::parse_from_rfc2822(value).ok().map(|dt| dt.timestamp())
}

/// Format epoch seconds as an IMF-fixdate.
pub fn format_http_date(secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or_default().format(HTTP_DATE_FORMAT).to_string()
}
