//! Age and freshness computations (RFC 2616 §13.2.3 and §14.9.3).

use super::entry::EntryFields;
use super::headers::{cache_control_directives, split_header};
use crate::Error;

/// Default expiration when a response carries no freshness information.
pub const DEFAULT_EXPIRATION: i64 = 24 * 3600;

/// Upper bound of the Last-Modified heuristic.
pub const MAX_LM_EXPIRATION: i64 = 48 * 3600;

/// Freshness lifetime estimated from Last-Modified: a tenth of the time since
/// the resource last changed, at most 48 hours.
pub fn lm_expiration(age_since_modified: i64) -> i64 {
    (age_since_modified / 10).min(MAX_LM_EXPIRATION)
}

/// Compute `response_time`, `corrected_initial_age` and `freshness_lifetime`
/// for an entry whose headers have just been read.
///
/// A missing `Date` is taken to be the moment the response arrived.
pub fn compute_timing(fields: &mut EntryFields, request_time: i64, response_time: i64, default_expiration: i64) {
    let date = fields.date.unwrap_or(response_time);

    let apparent_age = response_time.saturating_sub(date).max(0);
    let corrected_received_age = apparent_age.max(fields.age.unwrap_or(0));
    let response_delay = response_time.saturating_sub(request_time);

    let freshness_lifetime = match (fields.max_age, fields.expires, fields.lm) {
        (Some(max_age), _, _) => max_age,
        (None, Some(expires), _) => expires.saturating_sub(date),
        (None, None, Some(lm)) => lm_expiration(date.saturating_sub(lm)),
        (None, None, None) => default_expiration,
    };

    fields.response_time = response_time;
    fields.corrected_initial_age = corrected_received_age.saturating_add(response_delay);
    fields.freshness_lifetime = freshness_lifetime.max(0);
}

/// Age of the entry at `now`.
pub fn current_age(fields: &EntryFields, now: i64) -> i64 {
    fields.corrected_initial_age.saturating_add(now.saturating_sub(fields.response_time))
}

/// Whether an entry is past its freshness lifetime. Boundary ages are fresh.
pub fn is_expired(fields: &EntryFields, now: i64) -> bool {
    fields.freshness_lifetime < current_age(fields, now)
}

/// How much staleness a request accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MaxStale {
    #[default]
    None,
    Seconds(i64),
    /// A bare `max-stale`: any staleness is acceptable.
    Unlimited,
}

/// Request-side `Cache-Control` overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestControl {
    pub max_age: Option<i64>,
    pub max_stale: MaxStale,
    pub min_fresh: Option<i64>,
    /// `no-cache` or `no-store` was requested.
    pub no_cache: bool,
}

impl RequestControl {
    /// Parse request `Cache-Control` header lines.
    ///
    /// Every line must be a `Cache-Control` header; directives the cache
    /// does not act on are ignored.
    pub fn parse<S: AsRef<str>>(lines: &[S]) -> Result<Self, Error> {
        let mut control = RequestControl::default();

        for line in lines {
            let line = line.as_ref();
            let (name, value) = split_header(line)
                .ok_or_else(|| Error::InvalidInput(format!("not a header line: {line}")))?;
            if !name.eq_ignore_ascii_case("Cache-Control") {
                return Err(Error::InvalidInput(format!("expected a Cache-Control header, got {name}")));
            }

            for directive in cache_control_directives(value) {
                let seconds = directive.argument.as_deref().and_then(|v| v.parse::<i64>().ok());
                match directive.name.as_str() {
                    "no-cache" | "no-store" => control.no_cache = true,
                    "max-age" => control.max_age = Some(required(seconds, "max-age")?),
                    "min-fresh" => control.min_fresh = Some(required(seconds, "min-fresh")?),
                    "max-stale" => {
                        control.max_stale = match directive.argument {
                            None => MaxStale::Unlimited,
                            Some(_) => MaxStale::Seconds(required(seconds, "max-stale")?),
                        }
                    }
                    _ => {}
                }
            }
        }

        Ok(control)
    }

    /// Whether an entry with `fields` may be served at `now` without
    /// revalidation.
    pub fn is_fresh(&self, fields: &EntryFields, now: i64) -> bool {
        let age = current_age(fields, now);

        if self.max_age.is_some_and(|max_age| age > max_age) {
            return false;
        }
        if self.min_fresh.is_some_and(|min_fresh| fields.freshness_lifetime < age.saturating_add(min_fresh)) {
            return false;
        }

        match self.max_stale {
            MaxStale::None => age <= fields.freshness_lifetime,
            MaxStale::Seconds(stale) => age <= fields.freshness_lifetime.saturating_add(stale),
            MaxStale::Unlimited => true,
        }
    }
}

fn required(seconds: Option<i64>, directive: &str) -> Result<i64, Error> {
    seconds
        .filter(|s| *s >= 0)
        .ok_or_else(|| Error::InvalidInput(format!("{directive} needs a non-negative number of seconds")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn fresh_for(lifetime: i64) -> EntryFields {
        EntryFields { freshness_lifetime: lifetime, response_time: NOW, corrected_initial_age: 0, ..Default::default() }
    }

    #[test]
    fn test_lm_heuristic() {
        assert_eq!(lm_expiration(1000), 100);
        assert_eq!(lm_expiration(100 * 24 * 3600), MAX_LM_EXPIRATION);
    }

    #[test]
    fn test_compute_timing_ages() {
        let mut fields = EntryFields { date: Some(NOW - 10), age: Some(25), ..Default::default() };
        compute_timing(&mut fields, NOW - 2, NOW, DEFAULT_EXPIRATION);
        assert_eq!(fields.response_time, NOW);
        // max(apparent 10, age 25) + delay 2
        assert_eq!(fields.corrected_initial_age, 27);
        assert_eq!(fields.freshness_lifetime, DEFAULT_EXPIRATION);
    }

    #[test]
    fn test_compute_timing_lifetime_sources() {
        let mut fields = EntryFields { date: Some(NOW), max_age: Some(60), expires: Some(NOW + 600), ..Default::default() };
        compute_timing(&mut fields, NOW, NOW, DEFAULT_EXPIRATION);
        assert_eq!(fields.freshness_lifetime, 60);

        let mut fields = EntryFields { date: Some(NOW), expires: Some(NOW + 600), ..Default::default() };
        compute_timing(&mut fields, NOW, NOW, DEFAULT_EXPIRATION);
        assert_eq!(fields.freshness_lifetime, 600);

        let mut fields = EntryFields { date: Some(NOW), lm: Some(NOW - 1000), ..Default::default() };
        compute_timing(&mut fields, NOW, NOW, DEFAULT_EXPIRATION);
        assert_eq!(fields.freshness_lifetime, 100);

        let mut fields = EntryFields { date: Some(NOW), expires: Some(NOW - 600), ..Default::default() };
        compute_timing(&mut fields, NOW, NOW, DEFAULT_EXPIRATION);
        assert_eq!(fields.freshness_lifetime, 0);
    }

    #[test]
    fn test_missing_date_uses_response_time() {
        let mut fields = EntryFields::default();
        compute_timing(&mut fields, NOW, NOW, 300);
        assert_eq!(fields.corrected_initial_age, 0);
        assert_eq!(fields.freshness_lifetime, 300);
    }

    #[test]
    fn test_extreme_ages_saturate() {
        let mut fields = EntryFields { age: Some(i64::MAX), ..Default::default() };
        compute_timing(&mut fields, i64::MIN, NOW, DEFAULT_EXPIRATION);
        assert_eq!(fields.corrected_initial_age, i64::MAX);
        assert!(is_expired(&fields, NOW));
        assert!(is_expired(&fields, i64::MAX));

        let control = RequestControl { min_fresh: Some(i64::MAX), ..Default::default() };
        assert!(!control.is_fresh(&fresh_for(100), NOW));
        assert!(!RequestControl::default().is_fresh(&fields, NOW));
    }

    #[test]
    fn test_freshness_boundary() {
        let fields = fresh_for(100);
        let control = RequestControl::default();
        assert!(control.is_fresh(&fields, NOW + 100));
        assert!(!control.is_fresh(&fields, NOW + 101));
        assert!(!is_expired(&fields, NOW + 100));
        assert!(is_expired(&fields, NOW + 101));
    }

    #[test]
    fn test_max_stale_allowance() {
        let fields = fresh_for(100);
        let control = RequestControl { max_stale: MaxStale::Seconds(50), ..Default::default() };
        assert!(control.is_fresh(&fields, NOW + 150));
        assert!(!control.is_fresh(&fields, NOW + 151));

        let control = RequestControl { max_stale: MaxStale::Unlimited, ..Default::default() };
        assert!(control.is_fresh(&fields, NOW + 1_000_000));
    }

    #[test]
    fn test_max_age_and_min_fresh_overrides() {
        let fields = fresh_for(100);
        let control = RequestControl { max_age: Some(10), ..Default::default() };
        assert!(control.is_fresh(&fields, NOW + 10));
        assert!(!control.is_fresh(&fields, NOW + 11));

        let control = RequestControl { min_fresh: Some(30), ..Default::default() };
        assert!(control.is_fresh(&fields, NOW + 70));
        assert!(!control.is_fresh(&fields, NOW + 71));
    }

    #[test]
    fn test_parse_request_control() {
        let control = RequestControl::parse(&["Cache-Control: max-age=60, min-fresh=5", "cache-control: max-stale"]).unwrap();
        assert_eq!(control.max_age, Some(60));
        assert_eq!(control.min_fresh, Some(5));
        assert_eq!(control.max_stale, MaxStale::Unlimited);
        assert!(!control.no_cache);

        let control = RequestControl::parse(&["Cache-Control: no-cache"]).unwrap();
        assert!(control.no_cache);
    }

    #[test]
    fn test_parse_request_control_rejects_other_headers() {
        assert!(matches!(RequestControl::parse(&["Pragma: no-cache"]), Err(Error::InvalidInput(_))));
        assert!(matches!(RequestControl::parse(&["Cache-Control: max-age=soon"]), Err(Error::InvalidInput(_))));
    }
}
