//! `Retry-After` extraction (spec.md §4.M, §8 "Retry-After honoring").
//!
//! The historical provider surface returns either a typed
//! [`qm_integration::QualityError::RateLimit`] carrying an already-parsed
//! delay, or an untyped error whose message embeds an HTTP-style
//! `Retry-After:` header value. This module covers the latter: accepting
//! both delta-seconds (`"120"`) and an RFC 7231 HTTP-date, case-insensitive,
//! capped at 5 minutes.

use chrono::Utc;
use std::time::Duration;

const MAX_RETRY_AFTER: Duration = Duration::from_secs(5 * 60);

/// Scans `message` for a `Retry-After:<value>` token (case-insensitive) and
/// parses the value as either delta-seconds or an HTTP-date, capping the
/// result at 5 minutes. Returns `None` if no such token is present or it
/// cannot be parsed.
pub fn parse_retry_after(message: &str) -> Option<Duration> {
    let lower = message.to_ascii_lowercase();
    let marker = "retry-after:";
    let start = lower.find(marker)? + marker.len();
    let rest = message[start..].trim_start();
    let value: String = rest
        .chars()
        .take_while(|c| !matches!(c, '\n' | '\r' | ')' | ']' | '"' | ','))
        .collect();
    let value = value.trim();

    let delay = if let Ok(seconds) = value.parse::<u64>() {
        Duration::from_secs(seconds)
    } else {
        let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
        let now = Utc::now();
        let delta = at.with_timezone(&Utc) - now;
        Duration::from_millis(delta.num_milliseconds().max(0) as u64)
    };

    Some(delay.min(MAX_RETRY_AFTER))
}

/// Whether `message` looks like a rate-limit response from a provider that
/// does not surface [`qm_integration::QualityError::RateLimit`] directly
/// (spec.md §4.M "an untyped error whose message contains \"429\" /
/// \"rate limit\"").
pub fn looks_like_rate_limit(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("429") || lower.contains("rate limit")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_delta_seconds() {
        let delay = parse_retry_after("provider error: Retry-After: 120").unwrap();
        assert_eq!(delay, Duration::from_secs(120));
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        let delay = parse_retry_after("RETRY-AFTER:45 please wait").unwrap();
        assert_eq!(delay, Duration::from_secs(45));
    }

    #[test]
    fn test_caps_at_five_minutes() {
        let delay = parse_retry_after("Retry-After: 3600").unwrap();
        assert_eq!(delay, MAX_RETRY_AFTER);
    }

    #[test]
    fn test_no_marker_returns_none() {
        assert_eq!(parse_retry_after("internal server error"), None);
    }

    #[test]
    fn test_looks_like_rate_limit_detects_429_and_text() {
        assert!(looks_like_rate_limit("HTTP 429 Too Many Requests"));
        assert!(looks_like_rate_limit("provider rate limit exceeded"));
        assert!(!looks_like_rate_limit("connection reset by peer"));
    }
}
