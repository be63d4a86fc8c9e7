use crate::resilience::retry_after::{parse_retry_after, HeaderSource};
use chrono::{DateTime, TimeZone, Utc};
use std::time::Duration;

/// Rate limit information from API response headers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset: Option<DateTime<Utc>>,
    pub retry_after: Option<Duration>,
    pub request_id: Option<String>,
}

impl RateLimitHeaders {
    /// Parse `X-RateLimit-*`, `Retry-After` and request id headers.
    ///
    /// `X-RateLimit-Reset` is read as Unix epoch seconds.
    pub fn from_headers<H>(headers: &H) -> Self
    where
        H: HeaderSource + ?Sized,
    {
        Self {
            limit: parse_number(headers, "x-ratelimit-limit"),
            remaining: parse_number(headers, "x-ratelimit-remaining"),
            reset: headers
                .header("x-ratelimit-reset")
                .and_then(|s| s.trim().parse::<i64>().ok())
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
            retry_after: parse_retry_after(headers),
            request_id: headers
                .header("x-request-id")
                .or_else(|| headers.header("request-id"))
                .map(String::from),
        }
    }

    /// Whether the server reports the budget as used up.
    pub fn is_exhausted(&self) -> bool {
        self.remaining == Some(0)
    }
}

fn parse_number<H>(headers: &H, name: &str) -> Option<u32>
where
    H: HeaderSource + ?Sized,
{
    headers.header(name).and_then(|s| s.trim().parse().ok())
}
