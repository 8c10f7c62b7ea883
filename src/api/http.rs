use governor::{Quota, RateLimiter};
use reqwest::{Client, StatusCode};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use crate::error::BotError;
use crate::Result;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// Type alias for the rate limiter to simplify signatures
pub type DirectRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Shared per-gateway limiter; a zero rate is treated as one request per second
pub fn rate_limiter(per_second: u32) -> Arc<DirectRateLimiter> {
    let rate = NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN);
    Arc::new(RateLimiter::direct(Quota::per_second(rate)))
}

pub fn http_client() -> Result<Client> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| BotError::Config(format!("failed to build HTTP client: {}", e)))
}

/// Map a non-success HTTP status to the error taxonomy
pub fn check_status(status: StatusCode, body: &str) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    let snippet: String = body.chars().take(200).collect();
    match status.as_u16() {
        401 | 403 => Err(BotError::Auth(format!("HTTP {}: {}", status, snippet))),
        _ => Err(BotError::UpstreamUnavailable(format!("HTTP {}: {}", status, snippet))),
    }
}

/// Parse a numeric string field, treating "" as missing
pub fn parse_f64(value: &str, field: &str) -> Result<f64> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|_| BotError::MalformedResponse(format!("{} is not a number: {:?}", field, value)))
}

pub fn parse_optional_f64(value: &str) -> Option<f64> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|v| *v != 0.0)
}
