use thiserror::Error;

/// Errors surfaced by the risk/decision engine and its collaborators
#[derive(Debug, Error)]
pub enum BotError {
    /// Network/HTTP failure talking to an exchange or candle source.
    /// Recoverable: retried on the next scheduled tick, never immediately.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Bad credentials or signature. Fatal to the gateway until configuration changes.
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("insufficient data: have {have} candles, need {need}")]
    InsufficientData { have: usize, need: usize },

    /// Unexpected shape from an exchange. Treated as upstream-unavailable for that tick.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Programmer error (e.g. a second tracker for an already-tracked symbol)
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("persistence error: {0}")]
    Persistence(String),
}

impl BotError {
    /// True for errors that should simply be retried on the next tick
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BotError::UpstreamUnavailable(_) | BotError::MalformedResponse(_)
        )
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, BotError::Auth(_))
    }
}

impl From<reqwest::Error> for BotError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return BotError::MalformedResponse(err.to_string());
        }
        if let Some(status) = err.status() {
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return BotError::Auth(err.to_string());
            }
        }
        BotError::UpstreamUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for BotError {
    fn from(err: serde_json::Error) -> Self {
        BotError::MalformedResponse(err.to_string())
    }
}

impl From<std::num::ParseFloatError> for BotError {
    fn from(err: std::num::ParseFloatError) -> Self {
        BotError::MalformedResponse(err.to_string())
    }
}

impl From<redis::RedisError> for BotError {
    fn from(err: redis::RedisError) -> Self {
        BotError::Persistence(err.to_string())
    }
}

impl From<std::io::Error> for BotError {
    fn from(err: std::io::Error) -> Self {
        BotError::Persistence(err.to_string())
    }
}

impl From<config::ConfigError> for BotError {
    fn from(err: config::ConfigError) -> Self {
        BotError::Config(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BotError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        BotError::UpstreamUnavailable(err.to_string())
    }
}
