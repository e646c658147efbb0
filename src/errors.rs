// =============================================================================
// Error taxonomy for the context engine
// =============================================================================
//
// The fetch pipeline classifies every failure into one of these kinds so the
// retry / circuit-breaker / degrade policies can be applied uniformly:
//
//   Transient   - network error or timeout; retried with backoff.
//   RateLimited - HTTP 418 / 429 / 451; consumed by the circuit breaker.
//   AuthFailure - HTTP 401 / 403; triggers a one-shot downgrade to public mode.
//   Parse       - malformed payload for a single trade; the trade is dropped.
//   CacheCorrupt- a present cache file could not be read.
//   InvalidTick - tick size is non-positive or absurdly small.
//   Fatal       - an accumulator invariant was violated; terminates the engine.
// =============================================================================

use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("rate limited (HTTP {status})")]
    RateLimited { status: u16 },

    #[error("authentication failure (HTTP {status})")]
    AuthFailure { status: u16 },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("cache file unreadable: {path}: {reason}")]
    CacheCorrupt { path: String, reason: String },

    #[error("invalid tick size: {0}")]
    InvalidTick(String),

    #[error("invariant violated: {0}")]
    Fatal(String),
}

impl EngineError {
    /// Classify a non-success HTTP status into an error kind.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        match status.as_u16() {
            418 | 429 | 451 => Self::RateLimited {
                status: status.as_u16(),
            },
            401 | 403 => Self::AuthFailure {
                status: status.as_u16(),
            },
            code => Self::Transient(format!("HTTP {code}: {body}")),
        }
    }

    /// Classify a reqwest transport error (connect / timeout / body read).
    pub fn from_transport(err: reqwest::Error) -> Self {
        Self::Transient(err.to_string())
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::AuthFailure { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited { .. })
    }
}
