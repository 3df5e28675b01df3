//! # Retry: Typed Provider Errors and Bounded Backoff
//!
//! Every call to an external collaborator (ad platform, LLM, execution,
//! notification) returns `Result<T, ProviderError>`. The error carries its own
//! retry classification, so [`with_retry`] decides from data alone:
//!
//! | Variant | Retried |
//! |---------|---------|
//! | `RateLimited` (HTTP 429) | yes |
//! | `Server` (HTTP 5xx) | yes |
//! | `Network` (connect/timeout/reset) | yes |
//! | `Client` (other 4xx) | no |
//! | `InvalidResponse` (unparsable body) | no |
//! | `Unavailable` (collaborator not configured) | no |
//!
//! Backoff doubles from `base_delay_ms` up to `max_delay_ms`, honouring a
//! server-supplied `Retry-After` when present, for at most `max_attempts`
//! total attempts.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("rate limited by provider")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("provider server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("provider rejected request {status}: {message}")]
    Client { status: u16, message: String },

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

/// Coarse failure class reported alongside failed sub-results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Client,
    Validation,
    Unknown,
}

impl ProviderError {
    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. } | ProviderError::Server { .. } | ProviderError::Network(_)
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::RateLimited { .. }
            | ProviderError::Server { .. }
            | ProviderError::Network(_) => ErrorKind::Transient,
            ProviderError::Client { .. } => ErrorKind::Client,
            ProviderError::InvalidResponse(_) => ErrorKind::Validation,
            ProviderError::Unavailable(_) => ErrorKind::Unknown,
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: &str, retry_after_ms: Option<u64>) -> Self {
        let message: String = body.chars().take(300).collect();
        match status {
            429 => ProviderError::RateLimited { retry_after_ms },
            500..=599 => ProviderError::Server { status, message },
            _ => ProviderError::Client { status, message },
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return ProviderError::from_status(status.as_u16(), &e.to_string(), None);
        }
        if e.is_decode() {
            return ProviderError::InvalidResponse(e.to_string());
        }
        ProviderError::Network(e.to_string())
    }
}

// ── Policy ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn delay_for(&self, attempt: u32, err: &ProviderError) -> Duration {
        if let ProviderError::RateLimited {
            retry_after_ms: Some(ms),
        } = err
        {
            return Duration::from_millis((*ms).min(self.max_delay_ms));
        }
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self.base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the policy
/// runs out of attempts. The last error is returned unchanged.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt, &e);
                warn!(
                    call = label,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient provider error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
