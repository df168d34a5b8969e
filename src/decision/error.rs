//! Decision-service error types with retry classification.
//!
//! Distinguishes between transient errors (should retry) and permanent errors (should not retry).

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// Error from a decision-service call.
#[derive(Debug, Clone)]
pub struct DecisionError {
    pub kind: DecisionErrorKind,
    pub message: String,
    /// Suggested retry delay, if the service provided one
    pub retry_after: Option<Duration>,
}

impl DecisionError {
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            kind: DecisionErrorKind::RateLimited,
            message: message.into(),
            retry_after,
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            kind: DecisionErrorKind::Unavailable,
            message: message.into(),
            retry_after: None,
        }
    }

    /// The service answered with something unusable for this input.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self {
            kind: DecisionErrorKind::Malformed,
            message: message.into(),
            retry_after: None,
        }
    }

    /// The service declined to decide.
    pub fn refused(message: impl Into<String>) -> Self {
        Self {
            kind: DecisionErrorKind::Refused,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Check if this error is transient and should be retried.
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    /// Get the suggested delay before retry.
    ///
    /// Returns the `retry_after` if set, otherwise exponential backoff from a
    /// per-kind base, capped at 60 seconds.
    pub fn suggested_delay(&self, attempt: u32) -> Duration {
        if let Some(retry_after) = self.retry_after {
            return retry_after;
        }

        let base_delay = match self.kind {
            DecisionErrorKind::RateLimited => Duration::from_secs(5),
            DecisionErrorKind::Unavailable => Duration::from_secs(1),
            _ => Duration::from_secs(1),
        };

        // Exponential backoff: base * 2^attempt
        let multiplier = 2u64.saturating_pow(attempt);
        let delay_secs = base_delay.as_secs().saturating_mul(multiplier);

        // Simple deterministic jitter (up to 25% of delay) before capping
        let jitter_range = delay_secs / 4;
        let jitter = if jitter_range > 0 {
            (attempt as u64 * 7) % jitter_range
        } else {
            0
        };

        Duration::from_secs((delay_secs + jitter).min(60))
    }
}

impl std::fmt::Display for DecisionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for DecisionError {}

/// Classification of decision-service errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionErrorKind {
    /// Transient, retry with backoff
    RateLimited,
    /// Service unreachable or overloaded - transient
    Unavailable,
    /// Response did not fit the requested decision - permanent
    Malformed,
    /// Service declined - permanent
    Refused,
}

impl DecisionErrorKind {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DecisionErrorKind::RateLimited | DecisionErrorKind::Unavailable
        )
    }
}

impl std::fmt::Display for DecisionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecisionErrorKind::RateLimited => write!(f, "Rate limited"),
            DecisionErrorKind::Unavailable => write!(f, "Decision service unavailable"),
            DecisionErrorKind::Malformed => write!(f, "Malformed decision"),
            DecisionErrorKind::Refused => write!(f, "Decision refused"),
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Maximum total time to spend retrying
    pub max_retry_duration: Duration,
    /// Whether to retry on rate limit errors
    pub retry_rate_limits: bool,
    /// Whether to retry when the service is unavailable
    pub retry_unavailable: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_retry_duration: Duration::from_secs(120),
            retry_rate_limits: true,
            retry_unavailable: true,
        }
    }
}

impl RetryConfig {
    /// Check if the given error should be retried based on this config.
    pub fn should_retry(&self, error: &DecisionError) -> bool {
        match error.kind {
            DecisionErrorKind::RateLimited => self.retry_rate_limits,
            DecisionErrorKind::Unavailable => self.retry_unavailable,
            DecisionErrorKind::Malformed | DecisionErrorKind::Refused => false,
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or the retry budget is spent.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, mut op: F) -> Result<T, DecisionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DecisionError>>,
{
    let started = Instant::now();
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let delay = e.suggested_delay(attempt);
                let out_of_time = started.elapsed() + delay > config.max_retry_duration;
                if !config.should_retry(&e) || attempt >= config.max_retries || out_of_time {
                    return Err(e);
                }
                tracing::warn!(
                    "Decision attempt {} failed ({}), retrying in {:?}",
                    attempt + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
