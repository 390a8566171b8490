//! Retry schedule and failure classification.
//!
//! A failed request is classified into a [`FailureType`]; the [`RetryPolicy`]
//! then decides whether another attempt is made and how long to wait first.
//!
//! The schedule is deterministic: the n-th retry waits `factor * 2^(n-1)`,
//! so with the default 0.3 s factor the waits are 0.3 s, 0.6 s and 1.2 s.
//!
//! ```
//! use std::time::Duration;
//! use hydrofetch_core::transport::{FailureType, RetryDecision, RetryPolicy};
//!
//! let policy = RetryPolicy::default();
//! assert_eq!(
//!     policy.should_retry(FailureType::Transient, 1),
//!     RetryDecision::Retry { delay: Duration::from_millis(600), retry: 2 }
//! );
//! ```

use std::time::Duration;

use tracing::{debug, instrument};

use super::TransportError;
use super::constants::{DEFAULT_BACKOFF_FACTOR, DEFAULT_MAX_RETRIES};

/// Classification of request failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    ///
    /// Connection failures, timeouts, HTTP 500, 502 and 504.
    Transient,

    /// Failure that won't succeed regardless of retries.
    ///
    /// Every other HTTP status, TLS failures, invalid URLs, local IO.
    Permanent,
}

/// Decision on whether to retry a failed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which retry this will be (1-indexed).
        retry: u32,
    },

    /// Give up.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Retry configuration: a retry budget and a backoff factor.
///
/// # Default Values
///
/// - `max_retries`: 3 (four attempts in total)
/// - `backoff_factor`: 0.3 seconds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff_factor: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with a custom retry budget and factor.
    #[must_use]
    pub fn new(max_retries: u32, backoff_factor: Duration) -> Self {
        Self {
            max_retries,
            backoff_factor,
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub fn no_retries() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Returns the retry budget.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns the backoff factor.
    #[must_use]
    pub fn backoff_factor(&self) -> Duration {
        self.backoff_factor
    }

    /// Decides whether to retry after `retries_done` retries have already been
    /// spent (0 after the initial attempt fails).
    #[instrument(level = "debug", skip(self), fields(max_retries = self.max_retries))]
    pub fn should_retry(&self, failure_type: FailureType, retries_done: u32) -> RetryDecision {
        if failure_type == FailureType::Permanent {
            return RetryDecision::DoNotRetry {
                reason: "permanent failure - retry would not help".to_string(),
            };
        }

        if retries_done >= self.max_retries {
            debug!(retries_done, "retry budget exhausted");
            return RetryDecision::DoNotRetry {
                reason: format!("max retries ({}) exhausted", self.max_retries),
            };
        }

        let retry = retries_done + 1;
        let delay = self.delay_for(retry);
        debug!(retry, delay_ms = delay.as_millis(), "will retry");
        RetryDecision::Retry { delay, retry }
    }

    /// Wait before the `retry`-th retry: `factor * 2^(retry-1)`.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.backoff_factor.saturating_mul(1_u32 << exponent)
    }
}

/// Classifies a transport error for retry decisions.
///
/// | Failure | Type |
/// |---------|------|
/// | HTTP 500, 502, 504 | Transient |
/// | any other HTTP status | Permanent |
/// | Timeout | Transient |
/// | Network (TLS) | Permanent |
/// | Network (other) | Transient |
/// | IO, invalid URL, client build | Permanent |
#[must_use]
pub fn classify_error(error: &TransportError) -> FailureType {
    match error {
        TransportError::HttpStatus { status, .. } => classify_http_status(*status),
        TransportError::Timeout { .. } => FailureType::Transient,
        TransportError::Network { source, .. } => {
            if is_tls_error(source) {
                FailureType::Permanent
            } else {
                FailureType::Transient
            }
        }
        TransportError::Io { .. }
        | TransportError::InvalidUrl { .. }
        | TransportError::ClientBuild { .. } => FailureType::Permanent,
    }
}

fn classify_http_status(status: u16) -> FailureType {
    match status {
        500 | 502 | 504 => FailureType::Transient,
        _ => FailureType::Permanent,
    }
}

/// Checks if a reqwest error is a TLS/certificate error.
fn is_tls_error(error: &reqwest::Error) -> bool {
    let error_string = error.to_string().to_lowercase();
    error_string.contains("certificate")
        || error_string.contains("tls")
        || error_string.contains("ssl")
        || error_string.contains("handshake")
}
