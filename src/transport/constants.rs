//! Constants for the transport module (timeouts, retry schedule).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (60 seconds).
pub const READ_TIMEOUT_SECS: u64 = 60;

/// Default number of retries after the initial attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default backoff factor (0.3 seconds).
pub const DEFAULT_BACKOFF_FACTOR: Duration = Duration::from_millis(300);
