//! Sliding-window rate limiting per host.
//!
//! Agencies publish request caps such as "180 requests per minute". The
//! [`RateLimiter`] enforces such a cap with a sliding window: it remembers the
//! instants of the most recent requests to each host and, once the window is
//! full, makes the caller sleep until the oldest entry ages out.
//!
//! Limiting is cooperative: only requests that call [`RateLimiter::acquire`]
//! first are throttled.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use hydrofetch_core::rate_limit::RateLimiter;
//!
//! # async fn example() {
//! let limiter = Arc::new(RateLimiter::per_minute(180));
//!
//! // Requests proceed immediately until the window holds 180 entries
//! limiter.acquire("https://example.com/observations/2020-01").await;
//!
//! // Other hosts have their own window
//! limiter.acquire("https://other.example.org/stations").await;
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Default window length (60 seconds).
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Warning threshold for cumulative delay per host (5 minutes).
const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(300);

/// Per-host sliding-window rate limiter.
///
/// Designed to be wrapped in `Arc` and shared between every task that talks to
/// the same provider. `DashMap` holds one state per host; the state's
/// `tokio::sync::Mutex` stays locked across the sleep, so callers queue up in
/// order instead of all waking at the same instant.
#[derive(Debug)]
pub struct RateLimiter {
    /// Window length.
    window: Duration,

    /// Maximum requests admitted per window.
    max_requests: usize,

    /// Whether rate limiting is disabled.
    disabled: bool,

    /// Per-host state. Arc lets the `DashMap` shard lock be released before
    /// awaiting the inner mutex.
    hosts: DashMap<String, Arc<HostWindow>>,
}

/// Recent request instants for one host.
#[derive(Debug)]
struct HostWindow {
    requests: Mutex<VecDeque<Instant>>,

    /// Total delay applied to this host (milliseconds).
    cumulative_delay_ms: AtomicU64,
}

impl HostWindow {
    fn new() -> Self {
        Self {
            requests: Mutex::new(VecDeque::new()),
            cumulative_delay_ms: AtomicU64::new(0),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn add_cumulative_delay(&self, delay: Duration) -> Duration {
        let delay_ms = delay.as_millis() as u64;
        let new_total = self
            .cumulative_delay_ms
            .fetch_add(delay_ms, Ordering::SeqCst)
            + delay_ms;
        Duration::from_millis(new_total)
    }
}

impl RateLimiter {
    /// Creates a limiter admitting `max_requests` per `window` for each host.
    ///
    /// A cap of zero is raised to one.
    #[must_use]
    #[instrument(level = "debug", skip_all, fields(max_requests, window_ms = window.as_millis()))]
    pub fn new(max_requests: usize, window: Duration) -> Self {
        let max_requests = max_requests.max(1);
        tracing::Span::current().record("max_requests", max_requests);
        debug!("creating rate limiter");
        Self {
            window,
            max_requests,
            disabled: false,
            hosts: DashMap::new(),
        }
    }

    /// Creates a limiter with a 60-second window.
    #[must_use]
    pub fn per_minute(max_requests: usize) -> Self {
        Self::new(max_requests, DEFAULT_WINDOW)
    }

    /// Creates a limiter that never delays.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            window: Duration::ZERO,
            max_requests: usize::MAX,
            disabled: true,
            hosts: DashMap::new(),
        }
    }

    /// Returns whether rate limiting is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Returns the per-window cap.
    #[must_use]
    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    /// Returns the window length.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Waits until a request to the URL's host fits in the window, then
    /// records it.
    #[instrument(level = "debug", skip(self), fields(host))]
    pub async fn acquire(&self, url: &str) {
        if self.disabled {
            return;
        }

        let host = extract_domain(url);
        tracing::Span::current().record("host", host.as_str());

        let state = self
            .hosts
            .entry(host.clone())
            .or_insert_with(|| Arc::new(HostWindow::new()))
            .clone();

        let mut requests = state.requests.lock().await;
        self.evict_expired(&mut requests, Instant::now());

        if requests.len() >= self.max_requests
            && let Some(&oldest) = requests.front()
        {
            let wake_at = oldest + self.window;
            let delay = wake_at.saturating_duration_since(Instant::now());
            let cumulative = state.add_cumulative_delay(delay);

            debug!(
                host = %host,
                delay_ms = delay.as_millis(),
                in_window = requests.len(),
                "window full, waiting"
            );
            if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
                warn!(
                    host = %host,
                    cumulative_delay_secs = cumulative.as_secs(),
                    "excessive rate limiting - consider narrowing the requested range"
                );
            }

            tokio::time::sleep_until(wake_at).await;
            self.evict_expired(&mut requests, Instant::now());
        }

        requests.push_back(Instant::now());
    }

    fn evict_expired(&self, requests: &mut VecDeque<Instant>, now: Instant) {
        while let Some(&front) = requests.front() {
            if now.saturating_duration_since(front) >= self.window {
                requests.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Extracts the lowercase host from a URL.
///
/// Returns "unknown" for malformed URLs, so those requests still share one
/// window.
///
/// # Examples
///
/// ```
/// use hydrofetch_core::rate_limit::extract_domain;
///
/// assert_eq!(extract_domain("https://hydapi.nve.no/api/v1/Observations"), "hydapi.nve.no");
/// assert_eq!(extract_domain("http://Example.COM/Path"), "example.com");
/// assert_eq!(extract_domain("https://localhost:8080/x"), "localhost");
/// assert_eq!(extract_domain("not a url"), "unknown");
/// ```
#[must_use]
pub fn extract_domain(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ==================== RateLimiter Tests ====================

    #[test]
    fn test_rate_limiter_zero_cap_raised_to_one() {
        let limiter = RateLimiter::per_minute(0);
        assert_eq!(limiter.max_requests(), 1);
        assert_eq!(limiter.window(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_disabled_no_delay() {
        let limiter = RateLimiter::disabled();
        let start = Instant::now();

        for i in 0..10 {
            limiter.acquire(&format!("https://example.com/{i}")).await;
        }

        assert!(start.elapsed() < Duration::from_millis(10));
        assert!(limiter.is_disabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_third_request_waits_for_window() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        let start = Instant::now();
        let mut admitted = Vec::new();

        for i in 0..5 {
            limiter.acquire(&format!("https://example.com/{i}")).await;
            admitted.push(start.elapsed());
        }

        assert!(admitted[0] < Duration::from_millis(10));
        assert!(admitted[1] < Duration::from_millis(10));
        assert!(admitted[2] >= Duration::from_secs(60));
        assert!(admitted[3] >= Duration::from_secs(60));
        assert!(admitted[4] >= Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides_rather_than_resets() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        let start = Instant::now();

        limiter.acquire("https://example.com/a").await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        limiter.acquire("https://example.com/b").await;

        // Window holds t=0 and t=30; the third fits once t=0 expires at t=60.
        limiter.acquire("https://example.com/c").await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(60));
        assert!(elapsed < Duration::from_secs(61));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_hosts_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let start = Instant::now();

        limiter.acquire("https://a.example.com/1").await;
        limiter.acquire("https://b.example.com/1").await;

        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_shared_across_tasks() {
        let limiter = Arc::new(RateLimiter::new(2, Duration::from_secs(60)));
        let start = Instant::now();

        let mut handles = Vec::new();
        for i in 0..3 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.acquire(&format!("https://example.com/{i}")).await;
                start.elapsed()
            }));
        }

        let mut elapsed = Vec::new();
        for handle in handles {
            elapsed.push(handle.await.unwrap());
        }
        elapsed.sort();
        assert!(elapsed[1] < Duration::from_millis(10));
        assert!(elapsed[2] >= Duration::from_secs(60));
    }

    // ==================== Domain Extraction Tests ====================

    #[test]
    fn test_extract_domain_valid_https() {
        assert_eq!(
            extract_domain("https://hubeau.eaufrance.fr/api/v2/hydrometrie/obs_elab"),
            "hubeau.eaufrance.fr"
        );
    }

    #[test]
    fn test_extract_domain_with_port() {
        assert_eq!(extract_domain("http://127.0.0.1:8080/x"), "127.0.0.1");
    }

    #[test]
    fn test_extract_domain_malformed_url() {
        assert_eq!(extract_domain("not a url"), "unknown");
        assert_eq!(extract_domain(""), "unknown");
    }
}
