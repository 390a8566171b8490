//! HTTP transport with retry and backoff.
//!
//! Every agency request goes through [`HttpClient`]. Connection failures,
//! timeouts and HTTP 500/502/504 are retried up to three times with a
//! `0.3 s * 2^(retry-1)` backoff; any other failure is returned immediately.
//!
//! # Example
//!
//! ```no_run
//! use hydrofetch_core::transport::{HttpClient, HttpRequest};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpClient::with_default_timeouts()?;
//! let request = HttpRequest::new("https://example.com/archive.zip");
//! let bytes = client
//!     .download_to_path(&request, std::path::Path::new("archive.zip"))
//!     .await?;
//! println!("wrote {bytes} bytes");
//! # Ok(())
//! # }
//! ```

mod client;
mod constants;
mod error;
mod retry;

pub use client::{HttpClient, HttpRequest, HttpResponse, USER_AGENT};
pub use constants::{
    CONNECT_TIMEOUT_SECS, DEFAULT_BACKOFF_FACTOR, DEFAULT_MAX_RETRIES, READ_TIMEOUT_SECS,
};
pub use error::TransportError;
pub use retry::{FailureType, RetryDecision, RetryPolicy, classify_error};
