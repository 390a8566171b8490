//! HTTP client wrapper with retry and backoff.
//!
//! This module provides the [`HttpClient`] every agency request goes through.
//! Request bodies are buffered in memory for [`HttpClient::get`]; archives are
//! streamed to disk with [`HttpClient::download_to_path`].
//!
//! URLs that reach errors, log fields or [`HttpResponse::url`] are redacted:
//! values of secret parameters are replaced with `***`.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, HeaderMap};
use serde::de::DeserializeOwned;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, instrument, warn};
use url::Url;
use url::form_urlencoded;

use super::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
use super::error::TransportError;
use super::retry::{RetryDecision, RetryPolicy, classify_error};

/// User-Agent sent with every request.
pub const USER_AGENT: &str = concat!("hydrofetch/", env!("CARGO_PKG_VERSION"));

/// Query parameters always redacted, compared case-insensitively.
const SENSITIVE_PARAMS: &[&str] = &[
    "password",
    "passwd",
    "token",
    "access_token",
    "key",
    "apikey",
    "api_key",
    "secret",
];

const REDACTED: &str = "***";

/// A request: base URL plus query parameters, headers and an optional
/// form body. Requests with a form body are sent as POST, all others as GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    url: String,
    params: Vec<(String, String)>,
    secret_params: Vec<String>,
    headers: Vec<(String, String)>,
    form: Option<Vec<(String, String)>>,
}

impl HttpRequest {
    /// Creates a request for `url` with no parameters or headers.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            params: Vec::new(),
            secret_params: Vec::new(),
            headers: Vec::new(),
            form: None,
        }
    }

    /// Appends a query parameter.
    #[must_use]
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    /// Appends a query parameter whose value is never shown in errors or
    /// logs.
    #[must_use]
    pub fn secret_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        self.secret_params.push(name.clone());
        self.params.push((name, value.into()));
        self
    }

    /// Appends a field to the `application/x-www-form-urlencoded` body,
    /// turning the request into a POST.
    #[must_use]
    pub fn form(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.form
            .get_or_insert_with(Vec::new)
            .push((name.into(), value.into()));
        self
    }

    /// Appends a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Base URL without the query parameters added through [`Self::param`].
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Query parameters in insertion order.
    #[must_use]
    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    /// Headers in insertion order.
    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Form body fields, present for POST requests.
    #[must_use]
    pub fn form_fields(&self) -> Option<&[(String, String)]> {
        self.form.as_deref()
    }

    /// `"POST"` when a form body is set, `"GET"` otherwise.
    #[must_use]
    pub fn method(&self) -> &'static str {
        if self.form.is_some() { "POST" } else { "GET" }
    }

    /// Resolves the full URL with query parameters appended.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidUrl`] if the base URL does not parse.
    pub fn resolve(&self) -> Result<Url, TransportError> {
        let mut url = Url::parse(&self.url).map_err(|_| TransportError::invalid_url(&self.url))?;
        if !self.params.is_empty() {
            url.query_pairs_mut().extend_pairs(&self.params);
        }
        Ok(url)
    }

    /// The full URL with secret values replaced, for errors and logs.
    ///
    /// Falls back to the base URL when it does not parse.
    #[must_use]
    pub fn redacted_url(&self) -> String {
        self.resolve()
            .map_or_else(|_| self.url.clone(), |url| self.redact(&url))
    }

    /// Replaces the values of secret parameters in `url`, and any password
    /// in its userinfo.
    #[must_use]
    pub fn redact(&self, url: &Url) -> String {
        let mut shown = url.clone();
        if shown.password().is_some() {
            let _ = shown.set_password(Some(REDACTED));
        }
        if shown.query().is_none() {
            return shown.into();
        }
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(name, value)| {
                let value = if self.is_secret(&name) {
                    REDACTED.to_string()
                } else {
                    value.into_owned()
                };
                (name.into_owned(), value)
            })
            .collect();
        shown.query_pairs_mut().clear().extend_pairs(&pairs);
        shown.into()
    }

    fn is_secret(&self, name: &str) -> bool {
        self.secret_params.iter().any(|s| s == name)
            || SENSITIVE_PARAMS.iter().any(|s| s.eq_ignore_ascii_case(name))
    }

    fn encoded_form(&self) -> Option<String> {
        self.form.as_ref().map(|fields| {
            form_urlencoded::Serializer::new(String::new())
                .extend_pairs(fields)
                .finish()
        })
    }
}

/// A buffered successful response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    url: String,
    status: u16,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl HttpResponse {
    /// Final request URL, with secret parameter values redacted.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// HTTP status code.
    #[must_use]
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Value of a response header, if present and valid text.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Raw body bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.body
    }

    /// Body as UTF-8 text, replacing invalid sequences.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Deserializes the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if the body is not valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Consumes the response, returning the body bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.body
    }
}

/// HTTP client with a fixed retry schedule.
///
/// Create once per provider and reuse it; the inner `reqwest::Client` pools
/// connections and is cheap to clone.
///
/// # Example
///
/// ```no_run
/// use hydrofetch_core::transport::{HttpClient, HttpRequest};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = HttpClient::new(30, 60)?;
/// let response = client
///     .get(&HttpRequest::new("https://example.com/stations").param("active", "1"))
///     .await?;
/// println!("{}", response.text());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    retry: RetryPolicy,
}

impl HttpClient {
    /// Creates a client with explicit timeouts and the default retry policy.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ClientBuild`] if the TLS backend or the
    /// system configuration prevents building a client.
    pub fn new(connect_timeout_secs: u64, read_timeout_secs: u64) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .timeout(Duration::from_secs(read_timeout_secs))
            .gzip(true)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|source| TransportError::ClientBuild { source })?;
        Ok(Self {
            client,
            retry: RetryPolicy::default(),
        })
    }

    /// Creates a client with the default timeouts (30 s connect, 60 s read).
    ///
    /// # Errors
    ///
    /// See [`HttpClient::new`].
    pub fn with_default_timeouts() -> Result<Self, TransportError> {
        Self::new(CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS)
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the retry policy in use.
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Sends the request (GET, or POST when it has a form body), retrying
    /// transient failures, and buffers the body.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if:
    /// - The URL is invalid
    /// - Every attempt failed with a transient error (the last error is returned)
    /// - The server answered a non-retryable status (4xx, 503, ...)
    #[instrument(skip(self, request), fields(url = %request.url(), method = request.method()))]
    pub async fn get(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let url = request.resolve()?;
        let shown = request.redact(&url);
        let (url, shown) = (&url, shown.as_str());
        self.with_retries(shown, move || self.get_once(request, url, shown))
            .await
    }

    /// Streams a GET response body to `path`, retrying transient failures.
    ///
    /// A partially written file is removed before each retry and on failure.
    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`HttpClient::get`], plus
    /// [`TransportError::Io`] when the file cannot be written.
    #[instrument(skip(self, request, path), fields(url = %request.url(), path = %path.display()))]
    pub async fn download_to_path(
        &self,
        request: &HttpRequest,
        path: &Path,
    ) -> Result<u64, TransportError> {
        let url = request.resolve()?;
        let shown = request.redact(&url);
        let (url, shown) = (&url, shown.as_str());
        let bytes = self
            .with_retries(shown, move || async move {
                let result = self.download_once(request, url, shown, path).await;
                if result.is_err() {
                    let _ = tokio::fs::remove_file(path).await;
                }
                result
            })
            .await?;
        debug!(bytes, "archive written");
        Ok(bytes)
    }

    async fn with_retries<T, F, Fut>(&self, url: &str, mut operation: F) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut retries_done = 0;
        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            match self.retry.should_retry(classify_error(&error), retries_done) {
                RetryDecision::Retry { delay, retry } => {
                    warn!(
                        url,
                        retry,
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retries_done = retry;
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(url, reason = %reason, "giving up");
                    return Err(error);
                }
            }
        }
    }

    async fn send(
        &self,
        request: &HttpRequest,
        url: &Url,
        shown: &str,
    ) -> Result<reqwest::Response, TransportError> {
        let mut builder = match request.encoded_form() {
            Some(body) => self
                .client
                .post(url.clone())
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(body),
            None => self.client.get(url.clone()),
        };
        for (name, value) in request.headers() {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_reqwest_error(shown, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::http_status(shown, status.as_u16()));
        }
        Ok(response)
    }

    async fn get_once(
        &self,
        request: &HttpRequest,
        url: &Url,
        shown: &str,
    ) -> Result<HttpResponse, TransportError> {
        let response = self.send(request, url, shown).await?;
        let status = response.status().as_u16();
        let final_url = request.redact(response.url());
        let response_headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| map_reqwest_error(shown, e))?;

        Ok(HttpResponse {
            url: final_url,
            status,
            headers: response_headers,
            body: body.to_vec(),
        })
    }

    async fn download_once(
        &self,
        request: &HttpRequest,
        url: &Url,
        shown: &str,
        path: &Path,
    ) -> Result<u64, TransportError> {
        let response = self.send(request, url, shown).await?;
        let file = File::create(path)
            .await
            .map_err(|e| TransportError::io(path, e))?;
        stream_to_file(file, response, shown, path).await
    }
}

/// Streams response body to file, returning bytes written.
async fn stream_to_file(
    file: File,
    response: reqwest::Response,
    url: &str,
    path: &Path,
) -> Result<u64, TransportError> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| map_reqwest_error(url, e))?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| TransportError::io(path, e))?;
        bytes_written += chunk.len() as u64;
    }

    writer
        .flush()
        .await
        .map_err(|e| TransportError::io(path, e))?;

    Ok(bytes_written)
}

/// `url` is the redacted form; reqwest's own copy is stripped from the source.
fn map_reqwest_error(url: &str, error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::timeout(url)
    } else {
        TransportError::network(url, error.without_url())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use tempfile::TempDir;
    use wiremock::matchers::{body_string, header, method, path, query_param};
    use wiremock::{Mock, ResponseTemplate};

    fn fast_client() -> HttpClient {
        HttpClient::new(5, 5)
            .unwrap()
            .with_retry_policy(RetryPolicy::new(3, Duration::from_millis(1)))
    }

    // ==================== Request Tests ====================

    #[test]
    fn test_request_resolve_appends_params() {
        let request = HttpRequest::new("https://example.com/obs?fixed=1")
            .param("code", "A 1")
            .param("size", "20000");
        let url = request.resolve().unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.com/obs?fixed=1&code=A+1&size=20000"
        );
    }

    #[test]
    fn test_request_resolve_invalid_url() {
        let err = HttpRequest::new("not a url").resolve().unwrap_err();
        assert!(matches!(err, TransportError::InvalidUrl { .. }));
    }

    #[test]
    fn test_redacted_url_hides_secret_and_sensitive_params() {
        let request = HttpRequest::new("https://user:pw@example.com/obs")
            .param("station", "42")
            .secret_param("sid", "s3ss10n")
            .param("ApiKey", "k3y");
        let shown = request.redacted_url();
        assert!(shown.contains("station=42"));
        assert!(shown.contains("sid=***"));
        assert!(shown.contains("ApiKey=***"));
        assert!(!shown.contains("s3ss10n"));
        assert!(!shown.contains("k3y"));
        assert!(!shown.contains(":pw@"));
    }

    #[test]
    fn test_form_turns_request_into_post() {
        let get = HttpRequest::new("https://example.com/login");
        assert_eq!(get.method(), "GET");
        assert!(get.form_fields().is_none());

        let post = get.form("username", "u").form("password", "p w");
        assert_eq!(post.method(), "POST");
        assert_eq!(post.encoded_form().unwrap(), "username=u&password=p+w");
        assert_eq!(post.resolve().unwrap().query(), None);
    }

    // ==================== GET Tests ====================

    #[tokio::test]
    async fn test_get_sends_params_and_headers() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/data"))
            .and(query_param("station", "42"))
            .and(header("X-API-Key", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"ok":true}"#))
            .expect(1)
            .mount(&mock_server)
            .await;

        let request = HttpRequest::new(format!("{}/data", mock_server.uri()))
            .param("station", "42")
            .header("X-API-Key", "secret");
        let response = fast_client().get(&request).await.unwrap();

        assert_eq!(response.status(), 200);
        let body: serde_json::Value = response.json().unwrap();
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn test_get_retries_transient_status_then_succeeds() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(2)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_string("done"))
            .mount(&mock_server)
            .await;

        let request = HttpRequest::new(format!("{}/flaky", mock_server.uri()));
        let response = fast_client().get(&request).await.unwrap();
        assert_eq!(response.text(), "done");
    }

    #[tokio::test]
    async fn test_get_gives_up_after_four_attempts() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(500))
            .expect(4)
            .mount(&mock_server)
            .await;

        let request = HttpRequest::new(format!("{}/down", mock_server.uri()));
        let err = fast_client().get(&request).await.unwrap_err();
        assert_eq!(err.status(), Some(500));
    }

    #[tokio::test]
    async fn test_get_does_not_retry_client_errors() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&mock_server)
            .await;

        let request = HttpRequest::new(format!("{}/missing", mock_server.uri()));
        let err = fast_client().get(&request).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_get_does_not_retry_503() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/busy"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&mock_server)
            .await;

        let request = HttpRequest::new(format!("{}/busy", mock_server.uri()));
        let err = fast_client().get(&request).await.unwrap_err();
        assert_eq!(err.status(), Some(503));
    }

    #[tokio::test]
    async fn test_get_timeout_is_retried() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .expect(2)
            .mount(&mock_server)
            .await;

        let client = HttpClient::new(1, 1)
            .unwrap()
            .with_retry_policy(RetryPolicy::new(1, Duration::from_millis(1)));
        let request = HttpRequest::new(format!("{}/slow", mock_server.uri()));
        let err = client.get(&request).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_form_request_posts_body() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("POST"))
            .and(path("/login"))
            .and(header("content-type", "application/x-www-form-urlencoded"))
            .and(body_string("username=u&password=hunter2"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let request = HttpRequest::new(format!("{}/login", mock_server.uri()))
            .form("username", "u")
            .form("password", "hunter2");
        let response = fast_client().get(&request).await.unwrap();
        assert_eq!(response.text(), "ok");
        assert!(!response.url().contains("hunter2"));
    }

    #[tokio::test]
    async fn test_status_error_and_response_url_are_redacted() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/denied"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/data"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .mount(&mock_server)
            .await;

        let denied = HttpRequest::new(format!("{}/denied", mock_server.uri()))
            .param("password", "hunter2secret");
        let err = fast_client().get(&denied).await.unwrap_err();
        assert_eq!(err.status(), Some(401));
        assert!(!err.to_string().contains("hunter2secret"));
        assert!(err.to_string().contains("password=***"));

        let data = HttpRequest::new(format!("{}/data", mock_server.uri()))
            .param("station", "42")
            .secret_param("auth", "t0ken");
        let response = fast_client().get(&data).await.unwrap();
        assert!(response.url().contains("station=42"));
        assert!(!response.url().contains("t0ken"));
    }

    #[tokio::test]
    async fn test_network_error_is_redacted() {
        let request = HttpRequest::new("http://127.0.0.1:1/data").param("token", "t0ken");
        let client = HttpClient::new(1, 1)
            .unwrap()
            .with_retry_policy(RetryPolicy::new(0, Duration::from_millis(1)));
        let err = client.get(&request).await.unwrap_err();
        assert!(!format!("{err:?}").contains("t0ken"));
        assert!(!err.to_string().contains("t0ken"));
    }

    // ==================== Streaming Download Tests ====================

    #[tokio::test]
    async fn test_download_to_path_streams_body() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp_dir = TempDir::new().unwrap();
        let body = vec![7_u8; 256 * 1024];
        Mock::given(method("GET"))
            .and(path("/archive.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&mock_server)
            .await;

        let target = temp_dir.path().join("archive.zip");
        let request = HttpRequest::new(format!("{}/archive.zip", mock_server.uri()));
        let written = fast_client()
            .download_to_path(&request, &target)
            .await
            .unwrap();

        assert_eq!(written, body.len() as u64);
        assert_eq!(std::fs::read(&target).unwrap(), body);
    }

    #[tokio::test]
    async fn test_download_to_path_error_leaves_no_file() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp_dir = TempDir::new().unwrap();
        Mock::given(method("GET"))
            .and(path("/gone.zip"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&mock_server)
            .await;

        let target = temp_dir.path().join("gone.zip");
        let request = HttpRequest::new(format!("{}/gone.zip", mock_server.uri()));
        let err = fast_client()
            .download_to_path(&request, &target)
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(410));
        assert!(!target.exists());
    }
}
