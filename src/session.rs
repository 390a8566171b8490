//! Per-provider authentication sessions.
//!
//! An [`AuthSession`] owns a provider's credentials and its cached token.
//! [`AuthSession::get_token`] hands out the cached token while it is still
//! valid (its expiry lies beyond `now + refresh_margin`) and otherwise runs a
//! credential exchange through a [`CredentialExchange`] implementation.
//!
//! Static API keys are a degenerate session: the key is the token and never
//! expires. Tokens live only in memory.
//!
//! ```
//! use hydrofetch_core::session::{AuthSession, TokenPlacement};
//!
//! # async fn example() {
//! let session = AuthSession::static_key(
//!     "norway",
//!     "my-key",
//!     TokenPlacement::header("X-API-Key"),
//! );
//! let token = session.get_token().await.unwrap();
//! assert_eq!(token.value(), "my-key");
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::transport::{HttpClient, HttpRequest, TransportError};

/// Default safety margin before expiry at which a token is refreshed.
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Errors raised by a credential exchange.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The exchange request itself failed.
    #[error("credential exchange request failed: {0}")]
    Transport(#[from] TransportError),

    /// The agency answered but refused the credentials.
    #[error("credentials rejected: {message}")]
    Rejected {
        /// Message reported by the agency.
        message: String,
    },

    /// The response could not be read as a token envelope.
    #[error("malformed token envelope: {reason}")]
    MalformedEnvelope {
        /// What was missing or unreadable.
        reason: String,
    },
}

impl AuthError {
    /// Creates a rejection error.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    /// Creates a malformed-envelope error.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedEnvelope {
            reason: reason.into(),
        }
    }
}

/// Provider credentials.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// A static API key.
    ApiKey(String),
    /// A username/password pair exchanged for a token.
    Login {
        /// Account name.
        username: String,
        /// Account password.
        password: String,
    },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApiKey(_) => f.write_str("ApiKey(<redacted>)"),
            Self::Login { username, .. } => f
                .debug_struct("Login")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// Where a token goes on outgoing requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenPlacement {
    /// A request header, optionally prefixed (e.g. `Bearer `).
    Header {
        /// Header name.
        name: String,
        /// Text placed before the token value.
        prefix: String,
    },
    /// A query parameter, redacted wherever the URL is shown.
    Query {
        /// Parameter name.
        name: String,
    },
}

impl TokenPlacement {
    /// Token sent verbatim in header `name`.
    #[must_use]
    pub fn header(name: impl Into<String>) -> Self {
        Self::Header {
            name: name.into(),
            prefix: String::new(),
        }
    }

    /// Token sent as `Authorization: Bearer <token>`.
    #[must_use]
    pub fn bearer() -> Self {
        Self::Header {
            name: "Authorization".to_string(),
            prefix: "Bearer ".to_string(),
        }
    }

    /// Token sent as query parameter `name`.
    #[must_use]
    pub fn query(name: impl Into<String>) -> Self {
        Self::Query { name: name.into() }
    }
}

/// A token as returned by an exchange, before it is stamped with an expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    /// Token value.
    pub value: String,
    /// Lifetime from issue; `None` never expires.
    pub lifetime: Option<Duration>,
}

/// A cached token with its expiry instant.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken {
    value: String,
    expires_at: Option<Instant>,
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl AuthToken {
    /// Token value.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Expiry instant; `None` never expires.
    #[must_use]
    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    fn is_fresh(&self, now: Instant, margin: Duration) -> bool {
        self.expires_at.is_none_or(|expiry| now + margin < expiry)
    }
}

/// Exchanges credentials for a token.
#[async_trait]
pub trait CredentialExchange: Send + Sync {
    /// Performs one exchange.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] when the request fails, the credentials are
    /// refused, or the response envelope is unreadable.
    async fn exchange(&self, credentials: &Credentials) -> Result<IssuedToken, AuthError>;
}

/// Exchange that POSTs the credentials as a form to a login endpoint and
/// reads a JSON envelope.
///
/// The envelope fields are located with JSON pointers (RFC 6901), so both
/// `{"success":true,"token":"…"}` and `{"data":{"token":"…"}}` shapes work.
#[derive(Debug, Clone)]
pub struct EnvelopeExchange {
    client: HttpClient,
    url: String,
    username_param: String,
    password_param: String,
    success_pointer: Option<String>,
    token_pointer: String,
    expires_in_pointer: Option<String>,
    message_pointer: Option<String>,
    default_lifetime: Option<Duration>,
}

impl EnvelopeExchange {
    /// Creates an exchange against `url` reading the token at `/token`.
    #[must_use]
    pub fn new(client: HttpClient, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            username_param: "username".to_string(),
            password_param: "password".to_string(),
            success_pointer: None,
            token_pointer: "/token".to_string(),
            expires_in_pointer: None,
            message_pointer: None,
            default_lifetime: None,
        }
    }

    /// Sets the form field names carrying the login.
    #[must_use]
    pub fn login_params(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username_param = username.into();
        self.password_param = password.into();
        self
    }

    /// Reads a boolean success flag at `pointer`; `false` means rejected.
    #[must_use]
    pub fn success_at(mut self, pointer: impl Into<String>) -> Self {
        self.success_pointer = Some(pointer.into());
        self
    }

    /// Reads the token value at `pointer`.
    #[must_use]
    pub fn token_at(mut self, pointer: impl Into<String>) -> Self {
        self.token_pointer = pointer.into();
        self
    }

    /// Reads the lifetime in seconds at `pointer`.
    #[must_use]
    pub fn expires_in_at(mut self, pointer: impl Into<String>) -> Self {
        self.expires_in_pointer = Some(pointer.into());
        self
    }

    /// Reads the agency's message at `pointer`.
    #[must_use]
    pub fn message_at(mut self, pointer: impl Into<String>) -> Self {
        self.message_pointer = Some(pointer.into());
        self
    }

    /// Lifetime assumed when the envelope carries none.
    #[must_use]
    pub fn default_lifetime(mut self, lifetime: Duration) -> Self {
        self.default_lifetime = Some(lifetime);
        self
    }

    fn read_envelope(&self, body: &Value) -> Result<IssuedToken, AuthError> {
        let message = self
            .message_pointer
            .as_deref()
            .and_then(|p| body.pointer(p))
            .and_then(Value::as_str)
            .unwrap_or("no message")
            .to_string();

        if let Some(pointer) = &self.success_pointer {
            match body.pointer(pointer).and_then(Value::as_bool) {
                Some(true) => {}
                Some(false) => return Err(AuthError::rejected(message)),
                None => {
                    return Err(AuthError::malformed(format!(
                        "missing success flag at {pointer}"
                    )));
                }
            }
        }

        let value = body
            .pointer(&self.token_pointer)
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                AuthError::malformed(format!("missing token at {}", self.token_pointer))
            })?
            .to_string();

        let lifetime = self
            .expires_in_pointer
            .as_deref()
            .and_then(|p| body.pointer(p))
            .and_then(|v| v.as_u64().or_else(|| v.as_str()?.parse().ok()))
            .map(Duration::from_secs)
            .or(self.default_lifetime);

        Ok(IssuedToken { value, lifetime })
    }
}

#[async_trait]
impl CredentialExchange for EnvelopeExchange {
    async fn exchange(&self, credentials: &Credentials) -> Result<IssuedToken, AuthError> {
        let request = match credentials {
            Credentials::Login { username, password } => HttpRequest::new(&self.url)
                .form(&self.username_param, username)
                .form(&self.password_param, password),
            Credentials::ApiKey(key) => HttpRequest::new(&self.url).form("key", key),
        };
        let response = self.client.get(&request).await?;
        let body: Value = response
            .json()
            .map_err(|e| AuthError::malformed(format!("response is not JSON: {e}")))?;
        self.read_envelope(&body)
    }
}

enum TokenSource {
    Static,
    Exchange(Arc<dyn CredentialExchange>),
}

/// Credentials, cached token and refresh logic for one provider.
pub struct AuthSession {
    provider: String,
    credentials: Option<Credentials>,
    placement: TokenPlacement,
    source: TokenSource,
    refresh_margin: Duration,
    cached: Mutex<Option<AuthToken>>,
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("provider", &self.provider)
            .field("credentials", &self.credentials)
            .field("placement", &self.placement)
            .field("refresh_margin", &self.refresh_margin)
            .finish_non_exhaustive()
    }
}

impl AuthSession {
    /// A session whose token is a static API key.
    #[must_use]
    pub fn static_key(
        provider: impl Into<String>,
        key: impl Into<String>,
        placement: TokenPlacement,
    ) -> Self {
        let key = key.into();
        let credentials = (!key.is_empty()).then_some(Credentials::ApiKey(key));
        Self {
            provider: provider.into(),
            credentials,
            placement,
            source: TokenSource::Static,
            refresh_margin: Duration::ZERO,
            cached: Mutex::new(None),
        }
    }

    /// A session that obtains tokens through `exchange`.
    ///
    /// `credentials` may be `None`; the session then never yields a token.
    #[must_use]
    pub fn with_exchange(
        provider: impl Into<String>,
        credentials: Option<Credentials>,
        placement: TokenPlacement,
        exchange: Arc<dyn CredentialExchange>,
    ) -> Self {
        Self {
            provider: provider.into(),
            credentials,
            placement,
            source: TokenSource::Exchange(exchange),
            refresh_margin: DEFAULT_REFRESH_MARGIN,
            cached: Mutex::new(None),
        }
    }

    /// Overrides the refresh margin.
    #[must_use]
    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    /// Provider the session belongs to.
    #[must_use]
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Whether credentials were supplied.
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Returns a valid token, refreshing it if needed.
    ///
    /// Concurrent callers share a single refresh: the cache lock is held
    /// across the exchange. Returns `None`, after logging, when credentials
    /// are missing or the exchange fails.
    #[instrument(level = "debug", skip(self), fields(provider = %self.provider))]
    pub async fn get_token(&self) -> Option<AuthToken> {
        let Some(credentials) = &self.credentials else {
            warn!("no credentials configured");
            return None;
        };

        let mut cached = self.cached.lock().await;
        let now = Instant::now();
        if let Some(token) = cached.as_ref()
            && token.is_fresh(now, self.refresh_margin)
        {
            return Some(token.clone());
        }

        let issued = match &self.source {
            TokenSource::Static => match credentials {
                Credentials::ApiKey(key) => IssuedToken {
                    value: key.clone(),
                    lifetime: None,
                },
                Credentials::Login { .. } => {
                    warn!("static session configured with a login instead of a key");
                    return None;
                }
            },
            TokenSource::Exchange(exchange) => match exchange.exchange(credentials).await {
                Ok(issued) => issued,
                Err(error) => {
                    warn!(error = %error, "credential exchange failed");
                    *cached = None;
                    return None;
                }
            },
        };

        let token = AuthToken {
            value: issued.value,
            expires_at: issued.lifetime.map(|lifetime| Instant::now() + lifetime),
        };
        if matches!(self.source, TokenSource::Exchange(_)) {
            info!(
                lifetime_secs = issued.lifetime.map(|l| l.as_secs()),
                "obtained new token"
            );
        } else {
            debug!("using static key");
        }
        *cached = Some(token.clone());
        Some(token)
    }

    /// Drops the cached token so the next call exchanges again.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    /// Attaches `token` to `request` according to the session's placement.
    #[must_use]
    pub fn apply(&self, token: &AuthToken, request: HttpRequest) -> HttpRequest {
        match &self.placement {
            TokenPlacement::Header { name, prefix } => {
                request.header(name, format!("{prefix}{}", token.value))
            }
            TokenPlacement::Query { name } => request.secret_param(name, &token.value),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use wiremock::matchers::{body_string, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use crate::transport::RetryPolicy;

    /// Issues numbered tokens with a fixed lifetime and counts exchanges.
    struct CountingExchange {
        calls: AtomicUsize,
        lifetime: Option<Duration>,
        fail: bool,
    }

    impl CountingExchange {
        fn new(lifetime: Option<Duration>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                lifetime,
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                lifetime: None,
                fail: true,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CredentialExchange for CountingExchange {
        async fn exchange(&self, _credentials: &Credentials) -> Result<IssuedToken, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err(AuthError::rejected("bad password"));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(IssuedToken {
                value: format!("token-{n}"),
                lifetime: self.lifetime,
            })
        }
    }

    fn login() -> Option<Credentials> {
        Some(Credentials::Login {
            username: "user".to_string(),
            password: "pass".to_string(),
        })
    }

    // ==================== Token Lifecycle Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_token_reused_within_lifetime() {
        let exchange = CountingExchange::new(Some(Duration::from_secs(1)));
        let session = AuthSession::with_exchange(
            "test",
            login(),
            TokenPlacement::bearer(),
            exchange.clone(),
        )
        .with_refresh_margin(Duration::ZERO);

        let first = session.get_token().await.unwrap();
        let second = session.get_token().await.unwrap();

        assert_eq!(first.value(), "token-1");
        assert_eq!(second.value(), "token-1");
        assert_eq!(exchange.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_token_refetched() {
        let exchange = CountingExchange::new(Some(Duration::from_secs(1)));
        let session = AuthSession::with_exchange(
            "test",
            login(),
            TokenPlacement::bearer(),
            exchange.clone(),
        )
        .with_refresh_margin(Duration::ZERO);

        assert_eq!(session.get_token().await.unwrap().value(), "token-1");
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(session.get_token().await.unwrap().value(), "token-2");
        assert_eq!(exchange.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_margin_triggers_early_refresh() {
        let exchange = CountingExchange::new(Some(Duration::from_secs(120)));
        let session = AuthSession::with_exchange(
            "test",
            login(),
            TokenPlacement::bearer(),
            exchange.clone(),
        );

        session.get_token().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        session.get_token().await.unwrap();
        assert_eq!(exchange.calls(), 1);

        // 70 s in: 60 s margin reaches past the 120 s expiry.
        tokio::time::sleep(Duration::from_secs(40)).await;
        session.get_token().await.unwrap();
        assert_eq!(exchange.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_refresh() {
        let exchange = CountingExchange::new(Some(Duration::from_secs(600)));
        let session = Arc::new(AuthSession::with_exchange(
            "test",
            login(),
            TokenPlacement::bearer(),
            exchange.clone(),
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let session = Arc::clone(&session);
            handles.push(tokio::spawn(async move { session.get_token().await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().value(), "token-1");
        }
        assert_eq!(exchange.calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_credentials_yield_none() {
        let exchange = CountingExchange::new(None);
        let session =
            AuthSession::with_exchange("test", None, TokenPlacement::bearer(), exchange.clone());
        assert!(!session.has_credentials());
        assert!(session.get_token().await.is_none());
        assert_eq!(exchange.calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_exchange_yields_none() {
        let exchange = CountingExchange::failing();
        let session =
            AuthSession::with_exchange("test", login(), TokenPlacement::bearer(), exchange.clone());
        assert!(session.get_token().await.is_none());
        assert_eq!(exchange.calls(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_exchange() {
        let exchange = CountingExchange::new(None);
        let session =
            AuthSession::with_exchange("test", login(), TokenPlacement::bearer(), exchange.clone());
        session.get_token().await.unwrap();
        session.invalidate().await;
        assert_eq!(session.get_token().await.unwrap().value(), "token-2");
    }

    // ==================== Static Key Tests ====================

    #[tokio::test]
    async fn test_static_key_never_expires() {
        let session = AuthSession::static_key("norway", "abc", TokenPlacement::header("X-API-Key"));
        let token = session.get_token().await.unwrap();
        assert_eq!(token.value(), "abc");
        assert!(token.expires_at().is_none());
    }

    #[tokio::test]
    async fn test_static_empty_key_is_missing() {
        let session = AuthSession::static_key("norway", "", TokenPlacement::header("X-API-Key"));
        assert!(!session.has_credentials());
        assert!(session.get_token().await.is_none());
    }

    #[tokio::test]
    async fn test_apply_header_and_query() {
        let header_session =
            AuthSession::static_key("a", "k1", TokenPlacement::bearer());
        let token = header_session.get_token().await.unwrap();
        let request = header_session.apply(&token, HttpRequest::new("https://example.com"));
        assert_eq!(
            request.headers(),
            &[("Authorization".to_string(), "Bearer k1".to_string())]
        );

        let query_session = AuthSession::static_key("b", "k2", TokenPlacement::query("token"));
        let token = query_session.get_token().await.unwrap();
        let request = query_session.apply(&token, HttpRequest::new("https://example.com"));
        assert_eq!(request.params(), &[("token".to_string(), "k2".to_string())]);

        let custom = AuthSession::static_key("c", "k3y-value", TokenPlacement::query("sig"));
        let token = custom.get_token().await.unwrap();
        let request = custom.apply(&token, HttpRequest::new("https://example.com/obs"));
        assert_eq!(request.redacted_url(), "https://example.com/obs?sig=***");
    }

    #[test]
    fn test_credentials_debug_redacts_secrets() {
        let rendered = format!("{:?}", login().unwrap());
        assert!(rendered.contains("user"));
        assert!(!rendered.contains("pass\""));
        assert!(format!("{:?}", Credentials::ApiKey("secret".into())).contains("redacted"));
    }

    // ==================== Envelope Tests ====================

    #[test]
    fn test_envelope_reads_nested_token_and_lifetime() {
        let exchange = EnvelopeExchange::new(
            HttpClient::with_default_timeouts().unwrap(),
            "https://example.com/login",
        )
        .success_at("/success")
        .token_at("/data/token")
        .expires_in_at("/data/expires_in")
        .message_at("/message");

        let body = serde_json::json!({
            "success": true,
            "message": "ok",
            "data": {"token": "tok", "expires_in": "3600"}
        });
        let issued = exchange.read_envelope(&body).unwrap();
        assert_eq!(issued.value, "tok");
        assert_eq!(issued.lifetime, Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_envelope_rejection_carries_message() {
        let exchange = EnvelopeExchange::new(
            HttpClient::with_default_timeouts().unwrap(),
            "https://example.com/login",
        )
        .success_at("/success")
        .message_at("/message");

        let body = serde_json::json!({"success": false, "message": "invalid login"});
        let err = exchange.read_envelope(&body).unwrap_err();
        assert!(matches!(err, AuthError::Rejected { ref message } if message == "invalid login"));
    }

    #[test]
    fn test_envelope_missing_token_is_malformed() {
        let exchange = EnvelopeExchange::new(
            HttpClient::with_default_timeouts().unwrap(),
            "https://example.com/login",
        )
        .default_lifetime(Duration::from_secs(10));
        let err = exchange
            .read_envelope(&serde_json::json!({"other": 1}))
            .unwrap_err();
        assert!(matches!(err, AuthError::MalformedEnvelope { .. }));
    }

    // ==================== Exchange Request Tests ====================

    fn exchange_for(server: &MockServer) -> EnvelopeExchange {
        let client = HttpClient::new(5, 5)
            .unwrap()
            .with_retry_policy(RetryPolicy::new(0, Duration::from_millis(1)));
        EnvelopeExchange::new(client, format!("{}/login", server.uri()))
            .success_at("/success")
            .message_at("/message")
    }

    fn hunter2() -> Credentials {
        Credentials::Login {
            username: "u".to_string(),
            password: "hunter2secret".to_string(),
        }
    }

    #[tokio::test]
    async fn test_exchange_posts_credentials_in_body() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("POST"))
            .and(path("/login"))
            .and(body_string("username=u&password=hunter2secret"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"{"success":true,"token":"tok"}"#),
            )
            .expect(1)
            .mount(&server)
            .await;

        let issued = exchange_for(&server).exchange(&hunter2()).await.unwrap();
        assert_eq!(issued.value, "tok");
    }

    #[tokio::test]
    async fn test_failed_exchange_does_not_leak_password() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = exchange_for(&server).exchange(&hunter2()).await.unwrap_err();
        let text = err.to_string();
        assert!(text.contains("401"));
        assert!(!text.contains("hunter2secret"));
        assert!(!format!("{err:?}").contains("hunter2secret"));
    }
}
