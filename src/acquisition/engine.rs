//! Sequential window walker shared by every online adapter.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use super::window::{ChunkPolicy, DateWindow};
use crate::rate_limit::RateLimiter;
use crate::series::Observation;
use crate::session::AuthSession;
use crate::transport::{HttpClient, HttpRequest, HttpResponse, TransportError};
use crate::variable::Variable;

/// Hard cap on pages followed within one window, whatever the plan says.
pub const MAX_PAGES_PER_WINDOW: usize = 10_000;

/// One downloaded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPage {
    /// Window the payload was requested for.
    pub window: DateWindow,
    /// Page number within the window (0-based).
    pub page: usize,
    /// Request URL including query parameters, with secret values
    /// redacted.
    pub url: String,
    /// Response body.
    pub body: String,
}

/// What an adapter's download step produced.
#[derive(Debug, Clone, PartialEq)]
pub enum RawData {
    /// Unparsed payloads, one per request.
    Pages(Vec<RawPage>),
    /// Already-decoded observations (bulk cache slices).
    Observations(Vec<Observation>),
}

impl RawData {
    /// Whether nothing was downloaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            RawData::Pages(pages) => pages.is_empty(),
            RawData::Observations(obs) => obs.is_empty(),
        }
    }
}

/// How an adapter's online endpoint is walked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionPlan {
    /// How the requested range is windowed.
    pub chunking: ChunkPolicy,
    /// Period the agency has records for, when known.
    pub record_extent: Option<DateWindow>,
    /// Whether every request needs a session token.
    pub requires_token: bool,
    /// Whether one failed window abandons the rest of the walk.
    pub strict_continuity: bool,
}

impl AcquisitionPlan {
    /// A plan with the given chunking and no other constraints.
    #[must_use]
    pub fn new(chunking: ChunkPolicy) -> Self {
        Self {
            chunking,
            record_extent: None,
            requires_token: false,
            strict_continuity: false,
        }
    }

    /// Restricts windows to the agency's record period.
    #[must_use]
    pub fn with_record_extent(mut self, extent: DateWindow) -> Self {
        self.record_extent = Some(extent);
        self
    }

    /// Requires a session token on every request.
    #[must_use]
    pub fn requiring_token(mut self) -> Self {
        self.requires_token = true;
        self
    }

    /// Abandons the walk at the first failed window.
    #[must_use]
    pub fn strict(mut self) -> Self {
        self.strict_continuity = true;
        self
    }
}

/// Builds the requests an adapter needs for one window.
pub trait RequestPlanner: Send + Sync {
    /// First request for `window`.
    fn plan_request(&self, gauge_id: &str, variable: &Variable, window: &DateWindow) -> HttpRequest;

    /// Next page after `response`, or `None` when the window is complete.
    ///
    /// Only consulted under [`ChunkPolicy::Cursor`]. Return `None` on a short
    /// page as well as when the endpoint offers no continuation.
    fn next_page(&self, _previous: &HttpRequest, _response: &HttpResponse) -> Option<HttpRequest> {
        None
    }
}

/// Why a window could not be completed.
enum WindowFailure {
    NoToken,
    Transport(TransportError),
}

/// Walks an adapter's windows sequentially through the shared transport,
/// rate limiter and session.
#[derive(Debug, Clone)]
pub struct AcquisitionEngine {
    client: HttpClient,
    rate_limiter: Arc<RateLimiter>,
    session: Option<Arc<AuthSession>>,
}

impl AcquisitionEngine {
    /// Creates an engine without a session.
    #[must_use]
    pub fn new(client: HttpClient, rate_limiter: Arc<RateLimiter>) -> Self {
        Self {
            client,
            rate_limiter,
            session: None,
        }
    }

    /// Attaches the provider's session.
    #[must_use]
    pub fn with_session(mut self, session: Arc<AuthSession>) -> Self {
        self.session = Some(session);
        self
    }

    /// The transport used for every request.
    #[must_use]
    pub fn client(&self) -> &HttpClient {
        &self.client
    }

    /// The shared rate limiter.
    #[must_use]
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// The attached session, if any.
    #[must_use]
    pub fn session(&self) -> Option<&Arc<AuthSession>> {
        self.session.as_ref()
    }

    /// Fetches one request through the limiter and, when `with_token`, the
    /// session. Used for one-off requests such as metadata catalogs.
    ///
    /// # Errors
    ///
    /// Returns the transport error of the final attempt.
    pub async fn fetch(
        &self,
        request: HttpRequest,
        with_token: bool,
    ) -> Result<HttpResponse, TransportError> {
        let request = if with_token && let Some(session) = &self.session {
            match session.get_token().await {
                Some(token) => session.apply(&token, request),
                None => request,
            }
        } else {
            request
        };
        self.rate_limiter.acquire(request.url()).await;
        self.client.get(&request).await
    }

    /// Walks every window of `[start, end]` for one gauge and variable.
    ///
    /// HTTP 404 counts as a window with no records. Other failures are
    /// logged; the walk continues unless the plan is strict. A missing token
    /// stops the walk and yields nothing.
    #[instrument(skip(self, planner, plan, variable), fields(variable = %variable, policy = ?plan.chunking))]
    pub async fn walk(
        &self,
        planner: &dyn RequestPlanner,
        plan: &AcquisitionPlan,
        gauge_id: &str,
        variable: &Variable,
        start: chrono::NaiveDate,
        end: chrono::NaiveDate,
    ) -> Vec<RawPage> {
        let windows = plan.chunking.split(start, end, plan.record_extent);
        debug!(windows = windows.len(), "planned request windows");

        let mut pages = Vec::new();
        for window in &windows {
            match self
                .walk_window(planner, plan, gauge_id, variable, window, &mut pages)
                .await
            {
                Ok(()) => {}
                Err(WindowFailure::NoToken) => {
                    warn!(window = %window, "no session token available, stopping");
                    return Vec::new();
                }
                Err(WindowFailure::Transport(error)) if error.is_not_found() => {
                    debug!(window = %window, "no records for window");
                }
                Err(WindowFailure::Transport(error)) => {
                    warn!(window = %window, error = %error, "window failed");
                    if plan.strict_continuity {
                        warn!(
                            kept_pages = pages.len(),
                            "abandoning remaining windows after failure"
                        );
                        break;
                    }
                }
            }
        }

        info!(pages = pages.len(), windows = windows.len(), "walk finished");
        pages
    }

    async fn walk_window(
        &self,
        planner: &dyn RequestPlanner,
        plan: &AcquisitionPlan,
        gauge_id: &str,
        variable: &Variable,
        window: &DateWindow,
        pages: &mut Vec<RawPage>,
    ) -> Result<(), WindowFailure> {
        let follow_cursor = matches!(plan.chunking, ChunkPolicy::Cursor { .. });
        let max_pages = plan.chunking.max_pages().min(MAX_PAGES_PER_WINDOW);

        let mut next = Some(planner.plan_request(gauge_id, variable, window));
        let mut page = 0;
        while let Some(request) = next.take() {
            if page >= max_pages {
                warn!(window = %window, max_pages, "page cap reached, truncating window");
                break;
            }

            let authorized = if plan.requires_token {
                let session = self.session.as_ref().ok_or(WindowFailure::NoToken)?;
                let token = session.get_token().await.ok_or(WindowFailure::NoToken)?;
                session.apply(&token, request.clone())
            } else {
                request.clone()
            };

            self.rate_limiter.acquire(authorized.url()).await;
            let response = self
                .client
                .get(&authorized)
                .await
                .map_err(WindowFailure::Transport)?;

            pages.push(RawPage {
                window: *window,
                page,
                url: response.url().to_string(),
                body: response.text(),
            });
            page += 1;

            if follow_cursor {
                next = planner.next_page(&request, &response);
            }
        }
        Ok(())
    }
}
