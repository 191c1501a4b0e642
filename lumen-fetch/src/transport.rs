//! Pluggable fetch capability.
//!
//! The pipeline never speaks HTTP itself; it hands a [`TransportRequest`]
//! to a [`Transport`] and turns the result into a
//! [`crate::outcome::FetchOutcome`]. Two implementations ship here:
//!
//! - [`HttpTransport`]: one shared blocking `ureq` agent with a global timeout
//! - [`MemoryTransport`]: URL → canned response table for offline use and tests
//!
//! Implementations must be `Send + Sync`; one instance is shared by every worker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::FetchError;

const DEFAULT_USER_AGENT: &str = concat!("lumen-fetch/", env!("CARGO_PKG_VERSION"));

/// Outbound request as seen by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
    pub url: String,
    /// Sent verbatim as the `Accept` header. Empty means "omit".
    pub accept: String,
}

/// Raw response produced by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn ok(content_type: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type: Some(content_type.into()),
            body,
        }
    }
}

/// Pipeline-wide cancellation flag, raised once at shutdown.
///
/// Blocking transports cannot be interrupted, but cooperative ones can
/// sleep on [`CancelToken::wait_timeout`] and bail out early.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock() = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Block for up to `timeout`. Returns `true` if cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut cancelled = flag.lock();
        while !*cancelled {
            if cvar.wait_until(&mut cancelled, deadline).timed_out() {
                break;
            }
        }
        *cancelled
    }

    /// Block until cancelled.
    pub fn wait(&self) {
        let (flag, cvar) = &*self.inner;
        let mut cancelled = flag.lock();
        while !*cancelled {
            cvar.wait(&mut cancelled);
        }
    }
}

/// The fetch capability the worker pool drives.
pub trait Transport: Send + Sync {
    /// Perform the fetch. Non-2xx statuses must be reported as errors.
    fn fetch(
        &self,
        request: &TransportRequest,
        cancel: &CancelToken,
    ) -> Result<TransportResponse, FetchError>;

    /// Cheap content-type check (HEAD). `Ok(None)` means "unknown, fetch anyway".
    fn head(
        &self,
        _request: &TransportRequest,
        _cancel: &CancelToken,
    ) -> Result<Option<String>, FetchError> {
        Ok(None)
    }
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn fetch(
        &self,
        request: &TransportRequest,
        cancel: &CancelToken,
    ) -> Result<TransportResponse, FetchError> {
        (**self).fetch(request, cancel)
    }

    fn head(
        &self,
        request: &TransportRequest,
        cancel: &CancelToken,
    ) -> Result<Option<String>, FetchError> {
        (**self).head(request, cancel)
    }
}

// ===================================================================
// HttpTransport
// ===================================================================

/// Blocking HTTP(S) transport.
///
/// One `ureq::Agent` is built up front and shared by every worker, so
/// connections are pooled across fetches.
///
/// ```ignore
/// let transport = HttpTransport::new()
///     .with_timeout(Duration::from_secs(10))
///     .with_user_agent("viewer/1.0");
/// ```
#[derive(Clone)]
pub struct HttpTransport {
    agent: ureq::Agent,
    timeout: Duration,
    user_agent: String,
    max_body_size: usize,
}

impl Default for HttpTransport {
    fn default() -> Self {
        let timeout = Duration::from_secs(30);
        Self {
            agent: build_agent(timeout),
            timeout,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_body_size: 32 * 1024 * 1024, // 32MB
        }
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("timeout", &self.timeout)
            .field("user_agent", &self.user_agent)
            .field("max_body_size", &self.max_body_size)
            .finish_non_exhaustive()
    }
}

fn build_agent(timeout: Duration) -> ureq::Agent {
    let config = ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .build();
    config.into()
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the agent with the new timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.agent = build_agent(timeout);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
        self.max_body_size = max_body_size;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The shared agent every fetch and HEAD request goes through.
    pub fn agent(&self) -> &ureq::Agent {
        &self.agent
    }

    fn map_error(&self, err: ureq::Error) -> FetchError {
        match err {
            ureq::Error::StatusCode(code) => FetchError::Status { code },
            ureq::Error::Timeout(_) => FetchError::Timeout,
            ureq::Error::HostNotFound => FetchError::Connect("host not found".to_string()),
            ureq::Error::ConnectionFailed => FetchError::Connect("connection failed".to_string()),
            ureq::Error::BadUri(uri) => FetchError::InvalidUrl(uri),
            ureq::Error::BodyExceedsLimit(_) => FetchError::BodyTooLarge {
                limit: self.max_body_size,
            },
            ureq::Error::Io(io) => io.into(),
            other => FetchError::Other(other.to_string()),
        }
    }
}

fn check_scheme(url: &str) -> Result<(), FetchError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(FetchError::InvalidUrl(url.to_string()))
    }
}

impl Transport for HttpTransport {
    fn fetch(
        &self,
        request: &TransportRequest,
        _cancel: &CancelToken,
    ) -> Result<TransportResponse, FetchError> {
        check_scheme(&request.url)?;

        let mut call = self
            .agent
            .get(&request.url)
            .header("User-Agent", &self.user_agent);
        if !request.accept.is_empty() {
            call = call.header("Accept", &request.accept);
        }

        let mut response = call.call().map_err(|e| self.map_error(e))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|h| h.to_str().ok())
            .map(|s| s.to_string());

        let body = response
            .body_mut()
            .with_config()
            .limit(self.max_body_size as u64)
            .read_to_vec()
            .map_err(|e| self.map_error(e))?;

        Ok(TransportResponse {
            status,
            content_type,
            body,
        })
    }

    fn head(
        &self,
        request: &TransportRequest,
        _cancel: &CancelToken,
    ) -> Result<Option<String>, FetchError> {
        check_scheme(&request.url)?;

        let mut call = self
            .agent
            .head(&request.url)
            .header("User-Agent", &self.user_agent);
        if !request.accept.is_empty() {
            call = call.header("Accept", &request.accept);
        }

        let response = call.call().map_err(|e| self.map_error(e))?;
        Ok(response
            .headers()
            .get("content-type")
            .and_then(|h| h.to_str().ok())
            .map(|s| s.to_string()))
    }
}

// ===================================================================
// MemoryTransport
// ===================================================================

#[derive(Debug, Clone)]
enum Route {
    Respond(TransportResponse),
    Fail(FetchError),
}

/// In-memory transport serving canned responses.
///
/// Unknown URLs fail with [`FetchError::NotFound`]. An optional latency is
/// slept on the cancel token, so shutdown interrupts it.
#[derive(Default)]
pub struct MemoryTransport {
    routes: RwLock<HashMap<String, Route>>,
    calls: Mutex<HashMap<String, usize>>,
    head_requests: Mutex<HashMap<String, usize>>,
    latency: Option<Duration>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Serve `body` with status 200 and the given content type.
    pub fn insert(&self, url: impl Into<String>, content_type: &str, body: Vec<u8>) {
        self.insert_response(url, TransportResponse::ok(content_type, body));
    }

    pub fn insert_response(&self, url: impl Into<String>, response: TransportResponse) {
        self.routes.write().insert(url.into(), Route::Respond(response));
    }

    /// Fail every fetch of `url` with `error`.
    pub fn insert_error(&self, url: impl Into<String>, error: FetchError) {
        self.routes.write().insert(url.into(), Route::Fail(error));
    }

    pub fn remove(&self, url: &str) {
        self.routes.write().remove(url);
    }

    /// Number of `fetch` calls made for `url`.
    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    /// Number of `head` calls made for `url`.
    pub fn head_requests(&self, url: &str) -> usize {
        self.head_requests.lock().get(url).copied().unwrap_or(0)
    }

    fn route(&self, url: &str) -> Result<TransportResponse, FetchError> {
        match self.routes.read().get(url) {
            Some(Route::Respond(response)) => Ok(response.clone()),
            Some(Route::Fail(error)) => Err(error.clone()),
            None => Err(FetchError::NotFound(url.to_string())),
        }
    }

    fn simulate_latency(&self, cancel: &CancelToken) -> Result<(), FetchError> {
        if let Some(latency) = self.latency {
            if cancel.wait_timeout(latency) {
                return Err(FetchError::Other("cancelled".to_string()));
            }
        }
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn fetch(
        &self,
        request: &TransportRequest,
        cancel: &CancelToken,
    ) -> Result<TransportResponse, FetchError> {
        *self.calls.lock().entry(request.url.clone()).or_insert(0) += 1;
        self.simulate_latency(cancel)?;

        let response = self.route(&request.url)?;
        if !(200..300).contains(&response.status) {
            return Err(FetchError::Status {
                code: response.status,
            });
        }
        Ok(response)
    }

    fn head(
        &self,
        request: &TransportRequest,
        _cancel: &CancelToken,
    ) -> Result<Option<String>, FetchError> {
        *self.head_requests.lock().entry(request.url.clone()).or_insert(0) += 1;
        let response = self.route(&request.url)?;
        Ok(response.content_type)
    }
}
