//! HTTP plumbing: a minimal transport seam, the reqwest-backed implementation,
//! and the bounded retry/backoff wrapper every outbound request goes through.
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::Rng;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::AUTHORIZATION;
use reqwest::redirect::Policy as RedirectPolicy;
use reqwest::Url;
use serde_json::Value;
use sociclaw_contracts::images::normalize_content_type;
use sociclaw_contracts::retry::RetryPolicy;
use tracing::{debug, warn};

/// Blocking sleep hook. Tests substitute a recorder.
pub type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

/// Vets each redirect target before it is requested. `Err` carries the reason.
pub type RedirectGuard = Arc<dyn Fn(&Url) -> Result<(), String> + Send + Sync>;

const DEFAULT_REDIRECT_LIMIT: usize = 10;

pub fn thread_sleeper() -> Sleeper {
    Arc::new(thread::sleep)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

#[derive(Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub json: Option<Value>,
    pub timeout: Duration,
    /// Stop reading the body once it grows past this many bytes.
    pub max_body_bytes: Option<usize>,
    /// `None` keeps the client's default redirect handling.
    pub max_redirects: Option<usize>,
    pub redirect_guard: Option<RedirectGuard>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: Vec::new(),
            json: None,
            timeout,
            max_body_bytes: None,
            max_redirects: None,
            redirect_guard: None,
        }
    }

    pub fn post_json(url: impl Into<String>, body: Value, timeout: Duration) -> Self {
        Self {
            method: HttpMethod::Post,
            json: Some(body),
            ..Self::get(url, timeout)
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn bearer_auth(self, token: &str) -> Self {
        self.header(AUTHORIZATION.as_str(), format!("Bearer {token}"))
    }

    pub fn with_body_limit(mut self, max_bytes: usize) -> Self {
        self.max_body_bytes = Some(max_bytes);
        self
    }

    pub fn with_max_redirects(mut self, limit: usize) -> Self {
        self.max_redirects = Some(limit);
        self
    }

    pub fn with_redirect_guard(mut self, guard: RedirectGuard) -> Self {
        self.redirect_guard = Some(guard);
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

// Hand-written so credentials and request bodies never reach logs.
impl fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header_names: Vec<&str> = self.headers.iter().map(|(name, _)| name.as_str()).collect();
        f.debug_struct("HttpRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("headers", &header_names)
            .field("has_json", &self.json.is_some())
            .field("timeout", &self.timeout)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("max_redirects", &self.max_redirects)
            .field("has_redirect_guard", &self.redirect_guard.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    /// Header names are lowercase.
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    /// URL after redirects.
    pub final_url: String,
    /// The body was cut off at the request's `max_body_bytes`.
    pub body_truncated: bool,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn content_type(&self) -> Option<String> {
        self.header("content-type")
            .map(normalize_content_type)
            .filter(|value| !value.is_empty())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection to {url} failed: {message}")]
    Connect { url: String, message: String },
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("too many redirects fetching {url}")]
    Redirect { url: String },
    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },
}

impl TransportError {
    /// Connectivity and timeout failures are transient; everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::Timeout { .. })
    }
}

/// One HTTP exchange, no retries. Implementations must enforce
/// `max_body_bytes` while reading rather than after buffering.
pub trait HttpTransport: Send + Sync {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Blocking reqwest transport.
pub struct ReqwestTransport {
    http: HttpClient,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            http: HttpClient::new(),
        }
    }

    fn client_for(&self, request: &HttpRequest) -> Result<HttpClient, TransportError> {
        if request.max_redirects.is_none() && request.redirect_guard.is_none() {
            return Ok(self.http.clone());
        }
        let limit = request.max_redirects.unwrap_or(DEFAULT_REDIRECT_LIMIT);
        let guard = request.redirect_guard.clone();
        let policy = RedirectPolicy::custom(move |attempt| {
            match check_redirect_hop(guard.as_ref(), limit, attempt.previous().len(), attempt.url()) {
                Ok(()) => attempt.follow(),
                Err(reason) => attempt.error(reason),
            }
        });
        HttpClient::builder()
            .redirect(policy)
            .build()
            .map_err(|err| TransportError::Request {
                url: request.url.clone(),
                message: err.to_string(),
            })
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport for ReqwestTransport {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let client = self.client_for(request)?;
        let mut builder = match request.method {
            HttpMethod::Get => client.get(&request.url),
            HttpMethod::Post => client.post(&request.url),
        }
        .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.json {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .map_err(|err| classify_reqwest_error(&request.url, err))?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
            })
            .collect();
        let (body, body_truncated) = read_body(response, request.max_body_bytes).map_err(|err| {
            if err.kind() == io::ErrorKind::TimedOut {
                TransportError::Timeout {
                    url: request.url.clone(),
                }
            } else {
                TransportError::Request {
                    url: request.url.clone(),
                    message: format!("body read failed: {err}"),
                }
            }
        })?;

        Ok(HttpResponse {
            status,
            headers,
            body,
            final_url,
            body_truncated,
        })
    }
}

/// `visited` counts the URLs already requested, the original one included.
fn check_redirect_hop(
    guard: Option<&RedirectGuard>,
    limit: usize,
    visited: usize,
    next: &Url,
) -> Result<(), String> {
    if visited > limit {
        return Err(format!("more than {limit} redirects"));
    }
    match guard {
        Some(guard) => guard(next),
        None => Ok(()),
    }
}

fn read_body<R: Read>(mut reader: R, max_bytes: Option<usize>) -> io::Result<(Vec<u8>, bool)> {
    let mut body = Vec::new();
    match max_bytes {
        Some(limit) => {
            // One byte past the limit is enough to know it was exceeded.
            reader.take(limit as u64 + 1).read_to_end(&mut body)?;
            let truncated = body.len() > limit;
            body.truncate(limit);
            Ok((body, truncated))
        }
        None => {
            reader.read_to_end(&mut body)?;
            Ok((body, false))
        }
    }
}

fn classify_reqwest_error(url: &str, err: reqwest::Error) -> TransportError {
    let url = url.to_string();
    if err.is_timeout() {
        TransportError::Timeout { url }
    } else if err.is_redirect() {
        TransportError::Redirect { url }
    } else if err.is_connect() {
        TransportError::Connect {
            url,
            message: err.to_string(),
        }
    } else {
        TransportError::Request {
            url,
            message: err.to_string(),
        }
    }
}

/// Bounded retries with exponential backoff and jitter around an [`HttpTransport`].
#[derive(Clone)]
pub struct RetryTransport {
    inner: Arc<dyn HttpTransport>,
    sleeper: Sleeper,
}

impl RetryTransport {
    pub fn new(inner: Arc<dyn HttpTransport>) -> Self {
        Self {
            inner,
            sleeper: thread_sleeper(),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn sleeper(&self) -> Sleeper {
        self.sleeper.clone()
    }

    /// Retries connectivity/timeout errors and `policy`'s retryable statuses while
    /// attempts remain. Any other response is returned as-is; the last error is
    /// returned once attempts run out.
    pub fn execute(
        &self,
        request: &HttpRequest,
        policy: &RetryPolicy,
    ) -> Result<HttpResponse, TransportError> {
        let attempts = policy.attempts();
        let mut rng = rand::rng();
        let mut attempt = 0u32;
        loop {
            let has_more = attempt + 1 < attempts;
            match self.inner.execute(request) {
                Ok(response) if has_more && policy.is_retryable_status(response.status) => {
                    let delay = backoff_delay(policy, attempt, &mut rng);
                    warn!(
                        method = request.method.as_str(),
                        url = %request.url,
                        status = response.status,
                        attempt = attempt + 1,
                        attempts,
                        delay_s = delay.as_secs_f64(),
                        "retryable HTTP status; backing off"
                    );
                    (self.sleeper)(delay);
                }
                Ok(response) => {
                    debug!(
                        method = request.method.as_str(),
                        url = %request.url,
                        status = response.status,
                        "HTTP request finished"
                    );
                    return Ok(response);
                }
                Err(err) if has_more && err.is_retryable() => {
                    let delay = backoff_delay(policy, attempt, &mut rng);
                    warn!(
                        method = request.method.as_str(),
                        error = %err,
                        attempt = attempt + 1,
                        attempts,
                        delay_s = delay.as_secs_f64(),
                        "transient transport failure; backing off"
                    );
                    (self.sleeper)(delay);
                }
                Err(err) => return Err(err),
            }
            attempt += 1;
        }
    }
}

/// `base * 2^attempt` plus uniform jitter in `[0, min(0.25s, 20% of the base delay)]`.
pub fn backoff_delay<R: Rng>(policy: &RetryPolicy, attempt: u32, rng: &mut R) -> Duration {
    let base = policy.base_delay_seconds(attempt);
    let cap = policy.jitter_cap_seconds(attempt);
    let jitter = if cap > 0.0 {
        rng.random_range(0.0..=cap)
    } else {
        0.0
    };
    Duration::from_secs_f64(base + jitter)
}
