//! Management API session
//!
//! Wraps a cookie-backed `reqwest` client. Every request goes through
//! [`ApiClient::send`], which re-authenticates once when the session has
//! expired. Long-running mutations answer `202 Accepted` with a `Location`
//! header naming a task; [`ApiClient::wait_for_task`] polls it to a terminal
//! state with exponential backoff.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use metrics::counter;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::cache::{CachedValue, TtlCache};
use crate::error::{ApiError, Result};
use crate::models::{Task, TaskStatus};

/// Bytes that cannot appear literally inside one URL path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Encode a name for use as a single path segment.
pub(crate) fn segment(name: &str) -> String {
    utf8_percent_encode(name, PATH_SEGMENT).to_string()
}

/// Path under the endpoint where the versioned API lives
pub const API_BASE_PATH: &str = "/mgmt/v1.2/rest";

/// Counter: backend requests by method and response status
pub const BACKEND_REQUESTS_TOTAL: &str = "csi_backend_requests_total";
/// Counter: re-authentications triggered by expired sessions
pub const BACKEND_REAUTH_TOTAL: &str = "csi_backend_reauth_total";

/// Backoff schedule for task polling.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub initial: Duration,
    pub factor: f64,
    pub max_interval: Duration,
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            factor: 1.5,
            max_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(60 * 60),
        }
    }
}

impl PollPolicy {
    fn next_interval(&self, current: Duration) -> Duration {
        current.mul_f64(self.factor).min(self.max_interval)
    }
}

/// Connection settings for the management API.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// `https://host:port` of the management endpoint
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub tls_verify: bool,
    pub request_timeout: Duration,
    pub poll: PollPolicy,
}

impl ApiConfig {
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            username: username.into(),
            password: password.into(),
            tls_verify: true,
            request_timeout: Duration::from_secs(60),
            poll: PollPolicy::default(),
        }
    }
}

/// Authenticated client for the management API.
pub struct ApiClient {
    http: reqwest::Client,
    endpoint: String,
    base_url: String,
    username: String,
    password: String,
    poll: PollPolicy,
    cache: Arc<TtlCache<CachedValue>>,
    logged_in: AtomicBool,
}

fn is_auth_failure(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

impl ApiClient {
    /// Build a client. No request is issued until the first call.
    pub fn new(config: ApiConfig, cache: Arc<TtlCache<CachedValue>>) -> Result<Self> {
        let endpoint = config.endpoint.trim_end_matches('/').to_string();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(ApiError::InvalidEndpoint(config.endpoint));
        }

        if !config.tls_verify {
            warn!(endpoint = %endpoint, "TLS certificate verification disabled");
        }

        let http = reqwest::Client::builder()
            .cookie_store(true)
            .danger_accept_invalid_certs(!config.tls_verify)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: format!("{}{}", endpoint, API_BASE_PATH),
            endpoint,
            username: config.username,
            password: config.password,
            poll: config.poll,
            cache,
            logged_in: AtomicBool::new(false),
        })
    }

    pub fn cache(&self) -> &TtlCache<CachedValue> {
        &self.cache
    }

    /// Whether a login has succeeded at least once.
    pub fn is_ready(&self) -> bool {
        self.logged_in.load(Ordering::Relaxed)
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub(crate) fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http.request(method, self.url(path))
    }

    /// Open a new session.
    pub async fn login(&self) -> Result<()> {
        let resp = self
            .http
            .post(self.url("/login"))
            .form(&[
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await?;

        let status = resp.status();
        if is_auth_failure(status) {
            self.logged_in.store(false, Ordering::Relaxed);
            return Err(ApiError::Unauthorized);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::UnexpectedStatus {
                status: status.as_u16(),
                context: "login".to_string(),
                body,
            });
        }

        self.logged_in.store(true, Ordering::Relaxed);
        debug!(endpoint = %self.endpoint, "Logged in to management API");
        Ok(())
    }

    /// Send a request, re-authenticating once if the session was rejected.
    pub(crate) async fn send(&self, req: RequestBuilder) -> Result<Response> {
        let retry = req.try_clone();
        let resp = req.send().await?;
        record_request(&resp);

        if !is_auth_failure(resp.status()) {
            return Ok(resp);
        }

        let Some(retry) = retry else {
            return Err(ApiError::Unauthorized);
        };

        info!(url = %resp.url(), "Session rejected, re-authenticating");
        counter!(BACKEND_REAUTH_TOTAL).increment(1);
        self.login().await?;

        let resp = retry.send().await?;
        record_request(&resp);
        if is_auth_failure(resp.status()) {
            return Err(ApiError::Unauthorized);
        }
        Ok(resp)
    }

    /// Turn a non-success response into an error carrying its body.
    pub(crate) async fn unexpected(resp: Response, context: &str) -> ApiError {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        ApiError::UnexpectedStatus {
            status,
            context: context.to_string(),
            body,
        }
    }

    /// GET a JSON document, with 404 as `None`.
    pub(crate) async fn get_optional<T: DeserializeOwned>(
        &self,
        req: RequestBuilder,
        context: &str,
    ) -> Result<Option<T>> {
        let resp = self.send(req).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let bytes = resp.bytes().await?;
                Ok(Some(serde_json::from_slice(&bytes)?))
            }
            _ => Err(Self::unexpected(resp, context).await),
        }
    }

    /// GET a JSON document that must exist.
    pub(crate) async fn get_required<T: DeserializeOwned>(
        &self,
        req: RequestBuilder,
        context: &str,
    ) -> Result<T> {
        let resp = self.send(req).await?;
        if !resp.status().is_success() {
            return Err(Self::unexpected(resp, context).await);
        }
        let bytes = resp.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Issue a mutation and wait for it to finish.
    ///
    /// `202` is followed to its task; other 2xx codes are synchronous
    /// successes. Returns `Ok(false)` when the task ended unsuccessfully.
    pub(crate) async fn submit(&self, req: RequestBuilder, context: &str) -> Result<bool> {
        let resp = self.send(req).await?;
        match resp.status() {
            StatusCode::ACCEPTED => {
                let location = resp
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
                    .ok_or_else(|| ApiError::MissingLocation(context.to_string()))?;
                self.wait_for_task(&location).await
            }
            s if s.is_success() => Ok(true),
            _ => Err(Self::unexpected(resp, context).await),
        }
    }

    /// Like [`submit`](Self::submit) but a missing target counts as done.
    pub(crate) async fn submit_delete(&self, req: RequestBuilder, context: &str) -> Result<bool> {
        match self.submit(req, context).await {
            Err(e) if e.status() == Some(404) => {
                debug!(context, "Delete target already gone");
                Ok(true)
            }
            other => other,
        }
    }

    fn task_url(&self, location: &str) -> String {
        if location.starts_with("http://") || location.starts_with("https://") {
            location.to_string()
        } else if location.starts_with(API_BASE_PATH) {
            format!("{}{}", self.endpoint, location)
        } else {
            self.url(location)
        }
    }

    pub async fn get_task(&self, location: &str) -> Result<Task> {
        let req = self.http.get(self.task_url(location));
        self.get_required(req, "get task").await
    }

    /// Poll a task until it reaches a terminal state.
    ///
    /// Only `COMPLETED` yields `Ok(true)`; failed, halted and cancelled tasks
    /// yield `Ok(false)`. Exceeding the policy timeout is an error.
    pub async fn wait_for_task(&self, location: &str) -> Result<bool> {
        let started = Instant::now();
        let mut interval = self.poll.initial;

        loop {
            let task = self.get_task(location).await?;
            if task.status.is_terminal() {
                if task.status == TaskStatus::Completed {
                    debug!(task = %task.uuid, name = %task.name, "Task completed");
                    return Ok(true);
                }
                warn!(
                    task = %task.uuid,
                    name = %task.name,
                    status = ?task.status,
                    "Task ended without completing"
                );
                return Ok(false);
            }

            let waited = started.elapsed();
            if waited >= self.poll.timeout {
                return Err(ApiError::TaskTimeout {
                    location: location.to_string(),
                    waited,
                });
            }

            let remaining = self.poll.timeout - waited;
            tokio::time::sleep(interval.min(remaining)).await;
            interval = self.poll.next_interval(interval);
        }
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        let req = self.request(Method::GET, "/tasks");
        self.get_required(req, "list tasks").await
    }
}

fn record_request(resp: &Response) {
    counter!(
        BACKEND_REQUESTS_TOTAL,
        "status" => resp.status().as_u16().to_string()
    )
    .increment(1);
}
