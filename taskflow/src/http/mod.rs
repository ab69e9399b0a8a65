//! Authenticated REST client with transparent token refresh.
//!
//! Every request carries `Authorization: Bearer <access>` when the session
//! has one. A 401 on a request that has not been retried yet moves the
//! client into its refresh path:
//!
//! ```text
//! NORMAL --401--> REFRESHING --ok--> retry once --> NORMAL
//!                     |
//!                     +--fail--> clear session --> SessionExpired
//! ```
//!
//! Refreshes are serialized behind one async mutex. A request that queued
//! behind a refresh already performed by someone else retries with the new
//! token instead of refreshing again, so N concurrent 401s cost exactly one
//! refresh call.

pub mod error;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use taskflow_proto::auth::{RefreshRequest, TokenResponse};
use tokio_util::sync::CancellationToken;

pub use error::ApiError;

use crate::session::TokenStore;

/// Path of the refresh endpoint, relative to the base URL.
pub const REFRESH_PATH: &str = "/auth/refresh-token";

/// HTTP client settings.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Base URL every request path is appended to.
    pub base_url: String,
    /// Timeout applied to ordinary requests.
    pub request_timeout: Duration,
    /// Timeout applied to the refresh call.
    pub refresh_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: crate::config::DEFAULT_API_URL.to_string(),
            request_timeout: Duration::from_secs(30),
            refresh_timeout: Duration::from_secs(10),
        }
    }
}

impl HttpConfig {
    /// Defaults with a different base URL.
    #[must_use]
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
enum Body {
    Json(Vec<u8>),
    Text(String),
}

/// A request description, independent of any session state. The same value
/// is replayed verbatim when a request is retried after a refresh.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: reqwest::Method,
    path: String,
    query: Vec<(String, String)>,
    body: Option<Body>,
    anonymous: bool,
}

impl ApiRequest {
    /// Request with an explicit method. `path` starts with `/`.
    #[must_use]
    pub fn new(method: reqwest::Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            anonymous: false,
        }
    }

    /// `GET path`.
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(reqwest::Method::GET, path)
    }

    /// `POST path`.
    #[must_use]
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(reqwest::Method::POST, path)
    }

    /// `PUT path`.
    #[must_use]
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(reqwest::Method::PUT, path)
    }

    /// `DELETE path`.
    #[must_use]
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(reqwest::Method::DELETE, path)
    }

    /// Append a query parameter.
    #[must_use]
    pub fn query(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((name.into(), value.to_string()));
        self
    }

    /// Set a JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Decode`] if `body` cannot be serialized.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, ApiError> {
        self.body = Some(Body::Json(serde_json::to_vec(body)?));
        Ok(self)
    }

    /// Set a raw text body.
    #[must_use]
    pub fn text(mut self, body: impl Into<String>) -> Self {
        self.body = Some(Body::Text(body.into()));
        self
    }

    /// Send without a bearer token and never attempt a refresh. Used by the
    /// auth endpoints themselves.
    #[must_use]
    pub const fn anonymous(mut self) -> Self {
        self.anonymous = true;
        self
    }

    /// HTTP method.
    #[must_use]
    pub const fn method(&self) -> &reqwest::Method {
        &self.method
    }

    /// Path relative to the base URL.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// A successful response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// HTTP status.
    pub status: u16,
    /// Raw body.
    pub body: Vec<u8>,
}

impl ApiResponse {
    /// Deserialize the body.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Decode`] if the body is not the expected JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Body as text.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    fn into_result(self) -> Result<Self, ApiError> {
        match self.status {
            200..=299 => Ok(self),
            401 => Err(ApiError::Unauthorized),
            status => Err(ApiError::from_status(status, &self.body)),
        }
    }
}

struct Inner {
    client: reqwest::Client,
    config: HttpConfig,
    tokens: Arc<TokenStore>,
    refresh_lock: tokio::sync::Mutex<()>,
}

/// Shared REST client. Cheap to clone.
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("base_url", &self.inner.config.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpClient {
    /// Build a client bound to one session.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Network`] if the TLS backend cannot be set up.
    pub fn new(config: HttpConfig, tokens: Arc<TokenStore>) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                config,
                tokens,
                refresh_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// Session this client authenticates with.
    #[must_use]
    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.inner.tokens
    }

    /// Configured base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.inner.config.base_url
    }

    /// Send a request, refreshing the session once on 401.
    ///
    /// # Errors
    ///
    /// - [`ApiError::SessionExpired`] if the refresh failed; the session is
    ///   cleared before this returns.
    /// - [`ApiError::Unauthorized`] on a 401 with no session to refresh, or
    ///   a second 401 after a successful refresh.
    /// - [`ApiError::Validation`] / [`ApiError::Server`] for other statuses.
    /// - [`ApiError::Network`] if the request did not complete.
    pub async fn send(&self, req: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let sent_with = if req.anonymous {
            None
        } else {
            self.inner.tokens.access_token()
        };
        let response = self.execute(req, sent_with.as_deref()).await?;
        if response.status != 401 || req.anonymous {
            return response.into_result();
        }

        tracing::debug!(method = %req.method, path = %req.path, "401, entering refresh");
        let fresh = self.refresh_after_unauthorized(sent_with.as_deref()).await?;

        let retried = self.execute(req, Some(&fresh)).await?;
        if retried.status == 401 {
            tracing::warn!(
                method = %req.method,
                path = %req.path,
                "rejected again after refresh, giving up"
            );
            return Err(ApiError::Unauthorized);
        }
        retried.into_result()
    }

    /// [`send`](Self::send), abandoned as soon as `cancel` fires.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send), plus [`ApiError::Cancelled`].
    pub async fn send_cancellable(
        &self,
        req: &ApiRequest,
        cancel: &CancellationToken,
    ) -> Result<ApiResponse, ApiError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::debug!(path = %req.path, "request cancelled by caller");
                Err(ApiError::Cancelled)
            }
            result = self.send(req) => result,
        }
    }

    /// Send and deserialize a JSON response.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send), plus [`ApiError::Decode`].
    pub async fn send_json<T: DeserializeOwned>(&self, req: &ApiRequest) -> Result<T, ApiError> {
        self.send(req).await?.json()
    }

    /// Send and discard the response body.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send).
    pub async fn send_empty(&self, req: &ApiRequest) -> Result<(), ApiError> {
        self.send(req).await.map(drop)
    }

    async fn execute(&self, req: &ApiRequest, token: Option<&str>) -> Result<ApiResponse, ApiError> {
        let url = join_url(&self.inner.config.base_url, &req.path);
        let mut builder = self.inner.client.request(req.method.clone(), &url);
        if !req.query.is_empty() {
            builder = builder.query(&req.query);
        }
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        builder = match &req.body {
            Some(Body::Json(bytes)) => builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(bytes.clone()),
            Some(Body::Text(text)) => builder
                .header(reqwest::header::CONTENT_TYPE, "text/plain")
                .body(text.clone()),
            None => builder,
        };

        let response = builder.send().await.map_err(|e| {
            tracing::warn!(method = %req.method, path = %req.path, err = %e, "request failed");
            ApiError::from(e)
        })?;
        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        tracing::debug!(method = %req.method, path = %req.path, status, "response");
        Ok(ApiResponse { status, body })
    }

    /// Obtain a token to retry with after `rejected` earned a 401.
    async fn refresh_after_unauthorized(&self, rejected: Option<&str>) -> Result<String, ApiError> {
        let _guard = self.inner.refresh_lock.lock().await;
        let tokens = &self.inner.tokens;

        match (tokens.access_token(), rejected) {
            (Some(current), Some(rejected)) if current != rejected => {
                tracing::debug!("token already refreshed by a concurrent request");
                return Ok(current);
            }
            (Some(current), None) => return Ok(current),
            (None, Some(_)) => {
                // Cleared while we waited: a concurrent refresh failed.
                return Err(ApiError::SessionExpired);
            }
            (None, None) => return Err(ApiError::Unauthorized),
            (Some(_), Some(_)) => {}
        }

        let Some(refresh_token) = tokens.refresh_token() else {
            return Err(ApiError::Unauthorized);
        };

        match self.call_refresh(&refresh_token).await {
            Ok(pair) => {
                let next_refresh = pair.refresh_token.unwrap_or(refresh_token);
                if !tokens.update_tokens(pair.access_token.clone(), next_refresh) {
                    return Err(ApiError::SessionExpired);
                }
                tracing::info!("access token refreshed");
                Ok(pair.access_token)
            }
            Err(e) => {
                tracing::warn!(error = %e, "token refresh failed, ending session");
                tokens.expire();
                Err(ApiError::SessionExpired)
            }
        }
    }

    async fn call_refresh(&self, refresh_token: &str) -> Result<TokenResponse, ApiError> {
        let url = join_url(&self.inner.config.base_url, REFRESH_PATH);
        let response = self
            .inner
            .client
            .post(&url)
            .timeout(self.inner.config.refresh_timeout)
            .json(&RefreshRequest {
                refresh_token: refresh_token.to_string(),
            })
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        ApiResponse { status, body }.into_result()?.json()
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
