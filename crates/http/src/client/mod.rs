//! Canvass API client

pub mod auth;
pub mod error;
mod interceptor;

pub use auth::endpoints;

use crate::refresh::{DEFAULT_REFRESH_BACKOFF, RefreshPolicy};
use crate::tokens::TokenStore;
use crate::types::{RefreshRequest, TokenPair};
use canvass_core::{CanvassConfig, SingleFlight, redact_secrets};
use error::ClientError;
use reqwest::{Client, ClientBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Callback run when a `401` could not be recovered by a refresh
pub trait SessionLostHandler: Send + Sync {
    /// Called once per unrecoverable `401`
    fn on_session_lost(&self);
}

struct ClientInner {
    http: Client,
    base_url: String,
    tokens: Arc<TokenStore>,
    refresh_policy: RefreshPolicy,
    refresh_flight: SingleFlight<Option<String>>,
    session_lost: RwLock<Option<Arc<dyn SessionLostHandler>>>,
}

/// Canvass API client
///
/// Cloning is cheap; clones share tokens, the cookie jar and the refresh state.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

impl ApiClient {
    /// Create a new client with default configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        Self::builder().base_url(base_url).build()
    }

    /// Create a client from the loaded configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built
    pub fn from_config(config: &CanvassConfig) -> Result<Self, ClientError> {
        Self::builder()
            .base_url(&config.api.base_url)
            .timeout(config.api.timeout())
            .user_agent(&config.api.user_agent)
            .refresh_backoff(config.session.refresh_backoff())
            .build()
    }

    /// Create a new client builder
    pub fn builder() -> ApiClientBuilder {
        ApiClientBuilder::default()
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    /// Shared token store
    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.inner.tokens
    }

    /// Silent refresh guard
    pub fn refresh_policy(&self) -> &RefreshPolicy {
        &self.inner.refresh_policy
    }

    /// Store tokens; the default `Authorization` header follows the access token
    pub fn set_auth_tokens(&self, access: Option<&str>, refresh: Option<&str>) {
        self.inner.tokens.set_auth_tokens(access, refresh);
    }

    /// Current default `Authorization` header, e.g. `Bearer eyJ...`
    pub fn default_authorization(&self) -> Option<String> {
        self.inner
            .tokens
            .authorization_header()
            .and_then(|value| value.to_str().ok().map(str::to_owned))
    }

    /// Install the handler for unrecoverable `401` responses
    pub fn set_session_lost_handler(&self, handler: Arc<dyn SessionLostHandler>) {
        *self
            .inner
            .session_lost
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handler);
    }

    /// Absolute URL for an API path
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.inner.base_url, path)
    }

    /// Create a request builder; credentials are added by the interceptor chain
    pub fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.inner.http.request(method, self.url(path))
    }

    /// Execute a request through the interceptor chain and decode the JSON body
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError`] for transport failures and non-success statuses
    pub async fn execute<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ClientError> {
        let response = self.send(request.build()?).await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// Execute a request without bearer injection or refresh-on-401
    ///
    /// Used for endpoints that must work without a session, such as public
    /// survey access, health checks and the login exchanges themselves.
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError`] for transport failures and non-success statuses
    pub async fn execute_public<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ClientError> {
        let response = request.send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let message = response.text().await.unwrap_or_else(|_| status.to_string());
            Err(ClientError::from_status(status, message))
        }
    }

    /// Obtain a new access token using the refresh cookie (or legacy refresh token)
    ///
    /// Returns `None` without a network call when refresh is disabled, when no
    /// credentials are held, or while backing off after a failure. Concurrent
    /// callers share one request.
    #[instrument(skip(self))]
    pub async fn silent_refresh_access_token(&self) -> Option<String> {
        if let Err(skip) = self
            .inner
            .refresh_policy
            .check(self.inner.tokens.has_credentials())
        {
            debug!(?skip, "Skipping silent refresh");
            return None;
        }

        let client = self.clone();
        self.inner
            .refresh_flight
            .run(move || async move { client.perform_refresh().await })
            .await
    }

    async fn perform_refresh(&self) -> Option<String> {
        let body = RefreshRequest {
            refresh: self.inner.tokens.legacy_refresh_token(),
        };
        let result = self
            .inner
            .http
            .post(self.url(endpoints::TOKEN_REFRESH))
            .json(&body)
            .send()
            .await;

        let failure = match result {
            Ok(response) if response.status() == StatusCode::OK => {
                match response.json::<TokenPair>().await {
                    Ok(pair) => {
                        self.inner
                            .tokens
                            .set_auth_tokens(Some(&pair.access), pair.refresh.as_deref());
                        self.inner.refresh_policy.record_success();
                        info!("Access token refreshed");
                        return Some(pair.access);
                    }
                    Err(e) => format!("malformed refresh response: {e}"),
                }
            }
            Ok(response) => format!("refresh endpoint returned {}", response.status()),
            Err(e) => redact_secrets(&e.to_string()),
        };

        let disabled = self.inner.refresh_policy.record_failure();
        warn!(
            failures = self.inner.refresh_policy.failure_count(),
            disabled,
            "Silent refresh failed: {failure}"
        );
        None
    }

    fn notify_session_lost(&self) {
        let handler = self
            .inner
            .session_lost
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler {
            handler.on_session_lost();
        }
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.inner.base_url)
            .field("tokens", &self.inner.tokens)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ApiClient`]
#[derive(Default)]
pub struct ApiClientBuilder {
    base_url: Option<String>,
    timeout: Option<Duration>,
    user_agent: Option<String>,
    tokens: Option<Arc<TokenStore>>,
    refresh_backoff: Option<Duration>,
}

impl ApiClientBuilder {
    /// Set the base URL
    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Set the request timeout
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the user agent
    #[must_use]
    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    /// Share an existing token store
    #[must_use]
    pub fn tokens(mut self, tokens: Arc<TokenStore>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Set the gap enforced between failed refresh attempts
    #[must_use]
    pub const fn refresh_backoff(mut self, backoff: Duration) -> Self {
        self.refresh_backoff = Some(backoff);
        self
    }

    /// Build the client
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Configuration`] without a base URL, or a request
    /// error if the HTTP client cannot be created
    pub fn build(self) -> Result<ApiClient, ClientError> {
        let base_url = self
            .base_url
            .ok_or_else(|| ClientError::Configuration("base_url is required".into()))?;

        // Ensure base_url ends without a trailing slash
        let base_url = base_url.trim_end_matches('/').to_string();

        let mut client_builder = ClientBuilder::new().cookie_store(true);

        if let Some(timeout) = self.timeout {
            client_builder = client_builder.timeout(timeout);
        }

        client_builder = client_builder.user_agent(
            self.user_agent
                .unwrap_or_else(|| concat!("canvass-client/", env!("CARGO_PKG_VERSION")).into()),
        );

        let http = client_builder.build()?;

        Ok(ApiClient {
            inner: Arc::new(ClientInner {
                http,
                base_url,
                tokens: self.tokens.unwrap_or_default(),
                refresh_policy: RefreshPolicy::new(
                    self.refresh_backoff.unwrap_or(DEFAULT_REFRESH_BACKOFF),
                ),
                refresh_flight: SingleFlight::new(),
                session_lost: RwLock::new(None),
            }),
        })
    }
}
