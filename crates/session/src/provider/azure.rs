//! Azure AD (Microsoft identity platform v2.0) provider
//!
//! Interactive sign-in uses the authorization-code flow with PKCE and a
//! loopback redirect listener. When the redirect URI cannot be served locally,
//! or the browser never comes back, the device-code grant stands in for the
//! popup window a browser client would open. Silent acquisition redeems the
//! cached refresh token.

use super::loopback::{LoopbackListener, is_loopback};
use super::pkce::{PkcePair, random_token};
use super::{AuthenticationResult, AzureAccount, IdentityProvider, ProviderError};
use crate::claims::decode_claims;
use crate::lock;
use async_trait::async_trait;
use canvass_core::{AzureConfig, redact_secrets};
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use url::Url;

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(300);
const SLOW_DOWN_STEP: Duration = Duration::from_secs(5);

/// Device-code instructions to show the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCodePrompt {
    pub user_code: String,
    pub verification_uri: String,
    pub message: String,
    pub expires_in: Duration,
}

/// Host hooks for the parts of sign-in that need a human
pub trait Interaction: Send + Sync {
    /// Send the user to the authorization page
    fn open_authorization_url(&self, url: &Url);

    /// Show device-code instructions
    fn show_device_code(&self, prompt: &DeviceCodePrompt);

    /// Send the user to the provider's sign-out page
    fn open_logout_url(&self, _url: &Url) {}
}

/// Interaction that only logs; suitable for headless hosts
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingInteraction;

impl Interaction for TracingInteraction {
    fn open_authorization_url(&self, url: &Url) {
        info!("Open this URL to sign in: {url}");
    }

    fn show_device_code(&self, prompt: &DeviceCodePrompt) {
        info!(user_code = %prompt.user_code, "{}", prompt.message);
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OAuthError {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    expires_in: u64,
    #[serde(default = "default_poll_interval")]
    interval: u64,
    #[serde(default)]
    message: Option<String>,
}

const fn default_poll_interval() -> u64 {
    5
}

enum TokenReply {
    Issued(TokenResponse),
    Rejected(OAuthError),
}

struct CachedAccount {
    account: AzureAccount,
    refresh_token: Option<String>,
}

struct PendingRedirect {
    state: String,
    verifier: String,
    redirect_uri: Url,
}

/// Azure AD identity provider
pub struct AzureAdProvider {
    config: AzureConfig,
    http: reqwest::Client,
    interaction: Arc<dyn Interaction>,
    callback_timeout: Duration,
    cache: Mutex<HashMap<String, CachedAccount>>,
    pending: Mutex<Option<PendingRedirect>>,
    received: Mutex<Option<Url>>,
}

impl AzureAdProvider {
    /// Create a provider for the configured app registration
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Configuration`] when the client id is missing
    /// or the HTTP client cannot be built
    pub fn new(config: AzureConfig) -> Result<Self, ProviderError> {
        if config.client_id.trim().is_empty() {
            return Err(ProviderError::Configuration(
                "azure.client_id is not set".into(),
            ));
        }
        let http = reqwest::Client::builder()
            .user_agent(concat!("canvass-session/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProviderError::Configuration(e.to_string()))?;

        Ok(Self {
            config,
            http,
            interaction: Arc::new(TracingInteraction),
            callback_timeout: DEFAULT_CALLBACK_TIMEOUT,
            cache: Mutex::new(HashMap::new()),
            pending: Mutex::new(None),
            received: Mutex::new(None),
        })
    }

    /// Use host-specific interaction hooks
    #[must_use]
    pub fn with_interaction(mut self, interaction: Arc<dyn Interaction>) -> Self {
        self.interaction = interaction;
        self
    }

    /// How long an interactive redirect may take before falling back
    #[must_use]
    pub const fn with_callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout = timeout;
        self
    }

    fn endpoint(&self, name: &str) -> String {
        format!("{}/oauth2/v2.0/{name}", self.config.authority())
    }

    fn scope(&self) -> String {
        self.config.scopes.join(" ")
    }

    fn configured_redirect(&self) -> Result<Url, ProviderError> {
        Url::parse(&self.config.redirect_uri)
            .map_err(|e| ProviderError::Configuration(format!("azure.redirect_uri: {e}")))
    }

    fn authorization_url(
        &self,
        redirect_uri: &Url,
        challenge: &str,
        state: &str,
    ) -> Result<Url, ProviderError> {
        let scope = self.scope();
        Url::parse_with_params(
            &self.endpoint("authorize"),
            &[
                ("client_id", self.config.client_id.as_str()),
                ("response_type", "code"),
                ("response_mode", "query"),
                ("redirect_uri", redirect_uri.as_str()),
                ("scope", scope.as_str()),
                ("state", state),
                ("code_challenge", challenge),
                ("code_challenge_method", "S256"),
                ("prompt", "select_account"),
            ],
        )
        .map_err(|e| ProviderError::Configuration(format!("azure authority: {e}")))
    }

    /// Start a redirect login whose callback the host receives itself
    ///
    /// Send the user to the returned URL, hand the URL they are redirected to
    /// to [`AzureAdProvider::complete_redirect_url`], then call
    /// [`IdentityProvider::handle_redirect`].
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Configuration`] for an invalid redirect URI or authority
    pub fn begin_redirect(&self) -> Result<Url, ProviderError> {
        let redirect_uri = self.configured_redirect()?;
        let pkce = PkcePair::generate();
        let state = random_token(16);
        let url = self.authorization_url(&redirect_uri, &pkce.challenge, &state)?;
        *lock(&self.pending) = Some(PendingRedirect {
            state,
            verifier: pkce.verifier,
            redirect_uri,
        });
        Ok(url)
    }

    /// Record the URL the provider redirected the browser to
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Protocol`] if `url` does not parse
    pub fn complete_redirect_url(&self, url: &str) -> Result<(), ProviderError> {
        let url = Url::parse(url).map_err(|e| ProviderError::Protocol(format!("redirect URL: {e}")))?;
        *lock(&self.received) = Some(url);
        Ok(())
    }

    /// Provider sign-out page for the configured tenant
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Configuration`] for an invalid authority
    pub fn end_session_url(&self) -> Result<Url, ProviderError> {
        let mut url = Url::parse(&self.endpoint("logout"))
            .map_err(|e| ProviderError::Configuration(format!("azure authority: {e}")))?;
        if let Some(redirect) = &self.config.post_logout_redirect_uri {
            url.query_pairs_mut()
                .append_pair("post_logout_redirect_uri", redirect);
        }
        Ok(url)
    }

    async fn post_token(&self, form: &[(&str, &str)]) -> Result<TokenReply, ProviderError> {
        let response = self
            .http
            .post(self.endpoint("token"))
            .form(form)
            .send()
            .await?;
        read_token_reply(response).await
    }

    async fn redeem_code(
        &self,
        params: &HashMap<String, String>,
        expected_state: &str,
        verifier: &str,
        redirect_uri: &Url,
    ) -> Result<AuthenticationResult, ProviderError> {
        if let Some(error) = params.get("error") {
            return Err(map_oauth_error(&OAuthError {
                error: error.clone(),
                error_description: params.get("error_description").cloned(),
            }));
        }
        if params.get("state").map(String::as_str) != Some(expected_state) {
            return Err(ProviderError::Protocol("redirect state mismatch".into()));
        }
        let code = params
            .get("code")
            .ok_or_else(|| ProviderError::Protocol("redirect carries no code".into()))?;

        let scope = self.scope();
        let reply = self
            .post_token(&[
                ("grant_type", "authorization_code"),
                ("client_id", self.config.client_id.as_str()),
                ("code", code.as_str()),
                ("redirect_uri", redirect_uri.as_str()),
                ("code_verifier", verifier),
                ("scope", scope.as_str()),
            ])
            .await?;

        match reply {
            TokenReply::Issued(tokens) => self.accept(tokens, None),
            TokenReply::Rejected(error) => Err(map_oauth_error(&error)),
        }
    }

    /// Turn a token response into a result and update the account cache
    fn accept(
        &self,
        tokens: TokenResponse,
        previous: Option<&AzureAccount>,
    ) -> Result<AuthenticationResult, ProviderError> {
        let account = match tokens.id_token.as_deref().and_then(decode_claims) {
            Some(claims) => {
                let object_id = claims
                    .oid
                    .clone()
                    .or_else(|| claims.sub.clone())
                    .ok_or_else(|| ProviderError::Protocol("id token has no subject".into()))?;
                let tenant_id = claims
                    .tid
                    .clone()
                    .unwrap_or_else(|| self.config.tenant_id.clone());
                AzureAccount {
                    home_account_id: format!("{object_id}.{tenant_id}"),
                    local_account_id: object_id,
                    tenant_id,
                    username: claims.username().unwrap_or_default().to_string(),
                    name: claims.name.clone(),
                }
            }
            None => previous
                .cloned()
                .ok_or_else(|| ProviderError::Protocol("token response has no id token".into()))?,
        };

        {
            let mut cache = lock(&self.cache);
            let entry = cache
                .entry(account.home_account_id.clone())
                .or_insert_with(|| CachedAccount {
                    account: account.clone(),
                    refresh_token: None,
                });
            entry.account = account.clone();
            if tokens.refresh_token.is_some() {
                entry.refresh_token = tokens.refresh_token;
            }
        }

        let scopes = tokens.scope.map_or_else(
            || self.config.scopes.clone(),
            |scope| scope.split_whitespace().map(str::to_owned).collect(),
        );

        Ok(AuthenticationResult {
            account,
            access_token: tokens.access_token,
            id_token: tokens.id_token,
            expires_on: tokens
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
            scopes,
        })
    }
}

#[async_trait]
impl IdentityProvider for AzureAdProvider {
    #[instrument(skip(self))]
    async fn handle_redirect(&self) -> Result<Option<AuthenticationResult>, ProviderError> {
        let Some(received) = lock(&self.received).take() else {
            return Ok(None);
        };
        let Some(pending) = lock(&self.pending).take() else {
            warn!("Redirect received without a pending login; ignoring");
            return Ok(None);
        };

        let params: HashMap<String, String> = received.query_pairs().into_owned().collect();
        self.redeem_code(&params, &pending.state, &pending.verifier, &pending.redirect_uri)
            .await
            .map(Some)
    }

    async fn accounts(&self) -> Result<Vec<AzureAccount>, ProviderError> {
        Ok(lock(&self.cache)
            .values()
            .map(|cached| cached.account.clone())
            .collect())
    }

    #[instrument(skip(self))]
    async fn login_redirect(&self) -> Result<AuthenticationResult, ProviderError> {
        let configured = self.configured_redirect()?;
        if !is_loopback(&configured) {
            return Err(ProviderError::InteractionRequired(
                "redirect URI is not served by this client".into(),
            ));
        }

        let listener = LoopbackListener::bind(&configured).await?;
        let redirect_uri = listener.redirect_uri(&configured);
        let pkce = PkcePair::generate();
        let state = random_token(16);
        let url = self.authorization_url(&redirect_uri, &pkce.challenge, &state)?;

        self.interaction.open_authorization_url(&url);

        let params = tokio::time::timeout(self.callback_timeout, listener.wait_for_callback())
            .await
            .map_err(|_| {
                ProviderError::InteractionRequired("no redirect received from the browser".into())
            })??;

        self.redeem_code(&params, &state, &pkce.verifier, &redirect_uri)
            .await
    }

    #[instrument(skip(self))]
    async fn login_popup(&self) -> Result<AuthenticationResult, ProviderError> {
        let scope = self.scope();
        let response = self
            .http
            .post(self.endpoint("devicecode"))
            .form(&[("client_id", self.config.client_id.as_str()), ("scope", scope.as_str())])
            .send()
            .await?;

        if !response.status().is_success() {
            return match read_token_reply(response).await? {
                TokenReply::Rejected(error) => Err(map_oauth_error(&error)),
                TokenReply::Issued(_) => Err(ProviderError::Protocol(
                    "device code endpoint returned tokens".into(),
                )),
            };
        }

        let device: DeviceCodeResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Protocol(format!("device code response: {e}")))?;

        let expires_in = Duration::from_secs(device.expires_in);
        self.interaction.show_device_code(&DeviceCodePrompt {
            message: device.message.clone().unwrap_or_else(|| {
                format!(
                    "To sign in, open {} and enter the code {}",
                    device.verification_uri, device.user_code
                )
            }),
            user_code: device.user_code,
            verification_uri: device.verification_uri,
            expires_in,
        });

        let deadline = Instant::now() + expires_in;
        let mut interval = Duration::from_secs(device.interval);

        loop {
            tokio::time::sleep(interval).await;
            if Instant::now() > deadline {
                return Err(ProviderError::InteractionRequired(
                    "device code expired before sign-in completed".into(),
                ));
            }

            let reply = self
                .post_token(&[
                    ("grant_type", DEVICE_CODE_GRANT),
                    ("client_id", self.config.client_id.as_str()),
                    ("device_code", device.device_code.as_str()),
                ])
                .await?;

            match reply {
                TokenReply::Issued(tokens) => return self.accept(tokens, None),
                TokenReply::Rejected(error) => match error.error.as_str() {
                    "authorization_pending" => debug!("Waiting for device sign-in"),
                    "slow_down" => interval += SLOW_DOWN_STEP,
                    "expired_token" => {
                        return Err(ProviderError::InteractionRequired(
                            "device code expired before sign-in completed".into(),
                        ));
                    }
                    _ => return Err(map_oauth_error(&error)),
                },
            }
        }
    }

    #[instrument(skip(self, account), fields(account = %account.username))]
    async fn acquire_token_silent(
        &self,
        account: &AzureAccount,
    ) -> Result<AuthenticationResult, ProviderError> {
        let refresh_token = lock(&self.cache)
            .get(&account.home_account_id)
            .and_then(|cached| cached.refresh_token.clone())
            .ok_or_else(|| {
                ProviderError::InteractionRequired("no cached session for account".into())
            })?;

        let scope = self.scope();
        let reply = self
            .post_token(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.config.client_id.as_str()),
                ("refresh_token", refresh_token.as_str()),
                ("scope", scope.as_str()),
            ])
            .await?;

        match reply {
            TokenReply::Issued(tokens) => self.accept(tokens, Some(account)),
            TokenReply::Rejected(error) => {
                let mapped = map_oauth_error(&error);
                if mapped.is_interaction_required() {
                    if let Some(cached) = lock(&self.cache).get_mut(&account.home_account_id) {
                        cached.refresh_token = None;
                    }
                }
                Err(mapped)
            }
        }
    }

    #[instrument(skip(self, account))]
    async fn logout(&self, account: Option<&AzureAccount>) -> Result<(), ProviderError> {
        {
            let mut cache = lock(&self.cache);
            match account {
                Some(account) => {
                    cache.remove(&account.home_account_id);
                }
                None => cache.clear(),
            }
        }
        *lock(&self.pending) = None;
        self.interaction.open_logout_url(&self.end_session_url()?);
        Ok(())
    }
}

impl std::fmt::Debug for AzureAdProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureAdProvider")
            .field("authority", &self.config.authority())
            .field("client_id", &self.config.client_id)
            .finish_non_exhaustive()
    }
}

async fn read_token_reply(response: reqwest::Response) -> Result<TokenReply, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .map(TokenReply::Issued)
            .map_err(|e| ProviderError::Protocol(format!("token response: {e}")));
    }
    if status.is_server_error() {
        return Err(ProviderError::Network(format!(
            "identity provider returned {status}"
        )));
    }
    let body = response.text().await.unwrap_or_default();
    serde_json::from_str(&body)
        .map(TokenReply::Rejected)
        .map_err(|_| {
            ProviderError::Protocol(format!(
                "identity provider returned {status}: {}",
                redact_secrets(&body)
            ))
        })
}

fn map_oauth_error(error: &OAuthError) -> ProviderError {
    let description = redact_secrets(error.error_description.as_deref().unwrap_or(&error.error));
    match error.error.as_str() {
        "invalid_grant" | "interaction_required" | "login_required" | "consent_required" => {
            ProviderError::InteractionRequired(description)
        }
        "access_denied" | "authorization_declined" => ProviderError::Cancelled,
        other => ProviderError::Protocol(format!("{other}: {description}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> AzureAdProvider {
        AzureAdProvider::new(AzureConfig {
            client_id: "client-123".into(),
            tenant_id: "contoso".into(),
            post_logout_redirect_uri: Some("http://localhost:3000/".into()),
            ..AzureConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn requires_client_id() {
        let err = AzureAdProvider::new(AzureConfig::default()).unwrap_err();
        assert!(matches!(err, ProviderError::Configuration(_)));
    }

    #[test]
    fn authorization_url_carries_pkce_and_state() {
        let provider = provider();
        let url = provider.begin_redirect().unwrap();
        assert!(url.as_str().starts_with(
            "https://login.microsoftonline.com/contoso/oauth2/v2.0/authorize?"
        ));
        let params: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(params["client_id"], "client-123");
        assert_eq!(params["code_challenge_method"], "S256");
        assert_eq!(params["scope"], "openid profile email offline_access");
        let pending = lock(&provider.pending);
        assert_eq!(params["state"], pending.as_ref().unwrap().state);
    }

    #[test]
    fn end_session_url_includes_post_logout_redirect() {
        let url = provider().end_session_url().unwrap();
        assert_eq!(url.path(), "/contoso/oauth2/v2.0/logout");
        assert_eq!(
            url.query(),
            Some("post_logout_redirect_uri=http%3A%2F%2Flocalhost%3A3000%2F")
        );
    }

    #[test]
    fn oauth_errors_map_to_provider_errors() {
        let error = |code: &str| OAuthError {
            error: code.into(),
            error_description: Some("AADSTS70008: expired".into()),
        };
        assert!(map_oauth_error(&error("invalid_grant")).is_interaction_required());
        assert_eq!(map_oauth_error(&error("access_denied")), ProviderError::Cancelled);
        assert!(matches!(
            map_oauth_error(&error("invalid_client")),
            ProviderError::Protocol(_)
        ));
    }

    #[tokio::test]
    async fn redirect_without_pending_login_is_ignored() {
        let provider = provider();
        assert!(provider.handle_redirect().await.unwrap().is_none());

        provider
            .complete_redirect_url("http://localhost:53682/auth/callback?code=c&state=s")
            .unwrap();
        assert!(provider.handle_redirect().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn redirect_with_wrong_state_is_rejected() {
        let provider = provider();
        provider.begin_redirect().unwrap();
        provider
            .complete_redirect_url("http://localhost:53682/auth/callback?code=c&state=forged")
            .unwrap();
        let err = provider.handle_redirect().await.unwrap_err();
        assert_eq!(err, ProviderError::Protocol("redirect state mismatch".into()));
    }

    #[test]
    fn debug_names_client_and_authority() {
        let rendered = format!("{:?}", provider());
        assert!(rendered.contains("client-123"));
        assert!(rendered.contains("/contoso"));
    }
}
