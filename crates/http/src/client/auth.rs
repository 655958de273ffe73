//! Authentication and account API client methods

use super::{ApiClient, ClientError};
use crate::types::{
    AzureTokenExchange, BackendUser, CredentialsLogin, HealthStatus, LoginResponse, UserProfile,
};
use reqwest::Method;
use reqwest::header::AUTHORIZATION;
use serde_json::Value;
use tracing::instrument;

/// Backend API paths, relative to the configured base URL
pub mod endpoints {
    pub const HEALTH: &str = "/health/";
    pub const AZURE_LOGIN: &str = "/auth/azure/login/";
    pub const TOKEN_OBTAIN: &str = "/auth/token/";
    pub const TOKEN_REFRESH: &str = "/auth/token/refresh/";
    pub const CURRENT_USER: &str = "/auth/user/";
    pub const USER_PROFILE: &str = "/users/profile/";
    pub const LOGOUT: &str = "/auth/logout/";
    pub const PUBLIC_SURVEY: &str = "/survey/public/";
}

impl ApiClient {
    /// Check that the backend is reachable and healthy
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<HealthStatus, ClientError> {
        let request = self.request(Method::GET, endpoints::HEALTH);
        self.execute_public(request).await
    }

    /// Exchange identity-provider tokens for a backend session
    #[instrument(skip_all)]
    pub async fn exchange_azure_token(
        &self,
        exchange: &AzureTokenExchange,
    ) -> Result<LoginResponse, ClientError> {
        let request = self.request(Method::POST, endpoints::AZURE_LOGIN).json(exchange);
        self.execute_public(request).await
    }

    /// Log in with a username and password (JWT path)
    #[instrument(skip(self, password))]
    pub async fn login_with_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<LoginResponse, ClientError> {
        let request = self
            .request(Method::POST, endpoints::TOKEN_OBTAIN)
            .json(&CredentialsLogin {
                username: username.to_string(),
                password: password.to_string(),
            });
        self.execute_public(request).await
    }

    /// Get the user the current access token belongs to
    #[instrument(skip(self))]
    pub async fn fetch_current_user(&self) -> Result<BackendUser, ClientError> {
        let request = self.request(Method::GET, endpoints::CURRENT_USER);
        self.execute(request).await
    }

    /// Get the extended profile of the current user
    #[instrument(skip(self))]
    pub async fn fetch_user_profile(&self) -> Result<UserProfile, ClientError> {
        let request = self.request(Method::GET, endpoints::USER_PROFILE);
        self.execute(request).await
    }

    /// End the backend session and clear the refresh cookie
    ///
    /// Bypasses refresh-on-401: an expired session is already logged out.
    #[instrument(skip(self))]
    pub async fn logout_backend(&self) -> Result<(), ClientError> {
        let mut request = self.request(Method::POST, endpoints::LOGOUT);
        if let Some(value) = self.tokens().authorization_header() {
            request = request.header(AUTHORIZATION, value);
        }
        match Self::check(request.send().await?).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_auth_expired() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Load a public survey; works without a session
    #[instrument(skip(self))]
    pub async fn fetch_public_survey(&self, survey_id: &str) -> Result<Value, ClientError> {
        let path = format!("{}{survey_id}/", endpoints::PUBLIC_SURVEY);
        let request = self.request(Method::GET, &path);
        self.execute_public(request).await
    }
}
