//! Identity provider abstraction
//!
//! The session service only talks to an [`IdentityProvider`]; the Azure AD
//! implementation lives in [`azure`], tests plug in their own.

pub mod azure;
mod loopback;
mod pkce;

pub use azure::{AzureAdProvider, DeviceCodePrompt, Interaction, TracingInteraction};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Signed-in identity-provider account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AzureAccount {
    /// `<object id>.<tenant id>`, stable across tenants
    pub home_account_id: String,
    pub local_account_id: String,
    pub tenant_id: String,
    pub username: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Tokens issued by a successful interactive or silent acquisition
#[derive(Clone)]
pub struct AuthenticationResult {
    pub account: AzureAccount,
    pub access_token: String,
    pub id_token: Option<String>,
    pub expires_on: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
}

impl std::fmt::Debug for AuthenticationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticationResult")
            .field("account", &self.account.username)
            .field("expires_on", &self.expires_on)
            .field("scopes", &self.scopes)
            .finish_non_exhaustive()
    }
}

/// Identity provider failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The user must interact (consent, MFA, expired session)
    #[error("Interaction required: {0}")]
    InteractionRequired(String),

    /// The provider could not be reached
    #[error("Network error: {0}")]
    Network(String),

    /// The user cancelled or declined the sign-in
    #[error("Sign-in was cancelled")]
    Cancelled,

    /// The provider answered with something we cannot use
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The client registration is incomplete or inconsistent
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ProviderError {
    /// Whether an interactive fallback could resolve the error
    pub const fn is_interaction_required(&self) -> bool {
        matches!(self, Self::InteractionRequired(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(canvass_core::redact_secrets(&err.to_string()))
    }
}

/// Operations the session service needs from an OAuth2/OIDC provider
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Complete a redirect-based login that is in flight, if any
    async fn handle_redirect(&self) -> Result<Option<AuthenticationResult>, ProviderError>;

    /// Accounts with a cached provider session
    async fn accounts(&self) -> Result<Vec<AzureAccount>, ProviderError>;

    /// Interactive login through a browser redirect
    async fn login_redirect(&self) -> Result<AuthenticationResult, ProviderError>;

    /// Interactive login that does not rely on a redirect back to this client
    async fn login_popup(&self) -> Result<AuthenticationResult, ProviderError>;

    /// Obtain fresh tokens for `account` without user interaction
    async fn acquire_token_silent(
        &self,
        account: &AzureAccount,
    ) -> Result<AuthenticationResult, ProviderError>;

    /// Forget the provider session of `account`, or of every account
    async fn logout(&self, account: Option<&AzureAccount>) -> Result<(), ProviderError>;
}

/// Provider for deployments that sign in with backend credentials only
///
/// Holds no accounts; interactive logins fail with a configuration error.
#[derive(Debug, Clone, Copy, Default)]
pub struct CredentialsOnly;

#[async_trait]
impl IdentityProvider for CredentialsOnly {
    async fn handle_redirect(&self) -> Result<Option<AuthenticationResult>, ProviderError> {
        Ok(None)
    }

    async fn accounts(&self) -> Result<Vec<AzureAccount>, ProviderError> {
        Ok(Vec::new())
    }

    async fn login_redirect(&self) -> Result<AuthenticationResult, ProviderError> {
        Err(not_configured())
    }

    async fn login_popup(&self) -> Result<AuthenticationResult, ProviderError> {
        Err(not_configured())
    }

    async fn acquire_token_silent(
        &self,
        _account: &AzureAccount,
    ) -> Result<AuthenticationResult, ProviderError> {
        Err(ProviderError::InteractionRequired(
            "no identity provider session".into(),
        ))
    }

    async fn logout(&self, _account: Option<&AzureAccount>) -> Result<(), ProviderError> {
        Ok(())
    }
}

fn not_configured() -> ProviderError {
    ProviderError::Configuration("Azure AD sign-in is not configured".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn credentials_only_has_no_interactive_login() {
        let provider = CredentialsOnly;
        assert!(provider.accounts().await.unwrap().is_empty());
        assert!(provider.handle_redirect().await.unwrap().is_none());
        assert!(matches!(
            provider.login_redirect().await,
            Err(ProviderError::Configuration(_))
        ));
    }
}
