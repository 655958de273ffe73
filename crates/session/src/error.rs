//! Session service errors

use crate::provider::ProviderError;
use canvass_core::{CoreError, redact_secrets};
use canvass_http::ClientError;
use thiserror::Error;

/// Backend sync step that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStep {
    TokenExchange,
    HealthCheck,
    CurrentUser,
}

impl std::fmt::Display for SyncStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::TokenExchange => "token exchange",
            Self::HealthCheck => "health check",
            Self::CurrentUser => "user lookup",
        })
    }
}

/// Session service error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Backend {step} failed: {message}")]
    Backend {
        step: SyncStep,
        message: String,
        /// No response reached us; retrying may help
        network: bool,
    },

    #[error("Too many failed sign-in attempts ({attempts})")]
    TooManyAttempts { attempts: u32 },

    #[error("Retry limit of {max} reached")]
    RetriesExhausted { max: u32 },

    #[error("Not signed in")]
    NotAuthenticated,

    #[error("Sign-in already in progress")]
    SignInInProgress,

    #[error("Session refresh failed")]
    RefreshFailed,

    #[error(transparent)]
    Storage(#[from] CoreError),
}

impl AuthError {
    pub(crate) fn backend(step: SyncStep, err: &ClientError) -> Self {
        Self::Backend {
            step,
            message: redact_secrets(&err.to_string()),
            network: err.is_network() || err.status().is_some_and(|s| s >= 500),
        }
    }

    /// Whether [`crate::AuthService::retry`] can be expected to help
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Provider(ProviderError::Network(_)) => true,
            Self::Backend { network, .. } => *network,
            _ => false,
        }
    }

    /// Single redacted sentence suitable for showing to the user
    pub fn user_message(&self) -> String {
        let message = match self {
            Self::Provider(ProviderError::InteractionRequired(_)) => {
                "Your sign-in needs attention. Please sign in again.".to_string()
            }
            Self::Provider(ProviderError::Network(_)) => {
                "Could not reach the sign-in service. Check your connection and retry.".to_string()
            }
            Self::Provider(ProviderError::Cancelled) => "Sign-in was cancelled.".to_string(),
            Self::Provider(err) => format!("Sign-in failed: {err}"),
            Self::Backend { network: true, .. } => {
                "The server could not be reached. Please retry in a moment.".to_string()
            }
            Self::Backend { step, message, .. } => {
                format!("Could not complete sign-in ({step}): {message}")
            }
            Self::TooManyAttempts { .. } => {
                "Too many failed sign-in attempts. Please wait before trying again.".to_string()
            }
            Self::RetriesExhausted { .. } => {
                "Sign-in is still failing after several retries. Please sign in again.".to_string()
            }
            Self::NotAuthenticated => "You are not signed in.".to_string(),
            Self::SignInInProgress => {
                "A sign-in is already in progress. Please wait for it to finish.".to_string()
            }
            Self::RefreshFailed => "Your session has expired. Please sign in again.".to_string(),
            Self::Storage(err) => format!("Could not save session data: {err}"),
        };
        redact_secrets(&message)
    }
}
