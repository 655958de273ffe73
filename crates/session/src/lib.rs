//! Canvass session management
//!
//! [`AuthService`] signs users in through an [`IdentityProvider`], exchanges
//! the provider tokens for a backend session and keeps the shared
//! [`AuthContext`] up to date for subscribers.

pub mod claims;
pub mod context;
pub mod error;
pub mod provider;
pub mod service;
pub mod storage;

pub use context::{AuthContext, AuthState, ContextStore, Subscription};
pub use error::{AuthError, SyncStep};
pub use provider::{
    AuthenticationResult, AzureAccount, AzureAdProvider, CredentialsOnly, DeviceCodePrompt,
    IdentityProvider, Interaction, ProviderError, TracingInteraction,
};
pub use service::{AuthService, AuthServiceBuilder, REFRESH_LEAD};
pub use storage::{FileStorage, MemoryStorage, SessionStorage};

use std::sync::{Mutex, MutexGuard, PoisonError};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
