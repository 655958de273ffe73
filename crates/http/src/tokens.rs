//! In-memory token store
//!
//! The access token lives only in process memory and is gone after logout or
//! restart. The refresh credential is normally an HttpOnly cookie held by the
//! client's cookie jar; a refresh token handed over in a response body is kept
//! as a legacy fallback.

use reqwest::header::HeaderValue;
use std::sync::RwLock;
use tracing::warn;

#[derive(Default)]
struct TokenState {
    access: Option<String>,
    legacy_refresh: Option<String>,
    authorization: Option<HeaderValue>,
}

/// Holder of the current access token and the default `Authorization` header
#[derive(Default)]
pub struct TokenStore {
    state: RwLock<TokenState>,
}

impl TokenStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store tokens and update the default `Authorization` header
    ///
    /// Passing `None` for `access` clears the access token and removes the
    /// header. A `refresh` value is stored as the legacy refresh token; `None`
    /// leaves the current one untouched.
    pub fn set_auth_tokens(&self, access: Option<&str>, refresh: Option<&str>) {
        let mut state = self.write();

        match access {
            Some(token) => match HeaderValue::from_str(&format!("Bearer {token}")) {
                Ok(mut value) => {
                    value.set_sensitive(true);
                    state.access = Some(token.to_string());
                    state.authorization = Some(value);
                }
                Err(_) => {
                    warn!("Rejected access token containing invalid header characters");
                    state.access = None;
                    state.authorization = None;
                }
            },
            None => {
                state.access = None;
                state.authorization = None;
            }
        }

        if let Some(refresh) = refresh {
            state.legacy_refresh = Some(refresh.to_string());
        }
    }

    /// Current access token
    pub fn access_token(&self) -> Option<String> {
        self.read().access.clone()
    }

    /// Refresh token received in a response body, if any
    pub fn legacy_refresh_token(&self) -> Option<String> {
        self.read().legacy_refresh.clone()
    }

    /// Default `Authorization` header value
    pub fn authorization_header(&self) -> Option<HeaderValue> {
        self.read().authorization.clone()
    }

    /// Whether there is anything a refresh could be based on
    pub fn has_credentials(&self) -> bool {
        let state = self.read();
        state.access.is_some() || state.legacy_refresh.is_some()
    }

    /// Drop every token
    pub fn clear(&self) {
        *self.write() = TokenState::default();
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, TokenState> {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, TokenState> {
        self.state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read();
        f.debug_struct("TokenStore")
            .field("has_access", &state.access.is_some())
            .field("has_legacy_refresh", &state.legacy_refresh.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setting_access_sets_bearer_header() {
        let store = TokenStore::new();
        store.set_auth_tokens(Some("abc"), None);

        assert_eq!(store.access_token().as_deref(), Some("abc"));
        assert_eq!(
            store.authorization_header().unwrap().to_str().unwrap(),
            "Bearer abc"
        );
    }

    #[test]
    fn clearing_access_removes_header_but_keeps_refresh() {
        let store = TokenStore::new();
        store.set_auth_tokens(Some("abc"), Some("r-1"));
        store.set_auth_tokens(None, None);

        assert!(store.access_token().is_none());
        assert!(store.authorization_header().is_none());
        assert_eq!(store.legacy_refresh_token().as_deref(), Some("r-1"));
        assert!(store.has_credentials());

        store.clear();
        assert!(!store.has_credentials());
    }

    #[test]
    fn invalid_token_is_not_stored() {
        let store = TokenStore::new();
        store.set_auth_tokens(Some("line\nbreak"), None);
        assert!(store.access_token().is_none());
        assert!(store.authorization_header().is_none());
    }

    #[test]
    fn debug_output_hides_tokens() {
        let store = TokenStore::new();
        store.set_auth_tokens(Some("super-secret"), None);
        assert!(!format!("{store:?}").contains("super-secret"));
    }
}
