//! Route rules applied when the session is lost
//!
//! Public survey pages must stay reachable for anonymous respondents, so a
//! failed refresh never navigates away from them.

use std::sync::Arc;
use tracing::{debug, info};
use url::form_urlencoded;

/// Login route used for redirects
pub const LOGIN_PATH: &str = "/login";

/// Route prefixes that never require a session
pub const PUBLIC_SURVEY_PREFIXES: &[&str] = &["/survey/public/", "/survey/password/"];

/// Whether `path` is a public survey route
pub fn is_public_survey_path(path: &str) -> bool {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    PUBLIC_SURVEY_PREFIXES
        .iter()
        .any(|prefix| path.starts_with(prefix) || path == prefix.trim_end_matches('/'))
}

/// `/login?redirect=<destination>`
pub fn login_redirect(destination: &str) -> String {
    let query: String = form_urlencoded::Serializer::new(String::new())
        .append_pair("redirect", destination)
        .finish();
    format!("{LOGIN_PATH}?{query}")
}

/// Outcome of an authentication failure for the current route
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationDecision {
    /// Leave the user where they are
    Stay,
    /// Send the user to the login page, preserving the destination
    RedirectToLogin(String),
}

/// Host-side navigation hook (router, window, CLI prompt)
pub trait Navigator: Send + Sync {
    /// Path the user is currently on
    fn current_path(&self) -> String;

    /// Move the user to `target`
    fn navigate(&self, target: &str);
}

/// Applies the route rules through a [`Navigator`]
#[derive(Clone)]
pub struct RouteGuard {
    navigator: Arc<dyn Navigator>,
}

impl RouteGuard {
    /// Create a guard for the given navigator
    pub fn new(navigator: Arc<dyn Navigator>) -> Self {
        Self { navigator }
    }

    /// Decision for a lost session at `current_path`
    pub fn decide(current_path: &str) -> NavigationDecision {
        if is_public_survey_path(current_path) || current_path.starts_with(LOGIN_PATH) {
            NavigationDecision::Stay
        } else {
            NavigationDecision::RedirectToLogin(login_redirect(current_path))
        }
    }

    /// Decision for entering `path` with or without a session
    pub fn check_access(path: &str, authenticated: bool) -> NavigationDecision {
        if authenticated {
            NavigationDecision::Stay
        } else {
            Self::decide(path)
        }
    }

    /// React to a lost session on the navigator's current route
    pub fn handle_session_lost(&self) -> NavigationDecision {
        let current = self.navigator.current_path();
        let decision = Self::decide(&current);
        match &decision {
            NavigationDecision::Stay => {
                debug!(path = %current, "Session lost on a public route; staying");
            }
            NavigationDecision::RedirectToLogin(target) => {
                info!(from = %current, "Session lost; redirecting to login");
                self.navigator.navigate(target);
            }
        }
        decision
    }
}

impl std::fmt::Debug for RouteGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteGuard").finish_non_exhaustive()
    }
}

impl crate::client::SessionLostHandler for RouteGuard {
    fn on_session_lost(&self) {
        self.handle_session_lost();
    }
}
