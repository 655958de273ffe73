//! Canvass HTTP client
//!
//! Holds the in-memory token store, the silent-refresh policy and the API
//! client whose interceptor chain injects bearer credentials and replays a
//! request once after refreshing on `401 Unauthorized`.

pub mod client;
pub mod refresh;
pub mod routes;
pub mod tokens;
pub mod types;

pub use client::error::ClientError;
pub use client::{ApiClient, ApiClientBuilder, SessionLostHandler};
pub use refresh::{MAX_REFRESH_FAILURES, RefreshPolicy, RefreshSkip};
pub use routes::{NavigationDecision, Navigator, RouteGuard};
pub use tokens::TokenStore;
