//! Configuration management for the Canvass session client
//!
//! Values are layered: built-in defaults, then an optional file (TOML, YAML or
//! JSON), then `CANVASS__*` environment variables. Nested keys use a double
//! underscore, so `CANVASS__API__BASE_URL` overrides `api.base_url`.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "CANVASS";

/// Path appended to the WebSocket base for the notification stream
pub const NOTIFICATIONS_WS_PATH: &str = "/ws/notifications/";

/// Top-level client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanvassConfig {
    /// REST API configuration
    pub api: ApiConfig,

    /// Notification WebSocket configuration
    pub websocket: WebSocketConfig,

    /// Azure AD application registration
    pub azure: AzureConfig,

    /// Session lifetime and retry behaviour
    pub session: SessionConfig,

    /// Directory for the session mirror and log files
    pub storage_dir: PathBuf,
}

/// REST API configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the backend API, without a trailing slash
    pub base_url: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// User agent sent with every request
    pub user_agent: String,
}

/// Notification WebSocket configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Explicit WebSocket base (`wss://host`); derived from the API URL when unset
    pub base_url: Option<String>,

    /// Feature switch for the notification channel
    pub enabled: bool,

    /// Interval between heartbeat pings
    pub heartbeat_secs: u64,

    /// First reconnect delay; doubles on every attempt
    pub reconnect_base_ms: u64,

    /// Upper bound for a single reconnect delay
    pub reconnect_max_ms: u64,

    /// Reconnect attempts before giving up
    pub max_reconnect_attempts: u32,
}

/// Azure AD application registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AzureConfig {
    /// Application (client) id
    pub client_id: String,

    /// Directory (tenant) id, or `common`/`organizations`
    pub tenant_id: String,

    /// Authority host, e.g. `https://login.microsoftonline.com`
    pub authority_host: String,

    /// Redirect URI registered for the application
    pub redirect_uri: String,

    /// Where the provider sends the user after sign-out
    pub post_logout_redirect_uri: Option<String>,

    /// Scopes requested at sign-in
    pub scopes: Vec<String>,
}

/// Longest accepted idle timeout (one week)
pub const MAX_IDLE_TIMEOUT_MINUTES: u64 = 7 * 24 * 60;

/// Session lifetime and retry behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle time after which the session is forcibly ended
    pub timeout_minutes: u64,

    /// Consecutive failed logins before further attempts are refused
    pub max_login_attempts: u32,

    /// Manual retries allowed after a failed backend sync
    pub max_retries: u32,

    /// Base delay for the manual retry backoff
    pub retry_base_delay_ms: u64,

    /// Refresh interval used when the access token carries no expiry
    pub refresh_interval_secs: u64,

    /// Minimum gap between two failed silent refresh attempts
    pub refresh_backoff_secs: u64,
}

impl Default for CanvassConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            websocket: WebSocketConfig::default(),
            azure: AzureConfig::default(),
            session: SessionConfig::default(),
            storage_dir: default_storage_dir(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/api".to_string(),
            timeout_secs: 30,
            user_agent: concat!("canvass-client/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            enabled: true,
            heartbeat_secs: 30,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 30_000,
            max_reconnect_attempts: 5,
        }
    }
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            tenant_id: "common".to_string(),
            authority_host: "https://login.microsoftonline.com".to_string(),
            redirect_uri: "http://localhost:53682/auth/callback".to_string(),
            post_logout_redirect_uri: None,
            scopes: vec![
                "openid".to_string(),
                "profile".to_string(),
                "email".to_string(),
                "offline_access".to_string(),
            ],
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: 60,
            max_login_attempts: 5,
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            refresh_interval_secs: 240,
            refresh_backoff_secs: 60,
        }
    }
}

/// Default directory for client state
pub fn default_storage_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CANVASS_STATE_DIR") {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("canvass")
}

impl CanvassConfig {
    /// Load configuration from defaults, an optional file and the environment
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be parsed or a value has the wrong type
    pub fn load(path: Option<&Path>) -> CoreResult<Self> {
        let defaults = config::Config::try_from(&Self::default())?;
        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(" ")
                    .with_list_parse_key("azure.scopes"),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that serde cannot express
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] describing the first problem found
    pub fn validate(&self) -> CoreResult<()> {
        if self.api.base_url.trim().is_empty() {
            return Err(CoreError::invalid_config("api.base_url must not be empty"));
        }
        Url::parse(&self.api.base_url)
            .map_err(|e| CoreError::invalid_config(format!("api.base_url: {e}")))?;
        if self.api.timeout_secs == 0 {
            return Err(CoreError::invalid_config("api.timeout_secs must be positive"));
        }
        if self.session.timeout_minutes == 0 {
            return Err(CoreError::invalid_config(
                "session.timeout_minutes must be positive",
            ));
        }
        if self.session.timeout_minutes > MAX_IDLE_TIMEOUT_MINUTES {
            return Err(CoreError::invalid_config(format!(
                "session.timeout_minutes must be at most {MAX_IDLE_TIMEOUT_MINUTES}"
            )));
        }
        if self.websocket.enabled && self.websocket.heartbeat_secs == 0 {
            return Err(CoreError::invalid_config(
                "websocket.heartbeat_secs must be positive",
            ));
        }
        Ok(())
    }

    /// Notification endpoint, without the token query parameter
    ///
    /// # Errors
    ///
    /// Returns an error when neither the WebSocket base nor the API base is a valid URL
    pub fn notifications_url(&self) -> CoreResult<Url> {
        let base = match &self.websocket.base_url {
            Some(base) => Url::parse(base)
                .map_err(|e| CoreError::invalid_config(format!("websocket.base_url: {e}")))?,
            None => {
                let mut api = Url::parse(&self.api.base_url)
                    .map_err(|e| CoreError::invalid_config(format!("api.base_url: {e}")))?;
                let scheme = if api.scheme() == "https" { "wss" } else { "ws" };
                api.set_scheme(scheme).map_err(|()| {
                    CoreError::invalid_config("api.base_url cannot be mapped to a websocket URL")
                })?;
                api.set_path("");
                api.set_query(None);
                api
            }
        };

        let trimmed = base.as_str().trim_end_matches('/');
        Url::parse(&format!("{trimmed}{NOTIFICATIONS_WS_PATH}"))
            .map_err(|e| CoreError::invalid_config(format!("websocket url: {e}")))
    }
}

impl ApiConfig {
    /// Request timeout as a duration
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl WebSocketConfig {
    /// Heartbeat interval as a duration
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

impl SessionConfig {
    /// Idle threshold as a duration
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes.saturating_mul(60))
    }

    /// Fallback refresh interval as a duration
    pub const fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    /// Failed-refresh backoff window as a duration
    pub const fn refresh_backoff(&self) -> Duration {
        Duration::from_secs(self.refresh_backoff_secs)
    }
}

impl AzureConfig {
    /// Tenant-qualified authority, e.g. `https://login.microsoftonline.com/common`
    pub fn authority(&self) -> String {
        format!(
            "{}/{}",
            self.authority_host.trim_end_matches('/'),
            self.tenant_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = CanvassConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.session.timeout_minutes, 60);
        assert_eq!(config.websocket.max_reconnect_attempts, 5);
    }

    #[test]
    fn notifications_url_is_derived_from_api_base() {
        let mut config = CanvassConfig::default();
        config.api.base_url = "https://surveys.example.com/api".to_string();
        assert_eq!(
            config.notifications_url().unwrap().as_str(),
            "wss://surveys.example.com/ws/notifications/"
        );
    }

    #[test]
    fn explicit_websocket_base_wins() {
        let mut config = CanvassConfig::default();
        config.websocket.base_url = Some("ws://127.0.0.1:9000/".to_string());
        assert_eq!(
            config.notifications_url().unwrap().as_str(),
            "ws://127.0.0.1:9000/ws/notifications/"
        );
    }

    #[test]
    fn empty_base_url_is_rejected() {
        let mut config = CanvassConfig::default();
        config.api.base_url = "  ".to_string();
        assert!(matches!(
            config.validate(),
            Err(CoreError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn oversized_idle_timeout_is_rejected_and_saturates() {
        let mut config = CanvassConfig::default();
        config.session.timeout_minutes = MAX_IDLE_TIMEOUT_MINUTES;
        assert!(config.validate().is_ok());

        config.session.timeout_minutes = u64::MAX / 30;
        assert!(matches!(
            config.validate(),
            Err(CoreError::InvalidConfig { .. })
        ));
        assert_eq!(config.session.idle_timeout(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[api]\nbase_url = \"https://api.example.org\"\n\n[session]\ntimeout_minutes = 15"
        )
        .unwrap();

        let config = CanvassConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.api.base_url, "https://api.example.org");
        assert_eq!(config.session.timeout_minutes, 15);
        // Untouched values keep their defaults
        assert_eq!(config.session.max_retries, 3);
    }

    #[test]
    fn authority_joins_host_and_tenant() {
        let azure = AzureConfig {
            tenant_id: "contoso".to_string(),
            authority_host: "https://login.microsoftonline.com/".to_string(),
            ..AzureConfig::default()
        };
        assert_eq!(azure.authority(), "https://login.microsoftonline.com/contoso");
    }
}
