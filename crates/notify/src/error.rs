use canvass_core::redact_secrets;
use thiserror::Error;

/// Close codes the server uses to reject the token
pub const AUTH_CLOSE_CODES: [u16; 2] = [4001, 4003];

/// Normal closure
pub const NORMAL_CLOSE: u16 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("Notification channel is disabled")]
    Disabled,

    #[error("No access token available; sign in first")]
    MissingToken,

    #[error("Invalid notification endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Notification channel is not connected")]
    NotConnected,

    #[error("WebSocket connection failed: {0}")]
    Connect(String),

    #[error("Notification channel rejected the session (close code {0})")]
    Unauthorized(u16),

    #[error("Unable to reconnect after {0} attempts")]
    ReconnectExhausted(u32),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ChannelError {
    /// Connection error with credentials stripped from the message
    pub fn connect(err: &tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Connect(redact_secrets(&err.to_string()))
    }
}

impl From<serde_json::Error> for ChannelError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type ChannelResult<T> = Result<T, ChannelError>;
