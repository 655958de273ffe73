//! Wire messages of the notification socket
//!
//! Every frame is a JSON text frame with a `type` discriminator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Pong trigger telling the client a new notification is waiting
pub const NEW_NOTIFICATION_TRIGGER: &str = "new_notification";

/// A notification record as the server delivers it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub notification_type: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub action_url: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Notification {
        notification: Notification,
    },
    BulkNotifications {
        notifications: Vec<Notification>,
    },
    ConnectionSuccess {
        #[serde(default)]
        unread_count: u32,
        #[serde(default)]
        message: Option<String>,
    },
    UnreadCount {
        count: u32,
    },
    MarkReadResponse {
        success: bool,
        #[serde(default)]
        notification_id: Option<i64>,
        #[serde(default)]
        unread_count: Option<u32>,
    },
    Error {
        message: String,
    },
    Pong {
        #[serde(default)]
        trigger: Option<String>,
        #[serde(default)]
        timestamp: Option<i64>,
    },
}

impl InboundMessage {
    /// Whether this is a pong carrying the new-notification trigger
    pub fn signals_new_notification(&self) -> bool {
        matches!(self, Self::Pong { trigger: Some(t), .. } if t == NEW_NOTIFICATION_TRIGGER)
    }
}

/// Client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    MarkRead { notification_id: i64 },
    GetUnreadCount,
    SubscribeToTypes { notification_types: Vec<String> },
    Ping { timestamp: i64 },
}

impl OutboundMessage {
    /// Heartbeat stamped with the current time in milliseconds
    pub fn ping() -> Self {
        Self::Ping {
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// What the channel publishes to its subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationEvent {
    /// A single new notification
    Received(Notification),
    /// A batch, usually the backlog sent after connecting
    Bulk(Vec<Notification>),
    /// The unread count changed
    UnreadCount(u32),
    /// The server acknowledged a mark-read request
    MarkedRead {
        notification_id: Option<i64>,
        success: bool,
    },
    /// The server reported an error over the socket
    ServerError(String),
    /// The server hinted that new notifications are available
    NewNotificationSignal,
}
