//! Real-time notification channel for Canvass
//!
//! A single authenticated WebSocket per signed-in user, with heartbeat,
//! exponential-backoff reconnection and unread-count tracking.

pub mod channel;
pub mod error;
pub mod message;

pub use channel::{ConnectionState, NotificationChannel};
pub use error::{ChannelError, ChannelResult};
pub use message::{InboundMessage, Notification, NotificationEvent, OutboundMessage};
