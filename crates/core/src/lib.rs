//! Canvass core types and utilities

pub mod config;
pub mod error;
pub mod redact;
pub mod retry;
pub mod single_flight;

pub use config::{ApiConfig, AzureConfig, CanvassConfig, SessionConfig, WebSocketConfig};
pub use error::{CoreError, CoreResult};
pub use redact::redact_secrets;
pub use retry::RetryPolicy;
pub use single_flight::SingleFlight;
