//! Notification channel supervisor
//!
//! One background task owns the socket. It dials with the current access
//! token, pumps frames in both directions, sends heartbeats and reconnects
//! with exponential backoff after abnormal closes. Observers read connection
//! state from a watch channel and notifications from a broadcast channel.

use crate::error::{AUTH_CLOSE_CODES, ChannelError, ChannelResult, NORMAL_CLOSE};
use crate::message::{InboundMessage, NotificationEvent, OutboundMessage};
use canvass_core::{CanvassConfig, RetryPolicy, WebSocketConfig};
use canvass_http::TokenStore;
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_CAPACITY: usize = 64;

// Close code reported when the peer sent no status
const NO_STATUS: u16 = 1005;

/// Observable connection state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub is_connected: bool,
    pub is_connecting: bool,
    pub connection_error: Option<String>,
    pub unread_count: u32,
    /// Reconnect attempts since the last successful open
    pub reconnect_attempts: u32,
}

/// How a socket session ended
#[derive(Debug)]
enum SessionEnd {
    /// The client asked to disconnect
    Intentional,
    /// The server sent a close frame
    Closed(u16),
    /// Dial failure, transport error or a dropped connection
    Dropped(String),
}

struct Supervisor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Shared {
    settings: WebSocketConfig,
    endpoint: Url,
    tokens: Arc<TokenStore>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<NotificationEvent>,
    outbound: Mutex<Option<mpsc::UnboundedSender<OutboundMessage>>>,
    subscribed_types: Mutex<Vec<String>>,
    supervisor: Mutex<Option<Supervisor>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Real-time notification channel for the signed-in user
pub struct NotificationChannel {
    shared: Arc<Shared>,
}

impl NotificationChannel {
    /// Channel for the configured endpoint, authenticating with `tokens`
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::InvalidEndpoint`] when no WebSocket URL can be derived
    pub fn new(config: &CanvassConfig, tokens: Arc<TokenStore>) -> ChannelResult<Self> {
        let endpoint = config
            .notifications_url()
            .map_err(|e| ChannelError::InvalidEndpoint(e.to_string()))?;
        let (state, _) = watch::channel(ConnectionState::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            shared: Arc::new(Shared {
                settings: config.websocket.clone(),
                endpoint,
                tokens,
                state,
                events,
                outbound: Mutex::new(None),
                subscribed_types: Mutex::new(Vec::new()),
                supervisor: Mutex::new(None),
            }),
        })
    }

    /// Endpoint without the token parameter
    pub fn endpoint(&self) -> &Url {
        &self.shared.endpoint
    }

    /// Whether a connection may be attempted right now
    ///
    /// # Errors
    ///
    /// [`ChannelError::Disabled`] or [`ChannelError::MissingToken`]
    pub fn can_connect(&self) -> ChannelResult<()> {
        self.shared.authorized_url().map(|_| ())
    }

    /// Start the channel
    ///
    /// Returns once the supervisor is running; progress is visible through
    /// [`NotificationChannel::state`]. Calling it while already running is a
    /// no-op. Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails before any socket is opened when the channel is disabled or no
    /// access token is held.
    pub fn connect(&self) -> ChannelResult<()> {
        self.can_connect()?;

        let mut supervisor = lock(&self.shared.supervisor);
        if supervisor.as_ref().is_some_and(|s| !s.task.is_finished()) {
            debug!("Notification channel already running");
            return Ok(());
        }

        self.shared.state.send_modify(|state| {
            state.is_connecting = true;
            state.connection_error = None;
            state.reconnect_attempts = 0;
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervise(Arc::clone(&self.shared), cancel.clone()));
        *supervisor = Some(Supervisor { cancel, task });
        Ok(())
    }

    /// Close the socket with a normal close code and stop reconnecting
    pub async fn disconnect(&self) {
        let supervisor = lock(&self.shared.supervisor).take();
        if let Some(supervisor) = supervisor {
            supervisor.cancel.cancel();
            if let Err(e) = supervisor.task.await {
                warn!("Notification supervisor ended abnormally: {e}");
            }
        }
        self.shared.state.send_modify(|state| {
            state.is_connected = false;
            state.is_connecting = false;
        });
        info!("Notification channel disconnected");
    }

    /// Ask the server to mark a notification read
    ///
    /// # Errors
    ///
    /// [`ChannelError::NotConnected`] when no socket is open
    pub fn mark_read(&self, notification_id: i64) -> ChannelResult<()> {
        self.shared.send(OutboundMessage::MarkRead { notification_id })
    }

    /// Ask the server for the authoritative unread count
    ///
    /// # Errors
    ///
    /// [`ChannelError::NotConnected`] when no socket is open
    pub fn request_unread_count(&self) -> ChannelResult<()> {
        self.shared.send(OutboundMessage::GetUnreadCount)
    }

    /// Restrict delivery to the given notification types
    ///
    /// The filter is remembered and sent on every open, so it survives
    /// reconnects and may be set before connecting.
    pub fn subscribe_to_types(&self, notification_types: Vec<String>) {
        lock(&self.shared.subscribed_types).clone_from(&notification_types);
        if let Err(e) = self
            .shared
            .send(OutboundMessage::SubscribeToTypes { notification_types })
        {
            debug!("Type filter deferred until the next open: {e}");
        }
    }

    /// Watch connection state changes
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Current connection state
    pub fn current_state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    /// Current unread count
    pub fn unread_count(&self) -> u32 {
        self.shared.state.borrow().unread_count
    }

    /// Subscribe to notification events
    pub fn events(&self) -> broadcast::Receiver<NotificationEvent> {
        self.shared.events.subscribe()
    }
}

impl Drop for NotificationChannel {
    fn drop(&mut self) {
        if let Some(supervisor) = lock(&self.shared.supervisor).take() {
            supervisor.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for NotificationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationChannel")
            .field("endpoint", &self.shared.endpoint.as_str())
            .field("state", &*self.shared.state.borrow())
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.settings.max_reconnect_attempts,
            Duration::from_millis(self.settings.reconnect_base_ms),
            Duration::from_millis(self.settings.reconnect_max_ms),
        )
    }

    fn authorized_url(&self) -> ChannelResult<Url> {
        if !self.settings.enabled {
            return Err(ChannelError::Disabled);
        }
        let token = self
            .tokens
            .access_token()
            .filter(|token| !token.is_empty())
            .ok_or(ChannelError::MissingToken)?;
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair("token", &token);
        Ok(url)
    }

    fn send(&self, message: OutboundMessage) -> ChannelResult<()> {
        let outbound = lock(&self.outbound);
        let sender = outbound.as_ref().ok_or(ChannelError::NotConnected)?;
        sender.send(message).map_err(|_| ChannelError::NotConnected)
    }

    fn publish(&self, event: NotificationEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn set_unread(&self, count: u32) {
        self.state.send_modify(|state| state.unread_count = count);
        self.publish(NotificationEvent::UnreadCount(count));
    }

    fn dispatch(&self, text: &str) {
        let message = match serde_json::from_str::<InboundMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                debug!("Ignoring unrecognised notification frame: {e}");
                return;
            }
        };

        if message.signals_new_notification() {
            debug!("Server signalled new notifications");
            self.publish(NotificationEvent::NewNotificationSignal);
            if let Err(e) = self.send(OutboundMessage::GetUnreadCount) {
                debug!("Could not request unread count: {e}");
            }
            return;
        }

        match message {
            InboundMessage::Notification { notification } => {
                let mut count = 0;
                self.state.send_modify(|state| {
                    state.unread_count = state.unread_count.saturating_add(1);
                    count = state.unread_count;
                });
                debug!(id = notification.id, "Notification received");
                self.publish(NotificationEvent::Received(notification));
                self.publish(NotificationEvent::UnreadCount(count));
            }
            InboundMessage::BulkNotifications { notifications } => {
                debug!(count = notifications.len(), "Notification batch received");
                self.publish(NotificationEvent::Bulk(notifications));
            }
            InboundMessage::ConnectionSuccess { unread_count, .. } => {
                self.set_unread(unread_count);
            }
            InboundMessage::UnreadCount { count } => self.set_unread(count),
            InboundMessage::MarkReadResponse {
                success,
                notification_id,
                unread_count,
            } => {
                if success {
                    let count = unread_count
                        .unwrap_or_else(|| self.state.borrow().unread_count.saturating_sub(1));
                    self.set_unread(count);
                } else {
                    warn!(?notification_id, "Server refused to mark notification read");
                }
                self.publish(NotificationEvent::MarkedRead {
                    notification_id,
                    success,
                });
            }
            InboundMessage::Error { message } => {
                warn!("Notification server error: {message}");
                self.publish(NotificationEvent::ServerError(message));
            }
            InboundMessage::Pong { .. } => {}
        }
    }

    async fn run_session(&self, socket: Socket, cancel: &CancellationToken) -> SessionEnd {
        let (mut sink, mut source) = socket.split();
        let (sender, mut outbound) = mpsc::unbounded_channel();
        *lock(&self.outbound) = Some(sender);

        let types = lock(&self.subscribed_types).clone();
        if !types.is_empty()
            && let Err(e) = self.send(OutboundMessage::SubscribeToTypes {
                notification_types: types,
            })
        {
            debug!("Could not restore type filter: {e}");
        }

        let period = self.settings.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let end = loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "client disconnect".into(),
                    };
                    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                        debug!("Close frame not delivered: {e}");
                    }
                    break SessionEnd::Intentional;
                }
                _ = heartbeat.tick() => {
                    if let Err(end) = send_frame(&mut sink, &OutboundMessage::ping()).await {
                        break end;
                    }
                }
                Some(message) = outbound.recv() => {
                    if let Err(end) = send_frame(&mut sink, &message).await {
                        break end;
                    }
                }
                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.dispatch(&text),
                    Some(Ok(Message::Close(frame))) => {
                        break SessionEnd::Closed(frame.map_or(NO_STATUS, |f| u16::from(f.code)));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break SessionEnd::Dropped(e.to_string()),
                    None => break SessionEnd::Dropped("connection closed without a close frame".into()),
                },
            }
        };

        *lock(&self.outbound) = None;
        end
    }
}

async fn send_frame<S>(sink: &mut S, message: &OutboundMessage) -> Result<(), SessionEnd>
where
    S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let json =
        serde_json::to_string(message).map_err(|e| SessionEnd::Dropped(e.to_string()))?;
    sink.send(Message::Text(json.into()))
        .await
        .map_err(|e| SessionEnd::Dropped(e.to_string()))
}

async fn supervise(shared: Arc<Shared>, cancel: CancellationToken) {
    let policy = shared.reconnect_policy();
    let mut attempts = 0u32;

    loop {
        let url = match shared.authorized_url() {
            Ok(url) => url,
            Err(e) => {
                warn!("Notification channel cannot connect: {e}");
                shared.state.send_modify(|state| {
                    state.connection_error = Some(e.to_string());
                });
                break;
            }
        };

        shared.state.send_modify(|state| state.is_connecting = true);
        debug!(endpoint = %shared.endpoint, attempts, "Opening notification socket");

        let dialed = tokio::select! {
            () = cancel.cancelled() => break,
            dialed = connect_async(url.as_str()) => dialed,
        };

        let end = match dialed {
            Ok((socket, _)) => {
                attempts = 0;
                shared.state.send_modify(|state| {
                    state.is_connected = true;
                    state.is_connecting = false;
                    state.connection_error = None;
                    state.reconnect_attempts = 0;
                });
                info!(endpoint = %shared.endpoint, "Notification channel connected");
                shared.run_session(socket, &cancel).await
            }
            Err(e) => SessionEnd::Dropped(ChannelError::connect(&e).to_string()),
        };

        shared.state.send_modify(|state| {
            state.is_connected = false;
            state.is_connecting = false;
        });

        let reason = match end {
            SessionEnd::Intentional => break,
            SessionEnd::Closed(NORMAL_CLOSE) => {
                info!("Notification channel closed normally");
                break;
            }
            SessionEnd::Closed(code) if AUTH_CLOSE_CODES.contains(&code) => {
                let err = ChannelError::Unauthorized(code);
                warn!("{err}");
                shared.state.send_modify(|state| {
                    state.connection_error = Some(err.to_string());
                });
                break;
            }
            SessionEnd::Closed(code) => format!("closed with code {code}"),
            SessionEnd::Dropped(reason) => reason,
        };

        if !policy.allows(attempts) {
            let err = ChannelError::ReconnectExhausted(attempts);
            warn!("{err}");
            shared.state.send_modify(|state| {
                state.connection_error = Some(err.to_string());
            });
            break;
        }

        let delay = policy.delay_for(attempts);
        attempts += 1;
        warn!(
            attempt = attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Notification socket lost ({reason}); reconnecting"
        );
        shared.state.send_modify(|state| {
            state.connection_error = Some(reason);
            state.reconnect_attempts = attempts;
            state.is_connecting = true;
        });

        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    *lock(&shared.outbound) = None;
    shared.state.send_modify(|state| {
        state.is_connected = false;
        state.is_connecting = false;
    });
}
