//! CLI commands

use anyhow::{Context, Result, anyhow};
use canvass_core::{CanvassConfig, RetryPolicy};
use canvass_http::{ApiClient, ClientError};
use canvass_http::routes::RouteGuard;
use canvass_notify::{NotificationChannel, NotificationEvent};
use canvass_session::{
    AuthContext, AuthError, AuthService, AzureAdProvider, CredentialsOnly, FileStorage,
    IdentityProvider,
};
use clap::{Args, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::config;
use crate::console::{ConsoleInteraction, ConsoleNavigator};

const HEALTH_RETRY_DELAY: Duration = Duration::from_millis(250);

#[derive(Subcommand)]
pub enum Commands {
    /// Sign in and show the signed-in user
    Login {
        #[command(flatten)]
        credentials: Credentials,
    },

    /// Show backend health and the last signed-in user
    Status,

    /// Sign out and clear the local session mirror
    Logout,

    /// Sign in and print notifications as they arrive
    Notifications {
        #[command(flatten)]
        credentials: Credentials,

        /// Only receive these notification types (comma separated)
        #[arg(long, value_delimiter = ',')]
        types: Vec<String>,
    },

    /// Configuration file operations
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Write the default configuration file
    Generate {
        /// Output file path (defaults to <data-dir>/canvass.toml)
        output: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Backend credentials; Azure AD sign-in is used when no username is given
#[derive(Args, Debug)]
pub struct Credentials {
    /// Backend username
    #[arg(long)]
    username: Option<String>,

    /// Environment variable holding the password
    #[arg(long, default_value = "CANVASS_PASSWORD")]
    password_env: String,
}

impl Commands {
    pub async fn execute(self, config_path: Option<PathBuf>, data_dir: Option<PathBuf>) -> Result<()> {
        match self {
            Self::Config { command } => command.execute(data_dir),
            Self::Login { credentials } => {
                let session = Session::open(config_path, data_dir)?;
                let context = session.sign_in(&credentials).await?;
                print_user(&context);
                Ok(())
            }
            Self::Status => Session::open(config_path, data_dir)?.status().await,
            Self::Logout => {
                let session = Session::open(config_path, data_dir)?;
                session.restore().await;
                session.service.logout().await;
                println!("Signed out.");
                Ok(())
            }
            Self::Notifications { credentials, types } => {
                let session = Session::open(config_path, data_dir)?;
                session.sign_in(&credentials).await?;
                let outcome = session.follow_notifications(types).await;
                session.service.logout().await;
                outcome
            }
        }
    }
}

impl ConfigCommands {
    fn execute(self, data_dir: Option<PathBuf>) -> Result<()> {
        match self {
            Self::Generate { output, force } => {
                let path =
                    output.unwrap_or_else(|| config::data_dir(data_dir).join(config::CONFIG_FILE));
                config::generate_default_config(&path, force)?;
                println!("Configuration written to {}", path.display());
                Ok(())
            }
        }
    }
}

/// Wiring shared by the session commands
struct Session {
    config: CanvassConfig,
    api: ApiClient,
    service: AuthService,
}

impl Session {
    fn open(config_path: Option<PathBuf>, data_dir: Option<PathBuf>) -> Result<Self> {
        let config = config::load(config_path, data_dir)?;
        let api = ApiClient::from_config(&config).context("Failed to create API client")?;
        api.set_session_lost_handler(Arc::new(RouteGuard::new(Arc::new(ConsoleNavigator))));

        let provider: Arc<dyn IdentityProvider> = if config.azure.client_id.trim().is_empty() {
            info!("azure.client_id not set; only credential sign-in is available");
            Arc::new(CredentialsOnly)
        } else {
            Arc::new(
                AzureAdProvider::new(config.azure.clone())?
                    .with_interaction(Arc::new(ConsoleInteraction)),
            )
        };

        let service = AuthService::builder(api.clone(), provider)
            .settings(config.session.clone())
            .storage(Arc::new(FileStorage::new(&config.storage_dir)))
            .build();
        Ok(Self {
            config,
            api,
            service,
        })
    }

    /// Restore a provider session; failures leave the service able to sign in
    async fn restore(&self) {
        if let Err(e) = self.service.initialize().await {
            warn!("Session restore failed: {e}");
        }
    }

    async fn sign_in(&self, credentials: &Credentials) -> Result<AuthContext> {
        self.restore().await;
        if self.service.is_authenticated() {
            return Ok(self.service.snapshot());
        }

        let outcome = match &credentials.username {
            Some(username) => {
                let password = std::env::var(&credentials.password_env).with_context(|| {
                    format!("Set {} to the password for {username}", credentials.password_env)
                })?;
                self.service.login_with_credentials(username, &password).await
            }
            None => self.service.login().await,
        };
        outcome.map_err(|e| user_error(&e))
    }

    async fn status(&self) -> Result<()> {
        let probe = RetryPolicy::new(2, HEALTH_RETRY_DELAY, HEALTH_RETRY_DELAY * 4);
        let health = probe
            .run(|_| self.api.health_check(), ClientError::is_network)
            .await;
        match health {
            Ok(health) if health.is_healthy() => {
                println!("Backend:  {} ({})", self.api.base_url(), health.status);
            }
            Ok(health) => {
                println!("Backend:  {} (degraded: {})", self.api.base_url(), health.status);
            }
            Err(e) => println!("Backend:  {} (unreachable: {e})", self.api.base_url()),
        }

        self.restore().await;
        let context = self.service.snapshot();
        println!("Session:  {}", context.state);
        if let Some(error) = &context.error {
            println!("Error:    {error}");
        }
        if context.is_authenticated() {
            print_user(&context);
        } else if let Some(user) = self.service.cached_user() {
            println!("Last user: {} <{}>", user.display_name(), user.email);
        }
        Ok(())
    }

    async fn follow_notifications(&self, types: Vec<String>) -> Result<()> {
        let channel = NotificationChannel::new(&self.config, Arc::clone(self.api.tokens()))?;
        if !types.is_empty() {
            channel.subscribe_to_types(types);
        }
        let mut events = channel.events();
        let mut connection = channel.state();

        let (signed_in_tx, mut signed_in) = watch::channel(true);
        let _subscription = self.service.subscribe(move |context| {
            signed_in_tx.send_replace(context.is_authenticated());
        });

        channel.connect()?;
        eprintln!("Listening for notifications; press Ctrl-C to stop.");

        let outcome = loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    break signal.context("Failed to listen for Ctrl-C");
                }
                changed = signed_in.changed() => {
                    if changed.is_err() || !*signed_in.borrow() {
                        break Err(anyhow!("Session ended"));
                    }
                }
                changed = connection.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                    let state = connection.borrow_and_update().clone();
                    if !state.is_connected
                        && !state.is_connecting
                        && let Some(error) = state.connection_error
                    {
                        break Err(anyhow!(error));
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => print_event(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Notification output fell behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break Ok(()),
                },
            }
        };

        channel.disconnect().await;
        outcome
    }
}

fn user_error(err: &AuthError) -> anyhow::Error {
    anyhow!(err.user_message())
}

fn print_user(context: &AuthContext) {
    let Some(user) = &context.backend_user else {
        println!("Not signed in.");
        return;
    };
    println!("Signed in as {} <{}>", user.display_name(), user.email);
    if let Some(role) = &user.role {
        println!("  Role:       {role}");
    }
    if let Some(account) = &context.azure_account {
        println!("  Azure AD:   {}", account.username);
    }
    if let Some(profile) = &context.user_profile {
        if let Some(department) = &profile.department {
            println!("  Department: {department}");
        }
        if let Some(title) = &profile.job_title {
            println!("  Job title:  {title}");
        }
    }
}

fn print_event(event: &NotificationEvent) {
    match event {
        NotificationEvent::Received(notification) => {
            let kind = notification.notification_type.as_deref().unwrap_or("general");
            println!("[{kind}] {}: {}", notification.title, notification.message);
        }
        NotificationEvent::Bulk(notifications) => {
            println!("{} earlier notifications", notifications.len());
        }
        NotificationEvent::UnreadCount(count) => println!("Unread: {count}"),
        NotificationEvent::ServerError(message) => eprintln!("Server error: {message}"),
        NotificationEvent::MarkedRead { .. } | NotificationEvent::NewNotificationSignal => {}
    }
}
