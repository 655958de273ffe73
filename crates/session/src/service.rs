//! Authentication service
//!
//! Owns the [`ContextStore`] and drives it through the auth state machine:
//! provider sign-in, backend sync, scheduled token refresh and the idle
//! timeout. Initialization and login each run as a single flight, so
//! overlapping calls share one execution. Interactive and credential
//! sign-ins share the same flight.

use crate::claims;
use crate::context::{AuthContext, AuthState, ContextStore, Subscription};
use crate::error::{AuthError, SyncStep};
use crate::lock;
use crate::provider::{AuthenticationResult, IdentityProvider};
use crate::storage::{MemoryStorage, PROFILE_KEY, SessionStorage, USER_KEY};
use canvass_core::{CoreResult, RetryPolicy, SessionConfig, SingleFlight, redact_secrets};
use canvass_http::ApiClient;
use canvass_http::routes::{NavigationDecision, RouteGuard};
use canvass_http::types::{AzureTokenExchange, BackendUser, LoginResponse, UserProfile};
use chrono::Utc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Refresh this long before the access token expires
pub const REFRESH_LEAD: Duration = Duration::from_secs(60);

/// Floor for the refresh timer, for tokens that are already close to expiry
const MIN_REFRESH_DELAY: Duration = Duration::from_secs(5);

/// Upper bound for a single manual-retry delay
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

type Flight = SingleFlight<Result<AuthContext, AuthError>>;

struct Inner {
    settings: SessionConfig,
    idle_timeout: Duration,
    api: ApiClient,
    provider: Arc<dyn IdentityProvider>,
    storage: Arc<dyn SessionStorage>,
    context: Arc<ContextStore>,
    init_flight: Flight,
    login_flight: Flight,
    failed_logins: AtomicU32,
    retries: AtomicU32,
    last_activity: Mutex<Instant>,
    timers: Mutex<Option<CancellationToken>>,
}

/// Session service
///
/// Cloning is cheap; clones drive the same session.
#[derive(Clone)]
pub struct AuthService {
    inner: Arc<Inner>,
}

impl AuthService {
    /// Start building a service around an API client and identity provider
    pub fn builder(api: ApiClient, provider: Arc<dyn IdentityProvider>) -> AuthServiceBuilder {
        AuthServiceBuilder {
            api,
            provider,
            settings: SessionConfig::default(),
            storage: None,
            idle_timeout: None,
        }
    }

    /// API client whose tokens this service manages
    pub fn api(&self) -> &ApiClient {
        &self.inner.api
    }

    /// Copy of the current auth context
    pub fn snapshot(&self) -> AuthContext {
        self.inner.context.snapshot()
    }

    /// Current state
    pub fn state(&self) -> AuthState {
        self.inner.context.state()
    }

    /// Signed in with a backend user
    pub fn is_authenticated(&self) -> bool {
        self.snapshot().is_authenticated()
    }

    /// Observe every context change; keep the handle to stay subscribed
    ///
    /// Listeners may call back into the service, for example
    /// [`AuthService::record_activity`]; the resulting change is delivered
    /// after the current one.
    pub fn subscribe(
        &self,
        listener: impl Fn(&AuthContext) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.context.subscribe(listener)
    }

    /// Route decision for entering `path` with the current session
    pub fn guard(&self, path: &str) -> NavigationDecision {
        RouteGuard::check_access(path, self.is_authenticated())
    }

    /// Reset the idle timer
    pub fn record_activity(&self) {
        *lock(&self.inner.last_activity) = Instant::now();
        self.inner.context.update(|ctx| ctx.last_activity = Utc::now());
    }

    /// Mirrored user from a previous session, if any
    pub fn cached_user(&self) -> Option<BackendUser> {
        match self.inner.storage.get(USER_KEY) {
            Ok(Some(raw)) => serde_json::from_str(&raw)
                .map_err(|e| warn!("Ignoring unreadable session mirror: {e}"))
                .ok(),
            Ok(None) => None,
            Err(e) => {
                warn!("Could not read session mirror: {e}");
                None
            }
        }
    }

    /// Restore a provider session, once
    ///
    /// Completes a pending redirect login if there is one, otherwise tries
    /// a silent sign-in with a cached account. Calls made while this runs
    /// share its result; later calls return the current snapshot.
    ///
    /// # Errors
    ///
    /// Returns the provider or backend failure that moved the session to `FAILED`
    pub async fn initialize(&self) -> Result<AuthContext, AuthError> {
        if !matches!(
            self.state(),
            AuthState::Uninitialized | AuthState::Initializing
        ) {
            return Ok(self.snapshot());
        }
        let service = self.clone();
        self.inner
            .init_flight
            .run(move || async move { service.run_initialize(AuthState::Uninitialized).await })
            .await
    }

    /// Interactive sign-in through the identity provider
    ///
    /// Tries the redirect flow first and falls back to the popup flow once
    /// when the provider requires interaction.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::TooManyAttempts`] after too many consecutive
    /// failures, otherwise the provider or backend failure
    pub async fn login(&self) -> Result<AuthContext, AuthError> {
        let service = self.clone();
        self.inner
            .login_flight
            .run(move || async move { service.run_login().await })
            .await
    }

    /// Sign in with backend credentials instead of the identity provider
    ///
    /// A call made while another sign-in runs gets that sign-in's outcome.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::TooManyAttempts`] after too many consecutive
    /// failures, otherwise the backend failure
    #[instrument(skip(self, password))]
    pub async fn login_with_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<AuthContext, AuthError> {
        let service = self.clone();
        let (username, password) = (username.to_owned(), password.to_owned());
        self.inner
            .login_flight
            .run(move || async move { service.run_credential_login(&username, &password).await })
            .await
    }

    async fn run_credential_login(
        &self,
        username: &str,
        password: &str,
    ) -> Result<AuthContext, AuthError> {
        self.check_login_attempts()?;
        if let Some(current) = self.begin_authentication().await? {
            return Ok(current);
        }

        let outcome = match self.inner.api.login_with_credentials(username, password).await {
            Ok(login) => {
                if self.inner.context.transition(AuthState::BackendSync, |ctx| {
                    ctx.azure_account = None;
                }) {
                    self.finish_sync(login).await
                } else {
                    Err(AuthError::NotAuthenticated)
                }
            }
            Err(e) => self.fail(AuthError::backend(SyncStep::TokenExchange, &e)),
        };
        self.count_login(&outcome);
        outcome
    }

    /// Retry after a failure, waiting `base × 2^attempt` first
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::RetriesExhausted`] once `max_retries` retries
    /// have been used, otherwise the failure of this attempt
    #[instrument(skip(self))]
    pub async fn retry(&self) -> Result<AuthContext, AuthError> {
        if self.state() != AuthState::Failed {
            return Ok(self.snapshot());
        }

        let settings = &self.inner.settings;
        let policy = RetryPolicy::new(
            settings.max_retries,
            Duration::from_millis(settings.retry_base_delay_ms),
            MAX_RETRY_DELAY,
        );
        let attempt = self.inner.retries.fetch_add(1, Ordering::SeqCst);
        if !policy.allows(attempt) {
            self.inner.retries.fetch_sub(1, Ordering::SeqCst);
            let err = AuthError::RetriesExhausted {
                max: settings.max_retries,
            };
            let message = err.user_message();
            self.inner.context.update(|ctx| ctx.error = Some(message));
            return Err(err);
        }

        let delay = policy.delay_for(attempt);
        debug!(
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Retrying sign-in"
        );
        tokio::time::sleep(delay).await;

        let service = self.clone();
        self.inner
            .init_flight
            .run(move || async move { service.run_initialize(AuthState::Failed).await })
            .await
    }

    /// Sign out everywhere and return to `UNAUTHENTICATED`
    #[instrument(skip(self))]
    pub async fn logout(&self) {
        self.end_session(None).await;
    }

    /// Renew the access token through the backend refresh endpoint
    ///
    /// A failed refresh ends the session.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::NotAuthenticated`] outside an authenticated
    /// session and [`AuthError::RefreshFailed`] when the refresh fails
    #[instrument(skip(self))]
    pub async fn refresh_session(&self) -> Result<(), AuthError> {
        if !self
            .inner
            .context
            .transition(AuthState::TokenRefresh, |_| {})
        {
            return Err(AuthError::NotAuthenticated);
        }

        if self.inner.api.silent_refresh_access_token().await.is_some() {
            self.inner
                .context
                .transition(AuthState::Authenticated, |ctx| ctx.error = None);
            Ok(())
        } else {
            warn!("Scheduled token refresh failed; ending session");
            self.end_session(Some(AuthError::RefreshFailed)).await;
            Err(AuthError::RefreshFailed)
        }
    }

    async fn run_initialize(&self, from: AuthState) -> Result<AuthContext, AuthError> {
        if self.state() != from
            || !self.inner.context.transition(AuthState::Initializing, |ctx| {
                ctx.error = None;
            })
        {
            return Ok(self.snapshot());
        }

        match self.inner.provider.handle_redirect().await {
            Ok(Some(result)) => return self.complete_login(result).await,
            Ok(None) => {}
            Err(e) => return self.fail(e.into()),
        }

        let accounts = match self.inner.provider.accounts().await {
            Ok(accounts) => accounts,
            Err(e) => return self.fail(e.into()),
        };
        let Some(account) = accounts.into_iter().next() else {
            debug!("No cached identity-provider account");
            self.inner
                .context
                .transition(AuthState::Unauthenticated, clear_identity);
            return Ok(self.snapshot());
        };

        match self.inner.provider.acquire_token_silent(&account).await {
            Ok(result) => self.complete_login(result).await,
            Err(e) if e.is_interaction_required() => {
                info!(account = %account.username, "Cached session needs interaction");
                self.inner
                    .context
                    .transition(AuthState::Unauthenticated, clear_identity);
                Ok(self.snapshot())
            }
            Err(e) => self.fail(e.into()),
        }
    }

    async fn run_login(&self) -> Result<AuthContext, AuthError> {
        self.check_login_attempts()?;
        if let Some(current) = self.begin_authentication().await? {
            return Ok(current);
        }

        let provider = &self.inner.provider;
        let result = match provider.login_redirect().await {
            Err(e) if e.is_interaction_required() => {
                info!("Redirect sign-in needs interaction; falling back to popup");
                provider.login_popup().await
            }
            other => other,
        };

        let outcome = match result {
            Ok(result) => self.complete_login(result).await,
            Err(e) => self.fail(e.into()),
        };
        self.count_login(&outcome);
        outcome
    }

    fn check_login_attempts(&self) -> Result<(), AuthError> {
        let attempts = self.inner.failed_logins.load(Ordering::SeqCst);
        if attempts >= self.inner.settings.max_login_attempts {
            let err = AuthError::TooManyAttempts { attempts };
            let message = err.user_message();
            self.inner.context.update(|ctx| ctx.error = Some(message));
            return Err(err);
        }
        Ok(())
    }

    fn count_login(&self, outcome: &Result<AuthContext, AuthError>) {
        match outcome {
            Ok(ctx) if ctx.is_authenticated() => self.inner.failed_logins.store(0, Ordering::SeqCst),
            Ok(_) => {}
            Err(_) => {
                self.inner.failed_logins.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// Enter `AUTHENTICATING`; returns the snapshot instead when already signed in
    async fn begin_authentication(&self) -> Result<Option<AuthContext>, AuthError> {
        if self.state() == AuthState::Initializing {
            let _ = self.initialize().await;
        }
        let current = self.snapshot();
        if current.is_authenticated() {
            return Ok(Some(current));
        }
        if self
            .inner
            .context
            .transition(AuthState::Authenticating, |ctx| ctx.error = None)
        {
            Ok(None)
        } else {
            debug!(state = %current.state, "Sign-in refused while another operation runs");
            Err(AuthError::SignInInProgress)
        }
    }

    /// Provider sign-in succeeded: sync with the backend
    async fn complete_login(&self, result: AuthenticationResult) -> Result<AuthContext, AuthError> {
        let account = result.account.clone();
        if !self.inner.context.transition(AuthState::BackendSync, |ctx| {
            ctx.azure_account = Some(account);
            ctx.error = None;
        }) {
            return Ok(self.snapshot());
        }

        let exchange = AzureTokenExchange {
            access_token: result.access_token,
            id_token: result.id_token,
        };
        match self.inner.api.exchange_azure_token(&exchange).await {
            Ok(login) => self.finish_sync(login).await,
            Err(e) => self.fail(AuthError::backend(SyncStep::TokenExchange, &e)),
        }
    }

    /// Install backend tokens, then health check, user and profile
    async fn finish_sync(&self, login: LoginResponse) -> Result<AuthContext, AuthError> {
        let api = &self.inner.api;
        api.set_auth_tokens(Some(&login.tokens.access), login.tokens.refresh.as_deref());
        api.refresh_policy().reset_after_login();

        let (user, profile) = match self.load_session().await {
            Ok(loaded) => loaded,
            Err(e) => {
                api.set_auth_tokens(None, None);
                api.tokens().clear();
                return self.fail(e);
            }
        };

        if let Err(e) = self.write_mirror(&user, profile.as_ref()) {
            warn!("Could not write session mirror: {e}");
        }

        self.inner.retries.store(0, Ordering::SeqCst);
        *lock(&self.inner.last_activity) = Instant::now();
        info!(user = %user.username, "Signed in");

        self.inner.context.transition(AuthState::Authenticated, |ctx| {
            ctx.backend_user = Some(user);
            ctx.user_profile = profile;
            ctx.error = None;
        });
        self.start_timers(&login.tokens.access);
        Ok(self.snapshot())
    }

    async fn load_session(&self) -> Result<(BackendUser, Option<UserProfile>), AuthError> {
        let api = &self.inner.api;

        let health = api
            .health_check()
            .await
            .map_err(|e| AuthError::backend(SyncStep::HealthCheck, &e))?;
        if !health.is_healthy() {
            return Err(AuthError::Backend {
                step: SyncStep::HealthCheck,
                message: format!("backend reports status {}", health.status),
                network: true,
            });
        }

        let user = api
            .fetch_current_user()
            .await
            .map_err(|e| AuthError::backend(SyncStep::CurrentUser, &e))?;

        let profile = match api.fetch_user_profile().await {
            Ok(profile) => Some(profile),
            Err(e) => {
                debug!("Continuing without extended profile: {}", redact_secrets(&e.to_string()));
                None
            }
        };

        Ok((user, profile))
    }

    fn fail(&self, err: AuthError) -> Result<AuthContext, AuthError> {
        warn!("Authentication failed: {}", redact_secrets(&err.to_string()));
        let message = err.user_message();
        if !self
            .inner
            .context
            .transition(AuthState::Failed, |ctx| ctx.error = Some(message.clone()))
        {
            self.inner.context.update(|ctx| ctx.error = Some(message));
        }
        Err(err)
    }

    async fn end_session(&self, reason: Option<AuthError>) {
        if let Some(timers) = lock(&self.inner.timers).take() {
            timers.cancel();
        }

        let api = &self.inner.api;
        if api.tokens().has_credentials()
            && let Err(e) = api.logout_backend().await
        {
            warn!("Backend logout failed: {}", redact_secrets(&e.to_string()));
        }
        api.set_auth_tokens(None, None);
        api.tokens().clear();

        let account = self.snapshot().azure_account;
        if let Err(e) = self.inner.provider.logout(account.as_ref()).await {
            warn!("Identity provider logout failed: {e}");
        }

        if let Err(e) = self.clear_mirror() {
            warn!("Could not clear session mirror: {e}");
        }
        self.inner.retries.store(0, Ordering::SeqCst);

        let message = reason.as_ref().map(AuthError::user_message);
        self.inner
            .context
            .transition(AuthState::Unauthenticated, move |ctx| {
                clear_identity(ctx);
                ctx.error = message;
            });
        info!("Signed out");
    }

    fn write_mirror(&self, user: &BackendUser, profile: Option<&UserProfile>) -> CoreResult<()> {
        let storage = &self.inner.storage;
        storage.set(USER_KEY, &serde_json::to_string(user)?)?;
        match profile {
            Some(profile) => storage.set(PROFILE_KEY, &serde_json::to_string(profile)?),
            None => storage.remove(PROFILE_KEY),
        }
    }

    fn clear_mirror(&self) -> CoreResult<()> {
        self.inner.storage.remove(USER_KEY)?;
        self.inner.storage.remove(PROFILE_KEY)
    }

    fn refresh_delay(&self, access_token: &str) -> Duration {
        claims::expires_at(access_token).map_or_else(
            || self.inner.settings.refresh_interval(),
            |expires| {
                let lead = chrono::Duration::from_std(REFRESH_LEAD).unwrap_or_default();
                expires.checked_sub_signed(lead).map_or_else(
                    || self.inner.settings.refresh_interval(),
                    |refresh_at| {
                        refresh_at
                            .signed_duration_since(Utc::now())
                            .to_std()
                            .unwrap_or_default()
                            .max(MIN_REFRESH_DELAY)
                    },
                )
            },
        )
    }

    fn start_timers(&self, access_token: &str) {
        let cancel = CancellationToken::new();
        if let Some(previous) = lock(&self.inner.timers).replace(cancel.clone()) {
            previous.cancel();
        }

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(refresh_loop(
            weak.clone(),
            cancel.clone(),
            self.refresh_delay(access_token),
        ));
        tokio::spawn(idle_loop(weak, cancel));
    }
}

async fn refresh_loop(inner: Weak<Inner>, cancel: CancellationToken, mut delay: Duration) {
    loop {
        debug!(delay_secs = delay.as_secs(), "Token refresh scheduled");
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
        let Some(inner) = inner.upgrade() else { return };
        let service = AuthService { inner };
        if service.refresh_session().await.is_err() {
            return;
        }
        let Some(token) = service.inner.api.tokens().access_token() else {
            return;
        };
        delay = service.refresh_delay(&token);
    }
}

async fn idle_loop(inner: Weak<Inner>, cancel: CancellationToken) {
    loop {
        let deadline = {
            let Some(inner) = inner.upgrade() else { return };
            let last = *lock(&inner.last_activity);
            last.checked_add(inner.idle_timeout)
        };
        // Past the clock's range the session never idles out
        let Some(deadline) = deadline else {
            cancel.cancelled().await;
            return;
        };
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep_until(deadline) => {}
        }

        let Some(inner) = inner.upgrade() else { return };
        let idle_since = *lock(&inner.last_activity);
        if idle_since
            .checked_add(inner.idle_timeout)
            .is_some_and(|deadline| Instant::now() >= deadline)
        {
            info!(
                idle_secs = inner.idle_timeout.as_secs(),
                "Session idle; signing out"
            );
            AuthService { inner }.logout().await;
            return;
        }
    }
}

fn clear_identity(ctx: &mut AuthContext) {
    ctx.azure_account = None;
    ctx.backend_user = None;
    ctx.user_profile = None;
}

impl std::fmt::Debug for AuthService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthService")
            .field("state", &self.state())
            .field("api", &self.inner.api)
            .finish_non_exhaustive()
    }
}

/// Builder for [`AuthService`]
pub struct AuthServiceBuilder {
    api: ApiClient,
    provider: Arc<dyn IdentityProvider>,
    settings: SessionConfig,
    storage: Option<Arc<dyn SessionStorage>>,
    idle_timeout: Option<Duration>,
}

impl AuthServiceBuilder {
    /// Session limits and timers
    #[must_use]
    pub fn settings(mut self, settings: SessionConfig) -> Self {
        self.settings = settings;
        self
    }

    /// Where the user mirror is kept; in memory by default
    #[must_use]
    pub fn storage(mut self, storage: Arc<dyn SessionStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Override the idle threshold derived from `timeout_minutes`
    #[must_use]
    pub const fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> AuthService {
        AuthService {
            inner: Arc::new(Inner {
                idle_timeout: self
                    .idle_timeout
                    .unwrap_or_else(|| self.settings.idle_timeout()),
                settings: self.settings,
                api: self.api,
                provider: self.provider,
                storage: self
                    .storage
                    .unwrap_or_else(|| Arc::new(MemoryStorage::new())),
                context: ContextStore::new(),
                init_flight: SingleFlight::new(),
                login_flight: SingleFlight::new(),
                failed_logins: AtomicU32::new(0),
                retries: AtomicU32::new(0),
                last_activity: Mutex::new(Instant::now()),
                timers: Mutex::new(None),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{AzureAccount, ProviderError};
    use crate::storage::mock::MockSessionStorage;
    use async_trait::async_trait;
    use mockall::predicate::eq;

    struct NoAccounts;

    #[async_trait]
    impl IdentityProvider for NoAccounts {
        async fn handle_redirect(&self) -> Result<Option<AuthenticationResult>, ProviderError> {
            Ok(None)
        }
        async fn accounts(&self) -> Result<Vec<AzureAccount>, ProviderError> {
            Ok(Vec::new())
        }
        async fn login_redirect(&self) -> Result<AuthenticationResult, ProviderError> {
            Err(ProviderError::Cancelled)
        }
        async fn login_popup(&self) -> Result<AuthenticationResult, ProviderError> {
            Err(ProviderError::Cancelled)
        }
        async fn acquire_token_silent(
            &self,
            _account: &AzureAccount,
        ) -> Result<AuthenticationResult, ProviderError> {
            Err(ProviderError::InteractionRequired("none".into()))
        }
        async fn logout(&self, _account: Option<&AzureAccount>) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    fn service(storage: MockSessionStorage) -> AuthService {
        let api = ApiClient::new("http://127.0.0.1:9").unwrap();
        AuthService::builder(api, Arc::new(NoAccounts))
            .storage(Arc::new(storage))
            .build()
    }

    #[test]
    fn refresh_delay_tracks_token_expiry() {
        let service = service(MockSessionStorage::new());
        let expires = Utc::now() + chrono::Duration::seconds(600);
        let token = claims::encode_unsigned(&serde_json::json!({ "exp": expires.timestamp() }));
        let delay = service.refresh_delay(&token);
        assert!(delay <= Duration::from_secs(540));
        assert!(delay >= Duration::from_secs(530));

        let nearly_expired =
            claims::encode_unsigned(&serde_json::json!({ "exp": Utc::now().timestamp() + 10 }));
        assert_eq!(service.refresh_delay(&nearly_expired), MIN_REFRESH_DELAY);
        assert_eq!(
            service.refresh_delay("opaque"),
            SessionConfig::default().refresh_interval()
        );
    }

    #[test]
    fn refresh_delay_survives_out_of_range_expiry() {
        let service = service(MockSessionStorage::new());
        let ancient = claims::encode_unsigned(
            &serde_json::json!({ "exp": chrono::DateTime::<Utc>::MIN_UTC.timestamp() }),
        );
        assert_eq!(
            service.refresh_delay(&ancient),
            SessionConfig::default().refresh_interval()
        );

        let distant = claims::encode_unsigned(
            &serde_json::json!({ "exp": chrono::DateTime::<Utc>::MAX_UTC.timestamp() }),
        );
        assert!(service.refresh_delay(&distant) > Duration::from_secs(86_400 * 365));
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_idle_timeout_never_signs_out() {
        let api = ApiClient::new("http://127.0.0.1:9").unwrap();
        let service = AuthService::builder(api, Arc::new(NoAccounts))
            .idle_timeout(Duration::MAX)
            .build();
        let cancel = CancellationToken::new();
        let idle = tokio::spawn(idle_loop(Arc::downgrade(&service.inner), cancel.clone()));

        tokio::time::sleep(Duration::from_secs(86_400)).await;
        assert!(!idle.is_finished());
        assert_eq!(service.state(), AuthState::Uninitialized);

        cancel.cancel();
        idle.await.unwrap();
    }

    #[tokio::test]
    async fn logout_clears_mirror_keys() {
        let mut storage = MockSessionStorage::new();
        storage
            .expect_remove()
            .with(eq(USER_KEY))
            .times(1)
            .returning(|_| Ok(()));
        storage
            .expect_remove()
            .with(eq(PROFILE_KEY))
            .times(1)
            .returning(|_| Ok(()));

        let service = service(storage);
        service.logout().await;
        assert_eq!(service.state(), AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn unreadable_mirror_is_ignored() {
        let mut storage = MockSessionStorage::new();
        storage
            .expect_get()
            .with(eq(USER_KEY))
            .returning(|_| Ok(Some("{not json".into())));
        assert!(service(storage).cached_user().is_none());
    }

    #[tokio::test]
    async fn listeners_may_record_activity() {
        use std::sync::atomic::AtomicBool;

        let service = service(MockSessionStorage::new());
        let reactor = service.clone();
        let reacted = AtomicBool::new(false);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = service.subscribe(move |ctx| {
            sink.lock().unwrap().push(ctx.state);
            if !reacted.swap(true, Ordering::SeqCst) {
                reactor.record_activity();
            }
        });

        let ctx = tokio::time::timeout(Duration::from_secs(5), service.initialize())
            .await
            .unwrap()
            .unwrap();
        drop(subscription);

        assert_eq!(ctx.state, AuthState::Unauthenticated);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                AuthState::Initializing,
                AuthState::Initializing,
                AuthState::Unauthenticated
            ]
        );
    }

    #[tokio::test]
    async fn sign_in_is_refused_mid_backend_sync() {
        let service = service(MockSessionStorage::new());
        assert!(service.inner.context.transition(AuthState::Authenticating, |_| {}));
        assert!(service.inner.context.transition(AuthState::BackendSync, |_| {}));

        assert_eq!(service.login().await.unwrap_err(), AuthError::SignInInProgress);
        assert_eq!(
            service.login_with_credentials("ada", "pw").await.unwrap_err(),
            AuthError::SignInInProgress
        );
        assert_eq!(service.state(), AuthState::BackendSync);
    }

    #[tokio::test]
    async fn too_many_failed_logins_are_refused() {
        let service = service(MockSessionStorage::new());
        let limit = SessionConfig::default().max_login_attempts;
        for _ in 0..limit {
            assert_eq!(
                service.login().await.unwrap_err(),
                AuthError::Provider(ProviderError::Cancelled)
            );
        }
        assert_eq!(
            service.login().await.unwrap_err(),
            AuthError::TooManyAttempts { attempts: limit }
        );
        assert_eq!(service.state(), AuthState::Failed);
        assert!(service.snapshot().error.unwrap().contains("Too many"));
    }
}
