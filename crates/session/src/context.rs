//! Auth state and the shared context observers subscribe to

use crate::lock;
use crate::provider::AzureAccount;
use canvass_http::types::{BackendUser, UserProfile};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

/// Authentication lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthState {
    Uninitialized,
    Initializing,
    Unauthenticated,
    Authenticating,
    BackendSync,
    Authenticated,
    TokenRefresh,
    Failed,
}

impl AuthState {
    /// Whether the machine may move from `self` to `next`
    pub const fn can_transition_to(self, next: Self) -> bool {
        use AuthState::{
            Authenticated, Authenticating, BackendSync, Failed, Initializing, TokenRefresh,
            Uninitialized, Unauthenticated,
        };
        matches!(
            (self, next),
            (_, Unauthenticated)
                | (Uninitialized | Failed, Initializing)
                | (Uninitialized | Unauthenticated | Failed, Authenticating)
                | (Initializing | Authenticating | Failed, BackendSync)
                | (BackendSync | TokenRefresh, Authenticated)
                | (Authenticated, TokenRefresh)
                | (Initializing | Authenticating | BackendSync, Failed)
        )
    }

    /// States in which an operation is in progress
    pub const fn is_loading(self) -> bool {
        matches!(
            self,
            Self::Initializing | Self::Authenticating | Self::BackendSync | Self::TokenRefresh
        )
    }
}

impl std::fmt::Display for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Uninitialized => "UNINITIALIZED",
            Self::Initializing => "INITIALIZING",
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::Authenticating => "AUTHENTICATING",
            Self::BackendSync => "BACKEND_SYNC",
            Self::Authenticated => "AUTHENTICATED",
            Self::TokenRefresh => "TOKEN_REFRESH",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Snapshot of the session as observers see it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthContext {
    pub state: AuthState,
    pub azure_account: Option<AzureAccount>,
    pub backend_user: Option<BackendUser>,
    pub user_profile: Option<UserProfile>,
    pub error: Option<String>,
    pub is_loading: bool,
    pub last_activity: DateTime<Utc>,
}

impl AuthContext {
    fn new() -> Self {
        Self {
            state: AuthState::Uninitialized,
            azure_account: None,
            backend_user: None,
            user_profile: None,
            error: None,
            is_loading: false,
            last_activity: Utc::now(),
        }
    }

    /// Authenticated with a known backend user
    pub fn is_authenticated(&self) -> bool {
        matches!(self.state, AuthState::Authenticated | AuthState::TokenRefresh)
            && self.backend_user.is_some()
    }
}

impl Default for AuthContext {
    fn default() -> Self {
        Self::new()
    }
}

type Listener = Arc<dyn Fn(&AuthContext) + Send + Sync>;

/// Owner of the single [`AuthContext`]
///
/// Changes go through [`ContextStore::transition`] or [`ContextStore::update`];
/// each one notifies every listener synchronously with the new snapshot, in
/// the order the changes were made. A listener may change the store itself;
/// that change is delivered once the current snapshot has reached every
/// listener.
pub struct ContextStore {
    context: Mutex<AuthContext>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    outbox: Mutex<Outbox>,
    next_id: AtomicU64,
}

/// Snapshots waiting for delivery, in mutation order
#[derive(Default)]
struct Outbox {
    pending: VecDeque<AuthContext>,
    draining: bool,
}

impl ContextStore {
    /// Store in the `UNINITIALIZED` state
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            context: Mutex::new(AuthContext::new()),
            listeners: Mutex::new(Vec::new()),
            outbox: Mutex::new(Outbox::default()),
            next_id: AtomicU64::new(0),
        })
    }

    /// Copy of the current context
    pub fn snapshot(&self) -> AuthContext {
        lock(&self.context).clone()
    }

    /// Current state
    pub fn state(&self) -> AuthState {
        lock(&self.context).state
    }

    /// Move to `next`, applying `mutate` in the same step
    ///
    /// Returns `false`, leaving the context untouched, when the move is not
    /// allowed from the current state.
    pub fn transition(&self, next: AuthState, mutate: impl FnOnce(&mut AuthContext)) -> bool {
        {
            let mut context = lock(&self.context);
            let current = context.state;
            if !current.can_transition_to(next) {
                warn!(from = %current, to = %next, "Rejected auth state transition");
                return false;
            }
            debug!(from = %current, to = %next, "Auth state transition");
            context.state = next;
            context.is_loading = next.is_loading();
            context.last_activity = Utc::now();
            mutate(&mut context);
            self.enqueue(&context);
        }
        self.drain();
        true
    }

    /// Change fields without changing state
    pub fn update(&self, mutate: impl FnOnce(&mut AuthContext)) {
        {
            let mut context = lock(&self.context);
            mutate(&mut context);
            self.enqueue(&context);
        }
        self.drain();
    }

    /// Register `listener`; it stays registered until the returned handle drops
    pub fn subscribe(
        self: &Arc<Self>,
        listener: impl Fn(&AuthContext) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.listeners).push((id, Arc::new(listener)));
        Subscription {
            store: Arc::downgrade(self),
            id,
        }
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    fn unsubscribe(&self, id: u64) {
        lock(&self.listeners).retain(|(existing, _)| *existing != id);
    }

    // Called with the context lock held so queue order matches mutation order
    fn enqueue(&self, snapshot: &AuthContext) {
        lock(&self.outbox).pending.push_back(snapshot.clone());
    }

    /// Deliver queued snapshots unless another caller is already doing so
    fn drain(&self) {
        {
            let mut outbox = lock(&self.outbox);
            if outbox.draining {
                return;
            }
            outbox.draining = true;
        }
        loop {
            let next = {
                let mut outbox = lock(&self.outbox);
                let Some(next) = outbox.pending.pop_front() else {
                    outbox.draining = false;
                    return;
                };
                next
            };
            self.notify(&next);
        }
    }

    fn notify(&self, snapshot: &AuthContext) {
        let listeners: Vec<Listener> = lock(&self.listeners)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(snapshot);
        }
    }
}

impl std::fmt::Debug for ContextStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextStore")
            .field("state", &self.state())
            .field("listeners", &self.listener_count())
            .finish_non_exhaustive()
    }
}

/// Listener registration; dropping it unsubscribes
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    store: Weak<ContextStore>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            store.unsubscribe(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
