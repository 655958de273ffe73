//! Silent refresh guard
//!
//! Tracks consecutive refresh failures. At [`MAX_REFRESH_FAILURES`] silent
//! refresh is disabled until [`RefreshPolicy::reset_after_login`] runs, and a
//! backoff window separates failed attempts so a dead session cannot cause a
//! storm of refresh requests. Every non-200 answer counts as a failure; 4xx
//! and 5xx are not told apart.

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Consecutive failures after which silent refresh is disabled
pub const MAX_REFRESH_FAILURES: u32 = 3;

/// Default gap enforced between failed refresh attempts
pub const DEFAULT_REFRESH_BACKOFF: Duration = Duration::from_secs(60);

/// Why a refresh attempt was skipped without touching the network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshSkip {
    /// Failure threshold reached; waits for a fresh login
    Disabled,
    /// Neither an access token nor a legacy refresh token is held
    NoCredentials,
    /// The previous failure is too recent
    BackingOff,
}

#[derive(Debug, Default)]
struct FailureState {
    count: u32,
    last_failure: Option<Instant>,
    disabled: bool,
}

/// Failure counter and backoff window for silent refresh
#[derive(Debug)]
pub struct RefreshPolicy {
    backoff: Duration,
    state: Mutex<FailureState>,
}

impl RefreshPolicy {
    /// Create a policy with the given backoff window
    pub fn new(backoff: Duration) -> Self {
        Self {
            backoff,
            state: Mutex::new(FailureState::default()),
        }
    }

    /// Decide whether a refresh may hit the network
    ///
    /// # Errors
    ///
    /// Returns the reason the attempt must be skipped
    pub fn check(&self, has_credentials: bool) -> Result<(), RefreshSkip> {
        let state = self.lock();
        if state.disabled {
            return Err(RefreshSkip::Disabled);
        }
        if !has_credentials {
            return Err(RefreshSkip::NoCredentials);
        }
        if let Some(last) = state.last_failure {
            if last.elapsed() < self.backoff {
                return Err(RefreshSkip::BackingOff);
            }
        }
        Ok(())
    }

    /// Record a successful refresh
    pub fn record_success(&self) {
        let mut state = self.lock();
        state.count = 0;
        state.last_failure = None;
    }

    /// Record a failed refresh; returns `true` when this failure disabled refresh
    pub fn record_failure(&self) -> bool {
        let mut state = self.lock();
        state.count += 1;
        state.last_failure = Some(Instant::now());
        if state.count >= MAX_REFRESH_FAILURES && !state.disabled {
            state.disabled = true;
            warn!(
                failures = state.count,
                "Silent refresh disabled until the next successful login"
            );
            return true;
        }
        false
    }

    /// Clear the counter after an interactive login succeeded
    pub fn reset_after_login(&self) {
        *self.lock() = FailureState::default();
    }

    /// Whether silent refresh is disabled
    pub fn is_disabled(&self) -> bool {
        self.lock().disabled
    }

    /// Consecutive failures so far
    pub fn failure_count(&self) -> u32 {
        self.lock().count
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FailureState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_REFRESH_BACKOFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_without_credentials() {
        let policy = RefreshPolicy::default();
        assert_eq!(policy.check(false), Err(RefreshSkip::NoCredentials));
        assert_eq!(policy.check(true), Ok(()));
    }

    #[test]
    fn disables_at_threshold_until_login() {
        let policy = RefreshPolicy::new(Duration::ZERO);
        assert!(!policy.record_failure());
        assert!(!policy.record_failure());
        assert!(policy.record_failure());
        assert!(policy.is_disabled());
        assert_eq!(policy.check(true), Err(RefreshSkip::Disabled));

        // A successful refresh alone does not re-enable it
        policy.record_success();
        assert_eq!(policy.check(true), Err(RefreshSkip::Disabled));

        policy.reset_after_login();
        assert_eq!(policy.check(true), Ok(()));
        assert_eq!(policy.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_window_blocks_rapid_retries() {
        let policy = RefreshPolicy::new(Duration::from_secs(60));
        policy.record_failure();
        assert_eq!(policy.check(true), Err(RefreshSkip::BackingOff));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(policy.check(true), Ok(()));
    }
}
