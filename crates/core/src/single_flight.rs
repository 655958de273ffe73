//! Single-flight execution: concurrent callers share one in-flight operation

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::future::Future;
use std::sync::{Arc, Mutex};

type SharedFlight<T> = Shared<BoxFuture<'static, T>>;

/// Coalesces concurrent executions of the same operation
///
/// While an operation is running, every further call to [`SingleFlight::run`]
/// awaits the same result instead of starting a new one. Once it completes the
/// slot is cleared and the next call starts a fresh execution.
pub struct SingleFlight<T: Clone> {
    inflight: Arc<Mutex<Option<SharedFlight<T>>>>,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an idle single-flight slot
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(None)),
        }
    }

    /// Whether an execution is currently in flight
    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }

    /// Run `op`, or join the execution already in flight
    pub async fn run<F, Fut>(&self, op: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let flight = {
            let mut slot = self.lock();
            if let Some(existing) = slot.as_ref() {
                existing.clone()
            } else {
                let slot_ref = Arc::clone(&self.inflight);
                let fut = op();
                let flight = async move {
                    let output = fut.await;
                    // Clear before waking joiners so a caller arriving after
                    // completion starts a new execution.
                    slot_ref.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take();
                    output
                }
                .boxed()
                .shared();
                *slot = Some(flight.clone());
                flight
            }
        };

        flight.await
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<SharedFlight<T>>> {
        self.inflight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> std::fmt::Debug for SingleFlight<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight").finish_non_exhaustive()
    }
}
