//! Timer facility used by the transport.
//!
//! The transport never sleeps or blocks. Everything time-driven (gap checks,
//! ack timeouts, pacing) is a one-shot callback handed to a [`Scheduler`].
//! Periodic work reschedules itself from inside its callback.
//!
//! Two implementations exist:
//! - [`TokioScheduler`] (feature `tokio-runtime`): spawns a task per timer
//!   on a tokio runtime and cancels it through a `CancellationToken`
//! - `sim::SimScheduler`: deterministic virtual time for tests and simulation

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Callback run when a timer fires.
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Handle identifying a scheduled callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

/// Cooperative one-shot timer service with a monotonic clock.
///
/// Callbacks may run on a different thread than the one that scheduled them
/// and must not assume any lock is held.
pub trait Scheduler: Send + Sync {
    /// Current time on the scheduler's clock.
    fn now(&self) -> Instant;

    /// Run `callback` once after `delay`.
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerId;

    /// Cancel a pending callback.
    ///
    /// Returns `false` if it already ran or was never scheduled; cancelling
    /// twice is harmless.
    fn cancel(&self, id: TimerId) -> bool;
}

/// Lock a mutex, recovering the data if a callback panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(feature = "tokio-runtime")]
pub use self::tokio_impl::TokioScheduler;

#[cfg(feature = "tokio-runtime")]
mod tokio_impl {
    use super::{lock, Scheduler, TimerCallback, TimerId};
    use log::debug;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};
    use tokio::runtime::Handle;
    use tokio_util::sync::CancellationToken;

    type TimerMap = Arc<Mutex<HashMap<TimerId, CancellationToken>>>;

    /// [`Scheduler`] backed by tokio timers.
    ///
    /// Uses `tokio::time::Instant` as its clock so paused test runtimes
    /// (`start_paused = true`) drive it deterministically.
    pub struct TokioScheduler {
        handle: Handle,
        next_id: AtomicU64,
        timers: TimerMap,
    }

    impl TokioScheduler {
        /// Create a scheduler spawning onto the given runtime.
        pub fn new(handle: Handle) -> Self {
            Self {
                handle,
                next_id: AtomicU64::new(1),
                timers: Arc::new(Mutex::new(HashMap::new())),
            }
        }

        /// Create a scheduler for the runtime this is called from.
        ///
        /// # Panics
        ///
        /// Panics when called outside a tokio runtime.
        pub fn current() -> Self {
            Self::new(Handle::current())
        }

        /// Number of timers that have neither fired nor been cancelled.
        pub fn pending(&self) -> usize {
            lock(&self.timers).len()
        }
    }

    impl Scheduler for TokioScheduler {
        fn now(&self) -> Instant {
            tokio::time::Instant::now().into_std()
        }

        fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerId {
            let id = TimerId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
            let token = CancellationToken::new();
            lock(&self.timers).insert(id, token.clone());

            let timers = Arc::clone(&self.timers);
            self.handle.spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("{} cancelled", id);
                    }
                    _ = tokio::time::sleep(delay) => {
                        // A concurrent cancel() may have won the race
                        let armed = lock(&timers).remove(&id).is_some();
                        if armed {
                            callback();
                        }
                    }
                }
            });
            id
        }

        fn cancel(&self, id: TimerId) -> bool {
            match lock(&self.timers).remove(&id) {
                Some(token) => {
                    token.cancel();
                    true
                }
                None => false,
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::sync::atomic::AtomicUsize;

        #[tokio::test(start_paused = true)]
        async fn test_callback_fires_after_delay() {
            let scheduler = TokioScheduler::current();
            let fired = Arc::new(AtomicUsize::new(0));
            let counter = fired.clone();

            let start = scheduler.now();
            scheduler.schedule(
                Duration::from_millis(50),
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );

            tokio::time::sleep(Duration::from_millis(40)).await;
            assert_eq!(fired.load(Ordering::SeqCst), 0);

            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(fired.load(Ordering::SeqCst), 1);
            assert!(scheduler.now() - start >= Duration::from_millis(50));
            assert_eq!(scheduler.pending(), 0);
        }

        #[tokio::test(start_paused = true)]
        async fn test_cancel_prevents_callback() {
            let scheduler = TokioScheduler::current();
            let fired = Arc::new(AtomicUsize::new(0));
            let counter = fired.clone();

            let id = scheduler.schedule(
                Duration::from_millis(10),
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );
            assert!(scheduler.cancel(id));
            assert!(!scheduler.cancel(id));

            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(fired.load(Ordering::SeqCst), 0);
        }
    }
}
