//! Session liveness flag.
//!
//! Engine threads call into host-owned adapters with no built-in way to
//! cancel a callback that is already running. Every callback therefore
//! starts with [`Liveness::enter`]: once teardown has begun it returns
//! `None` and the callback leaves without touching host state. Teardown
//! flips the flag first and then waits for callbacks already inside to
//! drop their [`CallbackGuard`].

use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

const LIVE: u8 = 0;
const TEARING_DOWN: u8 = 1;
const DEAD: u8 = 2;

/// Lifecycle of a session as seen by callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    /// Callbacks may touch host state.
    Live,
    /// Teardown began; new callbacks are turned away.
    TearingDown,
    /// Teardown finished.
    Dead,
}

struct Inner {
    state: AtomicU8,
    in_flight: AtomicUsize,
    rejected: AtomicU64,
    idle_lock: Mutex<()>,
    idle: Condvar,
}

/// Shared liveness flag. Cloning shares the same flag.
#[derive(Clone)]
pub struct Liveness {
    inner: Arc<Inner>,
}

impl Liveness {
    /// Create a live flag.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(LIVE),
                in_flight: AtomicUsize::new(0),
                rejected: AtomicU64::new(0),
                idle_lock: Mutex::new(()),
                idle: Condvar::new(),
            }),
        }
    }

    /// Current state.
    pub fn state(&self) -> LivenessState {
        match self.inner.state.load(Ordering::SeqCst) {
            LIVE => LivenessState::Live,
            TEARING_DOWN => LivenessState::TearingDown,
            _ => LivenessState::Dead,
        }
    }

    /// Returns `true` while callbacks may run.
    pub fn is_live(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) == LIVE
    }

    /// Enter a callback. `None` once teardown has begun.
    ///
    /// The count is raised before the state is checked so teardown either
    /// sees this callback in flight or this callback sees teardown.
    pub fn enter(&self) -> Option<CallbackGuard> {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = CallbackGuard {
            inner: Arc::clone(&self.inner),
        };
        if self.is_live() {
            Some(guard)
        } else {
            drop(guard);
            self.inner.rejected.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Begin teardown. Returns `true` for the call that flipped the flag.
    pub fn begin_teardown(&self) -> bool {
        self.inner
            .state
            .compare_exchange(LIVE, TEARING_DOWN, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Wait until no callback is inside. Returns `false` on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut lock = self
            .inner
            .idle_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while self.inner.in_flight.load(Ordering::SeqCst) > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            lock = self
                .inner
                .idle
                .wait_timeout(lock, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Mark teardown finished.
    pub fn mark_dead(&self) {
        self.inner.state.store(DEAD, Ordering::SeqCst);
    }

    /// Callbacks currently inside.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Callbacks turned away after teardown began.
    pub fn rejected(&self) -> u64 {
        self.inner.rejected.load(Ordering::Relaxed)
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Liveness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Liveness")
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Proof that a callback is inside a live session.
pub struct CallbackGuard {
    inner: Arc<Inner>,
}

impl Drop for CallbackGuard {
    fn drop(&mut self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _lock = self
                .inner
                .idle_lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.inner.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_enter_after_teardown_is_rejected() {
        let liveness = Liveness::new();
        assert!(liveness.enter().is_some());
        assert!(liveness.begin_teardown());
        assert!(!liveness.begin_teardown());
        assert!(liveness.enter().is_none());
        assert_eq!(liveness.rejected(), 1);
        assert_eq!(liveness.in_flight(), 0);
        liveness.mark_dead();
        assert_eq!(liveness.state(), LivenessState::Dead);
    }

    #[test]
    fn test_wait_idle_waits_for_guard() {
        let liveness = Liveness::new();
        let guard = liveness.enter().unwrap();
        liveness.begin_teardown();
        assert!(!liveness.wait_idle(Duration::from_millis(10)));

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(guard);
        });
        assert!(liveness.wait_idle(Duration::from_secs(2)));
        handle.join().unwrap();
    }
}
