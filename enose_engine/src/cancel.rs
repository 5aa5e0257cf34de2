//! Cancellation token: one atomic flag plus a condvar.
//!
//! Every blocking primitive in the engine polls the flag at 10 Hz or
//! better; sleeps additionally wake immediately on `cancel()` through the
//! condvar. Abort is level-triggered — once set, the flag stays set until
//! the run settles and the runner calls `reset()` for the next run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct Inner {
    flag: AtomicBool,
    lock: Mutex<()>,
    cv: Condvar,
}

/// Shared cancellation token.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// New, uncancelled token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                flag: AtomicBool::new(false),
                lock: Mutex::new(()),
                cv: Condvar::new(),
            }),
        }
    }

    /// Request cancellation and wake all sleepers.
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::Release);
        let _guard = self.inner.lock.lock();
        self.inner.cv.notify_all();
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// Clear the flag for a fresh run.
    pub fn reset(&self) {
        self.inner.flag.store(false, Ordering::Release);
    }

    /// The raw flag, for blocking primitives that poll an `AtomicBool`.
    pub fn as_atomic(&self) -> &AtomicBool {
        &self.inner.flag
    }

    /// Sleep up to `duration`, returning early on cancellation.
    ///
    /// Returns true if cancellation was requested.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut guard = self.inner.lock.lock();
        loop {
            if self.is_cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.inner.cv.wait_for(&mut guard, deadline - now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_is_clear() {
        let t = CancelToken::new();
        assert!(!t.is_cancelled());
        assert!(!t.as_atomic().load(Ordering::Acquire));
    }

    #[test]
    fn sleep_runs_to_completion_when_not_cancelled() {
        let t = CancelToken::new();
        let started = Instant::now();
        assert!(!t.sleep(Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn cancel_wakes_sleeper_promptly() {
        let t = CancelToken::new();
        let t2 = t.clone();
        let started = Instant::now();
        let h = std::thread::spawn(move || t2.sleep(Duration::from_secs(10)));
        std::thread::sleep(Duration::from_millis(20));
        t.cancel();
        assert!(h.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn reset_clears_level_triggered_flag() {
        let t = CancelToken::new();
        t.cancel();
        assert!(t.is_cancelled());
        t.reset();
        assert!(!t.is_cancelled());
    }
}
