//! One-shot latches shared between the controlling thread and module workers.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Latch {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    fn set(&self) {
        let mut set = self.set.lock().unwrap_or_else(PoisonError::into_inner);
        *set = true;
        self.cond.notify_all();
    }

    fn is_set(&self) -> bool {
        *self.set.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until set or `timeout` elapses; returns whether the latch is set.
    fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut set = self.set.lock().unwrap_or_else(PoisonError::into_inner);
        while !*set {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            set = self
                .cond
                .wait_timeout(set, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *set
    }
}

/// Process-wide "finish now" request. Raised by the interrupt handler and
/// observed cooperatively by the orchestrator and module workers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<Latch>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.set();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_set()
    }

    /// Sleep for up to `timeout`, waking early on cancellation. Returns
    /// `true` if the token was cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.0.wait_timeout(timeout)
    }
}

/// Gate released once every module of a group has been unleashed, so that
/// the measured portion of all workers begins together.
#[derive(Debug, Clone, Default)]
pub struct StartSignal(Arc<Latch>);

impl StartSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn release(&self) {
        self.0.set();
    }

    pub fn is_released(&self) -> bool {
        self.0.is_set()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.0.wait_timeout(timeout)
    }

    /// Whether two handles refer to the same gate.
    pub fn same_as(&self, other: &StartSignal) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_cancel_wakes_waiter() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            thread::spawn(move || token.wait_timeout(Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert!(waiter.join().unwrap());
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_wait_times_out_when_not_set() {
        let token = CancelToken::new();
        let start = Instant::now();
        assert!(!token.wait_timeout(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_start_signal_release_is_shared() {
        let signal = StartSignal::new();
        let clone = signal.clone();
        assert!(signal.same_as(&clone));
        assert!(!StartSignal::new().same_as(&signal));
        clone.release();
        assert!(signal.is_released());
        assert!(signal.wait_timeout(Duration::ZERO));
    }
}
