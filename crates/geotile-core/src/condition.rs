//! Single-slot wait/notify primitive.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Timeout used by callers that have no better bound.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Parks one thread until a callback fires or a timeout elapses.
///
/// The condition holds at most one pending signal. Several [`notify`] calls
/// before a [`wait`] satisfy exactly one wait, and every `wait` consumes the
/// signal whether it returns because of it or because of the timeout.
///
/// [`notify`]: Condition::notify
/// [`wait`]: Condition::wait
#[derive(Debug, Default)]
pub struct Condition {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl Condition {
    /// Create an unsignaled condition.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the condition and wake one waiter.
    pub fn notify(&self) {
        let mut signaled = self.signaled.lock().unwrap_or_else(PoisonError::into_inner);
        *signaled = true;
        self.condvar.notify_one();
    }

    /// Wait until signaled or until `timeout` elapses.
    ///
    /// Returns true if the signal was observed. A zero timeout polls.
    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = self.signaled.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut signaled, _) = self
            .condvar
            .wait_timeout_while(guard, timeout, |signaled| !*signaled)
            .unwrap_or_else(PoisonError::into_inner);

        let observed = *signaled;
        *signaled = false;
        observed
    }
}
