//! Cooperative cancellation.
//!
//! A [`CancellationToken`] is the capability to abort one in-flight step, for
//! example one network request. A [`CancellationContext`] is the cancellation
//! state of a whole logical operation: it remembers whether cancellation was
//! requested and holds the token of whichever step is currently running, so
//! that a cancel request from any thread reaches that step.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

type CancelFn = Box<dyn FnOnce() + Send + 'static>;

/// An invoke-once cancel callback.
///
/// Clones share the same callback; whichever clone calls [`cancel`] first runs
/// it and every later call is a no-op. A default token cancels nothing.
///
/// [`cancel`]: CancellationToken::cancel
#[derive(Clone, Default)]
pub struct CancellationToken {
    callback: Option<Arc<Mutex<Option<CancelFn>>>>,
}

impl CancellationToken {
    /// Create a token that runs `callback` on the first [`cancel`](Self::cancel).
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            callback: Some(Arc::new(Mutex::new(Some(Box::new(callback))))),
        }
    }

    /// Invoke the cancel callback if it has not run yet.
    ///
    /// The callback runs on the calling thread, outside of any lock.
    pub fn cancel(&self) {
        let Some(slot) = &self.callback else {
            return;
        };
        let callback = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Whether a callback is still waiting to run.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.callback.as_ref().is_some_and(|slot| {
            slot.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_some()
        })
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("armed", &self.is_armed())
            .finish()
    }
}

/// Shared cancellation state for one logical operation.
///
/// Cloning a context shares its state: cancelling any clone cancels all of
/// them. [`take`](Self::take) moves the state out and leaves a fresh,
/// independent context behind.
#[derive(Clone, Default)]
pub struct CancellationContext {
    inner: Arc<ContextInner>,
}

#[derive(Default)]
struct ContextInner {
    cancelled: AtomicBool,
    state: Mutex<ContextState>,
}

#[derive(Default)]
struct ContextState {
    /// Token of the step that is currently in flight.
    token: Option<CancellationToken>,
    /// Sub-operations cancelled together with this context.
    children: Vec<Weak<ContextInner>>,
}

impl CancellationContext {
    /// Create a context that has not been cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Request cancellation.
    ///
    /// The token of the in-flight step, if any, is invoked on the calling
    /// thread, then every child context is cancelled. Later calls do nothing.
    pub fn cancel_operation(&self) {
        let (token, children) = {
            let mut state = self.lock();
            if self.inner.cancelled.swap(true, Ordering::AcqRel) {
                return;
            }
            (state.token.take(), std::mem::take(&mut state.children))
        };

        if let Some(token) = token {
            token.cancel();
        }

        for child in children.iter().filter_map(Weak::upgrade) {
            Self { inner: child }.cancel_operation();
        }
    }

    /// Run one step of the operation unless the context is already cancelled.
    ///
    /// If the context is cancelled, `cancel` is invoked and `execute` is not;
    /// the return value is then false. Otherwise `execute` runs and returns the
    /// token that aborts the step it started. The token is registered so a
    /// later [`cancel_operation`](Self::cancel_operation) reaches it. A cancel
    /// that arrives while `execute` is still running invokes the returned
    /// token as soon as `execute` returns.
    pub fn execute_or_cancelled<E, C>(&self, execute: E, cancel: C) -> bool
    where
        E: FnOnce() -> CancellationToken,
        C: FnOnce(),
    {
        if self.is_cancelled() {
            cancel();
            return false;
        }

        // The lock is not held here so `execute` may use the context itself.
        let token = execute();

        let mut state = self.lock();
        if self.is_cancelled() {
            drop(state);
            token.cancel();
        } else {
            state.token = Some(token);
        }
        true
    }

    /// Forget the token of the last step once it finished on its own.
    pub fn release_token(&self) {
        self.lock().token = None;
    }

    /// Create a context for a nested sub-operation.
    ///
    /// The child is cancelled whenever this context is. Cancelling the child
    /// leaves this context untouched.
    #[must_use]
    pub fn child(&self) -> Self {
        let child = Self::new();
        {
            let mut state = self.lock();
            if !self.is_cancelled() {
                state.children.retain(|weak| weak.strong_count() > 0);
                state.children.push(Arc::downgrade(&child.inner));
                return child;
            }
        }
        child.cancel_operation();
        child
    }

    /// Move the shared state out of this handle.
    ///
    /// `self` is left holding a fresh context that shares nothing with the
    /// returned one.
    #[must_use]
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    /// Whether two handles share the same state.
    #[must_use]
    pub fn same_context(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn lock(&self) -> MutexGuard<'_, ContextState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for CancellationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationContext")
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}
