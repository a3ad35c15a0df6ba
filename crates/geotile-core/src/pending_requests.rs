//! Registry of a client's outstanding operations.
//!
//! Entries are registered in two phases: a key is reserved with
//! [`PendingRequests::generate_request_placeholder`] before the operation is
//! built, and filled in with [`PendingRequests::insert`] once its cancellation
//! token exists. A registry that was drained in between rejects the insert,
//! which tells the caller that its operation must not start.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::cancellation::CancellationToken;
use crate::condition::DEFAULT_WAIT_TIMEOUT;
use crate::task_context::TaskContext;

/// Key of a registry entry, issued by
/// [`PendingRequests::generate_request_placeholder`].
pub type RequestKey = u64;

/// Thread-safe registry of pending requests.
///
/// The internal lock is held only for bookkeeping. Cancel callbacks run and
/// waits happen after it is released, so a callback may call back into the
/// registry.
#[derive(Debug, Default)]
pub struct PendingRequests {
    inner: Mutex<Registry>,
}

#[derive(Debug, Default)]
struct Registry {
    last_key: RequestKey,
    placeholders: HashMap<RequestKey, Entry>,
    tasks: HashSet<TaskContext>,
}

#[derive(Debug)]
enum Entry {
    Reserved,
    Token(CancellationToken),
    Task(TaskContext),
}

impl Registry {
    fn filled(&self) -> usize {
        self.placeholders
            .values()
            .filter(|entry| !matches!(entry, Entry::Reserved))
            .count()
    }
}

impl PendingRequests {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a key that a later [`insert`](Self::insert) can fill.
    ///
    /// Keys start at 1 and are never reused.
    pub fn generate_request_placeholder(&self) -> RequestKey {
        let mut registry = self.lock();
        registry.last_key += 1;
        let key = registry.last_key;
        registry.placeholders.insert(key, Entry::Reserved);
        key
    }

    /// Associate `token` with a reserved key.
    ///
    /// Fails if the key was never reserved, is already filled, or was removed.
    pub fn insert(&self, token: CancellationToken, key: RequestKey) -> bool {
        self.fill(key, Entry::Token(token))
    }

    /// Associate a task with a reserved key.
    ///
    /// Unlike a plain token, a task can be waited for by
    /// [`cancel_all_and_wait`](Self::cancel_all_and_wait).
    pub fn insert_task(&self, task: TaskContext, key: RequestKey) -> bool {
        self.fill(key, Entry::Task(task))
    }

    /// Register a task under its own identity.
    ///
    /// Fails if the task is already registered.
    pub fn insert_task_context(&self, task: TaskContext) -> bool {
        self.lock().tasks.insert(task)
    }

    /// Delete the entry under `key`; false if there is none.
    pub fn remove(&self, key: RequestKey) -> bool {
        self.lock().placeholders.remove(&key).is_some()
    }

    /// Delete a task registered by identity; false if it is not registered.
    pub fn remove_task_context(&self, task: &TaskContext) -> bool {
        self.lock().tasks.remove(task)
    }

    /// Request cancellation of every registered entry without waiting.
    ///
    /// Entries stay registered; they are removed by their owners once the
    /// cancelled operations complete.
    pub fn cancel_all(&self) -> bool {
        let tokens: Vec<CancellationToken> = {
            let registry = self.lock();
            let placeholder_tokens = registry.placeholders.values().filter_map(|entry| match entry {
                Entry::Reserved => None,
                Entry::Token(token) => Some(token.clone()),
                Entry::Task(task) => Some(task.cancel_token()),
            });
            let task_tokens = registry.tasks.iter().map(TaskContext::cancel_token);
            placeholder_tokens.chain(task_tokens).collect()
        };

        tracing::debug!(count = tokens.len(), "cancelling pending requests");
        for token in &tokens {
            token.cancel();
        }
        true
    }

    /// Cancel every entry and wait up to [`DEFAULT_WAIT_TIMEOUT`] for each
    /// registered task to finish.
    ///
    /// See [`cancel_all_and_wait_for`](Self::cancel_all_and_wait_for).
    pub fn cancel_all_and_wait(&self) -> bool {
        self.cancel_all_and_wait_for(DEFAULT_WAIT_TIMEOUT)
    }

    /// Cancel every entry and wait for registered tasks to finish.
    ///
    /// The registry is emptied first, reserved keys included, so operations
    /// registering concurrently work against a fresh registry. Each task is
    /// waited for at most `timeout`. Returns false if any wait timed out.
    pub fn cancel_all_and_wait_for(&self, timeout: Duration) -> bool {
        let (placeholders, tasks) = {
            let mut registry = self.lock();
            (
                std::mem::take(&mut registry.placeholders),
                std::mem::take(&mut registry.tasks),
            )
        };

        let mut waiting = Vec::with_capacity(placeholders.len() + tasks.len());
        for entry in placeholders.into_values() {
            match entry {
                Entry::Reserved => {}
                Entry::Token(token) => token.cancel(),
                Entry::Task(task) => waiting.push(task),
            }
        }
        waiting.extend(tasks);

        for task in &waiting {
            task.cancel_token().cancel();
        }

        let mut all_completed = true;
        for task in &waiting {
            if !task.blocking_cancel(timeout) {
                tracing::warn!(?task, ?timeout, "pending request did not finish after cancel");
                all_completed = false;
            }
        }
        all_completed
    }

    /// Number of registered entries, reserved-but-unfilled keys excluded.
    #[must_use]
    pub fn task_count(&self) -> usize {
        let registry = self.lock();
        registry.filled() + registry.tasks.len()
    }

    fn fill(&self, key: RequestKey, entry: Entry) -> bool {
        let mut registry = self.lock();
        match registry.placeholders.get_mut(&key) {
            Some(slot @ Entry::Reserved) => {
                *slot = entry;
                true
            }
            _ => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
