//! The executor interface the SDK submits work to.

use std::sync::{Arc, Mutex, PoisonError};

use crate::error::ApiError;

/// A unit of work submitted to a [`TaskScheduler`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Priority of a scheduled task. Higher values run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub u32);

impl Priority {
    /// Background work such as prefetching.
    pub const LOW: Self = Self(100);
    /// The default priority.
    pub const NORMAL: Self = Self(500);
    /// Work a user is actively waiting on.
    pub const HIGH: Self = Self(1000);
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

/// Runs submitted tasks asynchronously.
///
/// An implementation either eventually runs every accepted task or rejects it
/// up front with an error; accepted tasks are never dropped silently.
pub trait TaskScheduler: Send + Sync {
    /// Submit a task with an explicit priority.
    fn schedule_task_with_priority(&self, task: Task, priority: Priority) -> Result<(), ApiError>;

    /// Submit a task with [`Priority::NORMAL`].
    fn schedule_task(&self, task: Task) -> Result<(), ApiError> {
        self.schedule_task_with_priority(task, Priority::NORMAL)
    }
}

impl<S: TaskScheduler + ?Sized> TaskScheduler for Arc<S> {
    fn schedule_task_with_priority(&self, task: Task, priority: Priority) -> Result<(), ApiError> {
        (**self).schedule_task_with_priority(task, priority)
    }
}

/// Run `task` on `scheduler`, or on the calling thread when there is none.
///
/// A scheduler that rejects the task also falls back to the calling thread.
pub fn execute_or_schedule<F>(scheduler: Option<&dyn TaskScheduler>, task: F)
where
    F: FnOnce() + Send + 'static,
{
    let Some(scheduler) = scheduler else {
        task();
        return;
    };

    // The slot lets a rejected task run inline; a boxed task is consumed by the call.
    let slot = Arc::new(Mutex::new(Some(task)));
    let scheduled = Arc::clone(&slot);
    let submit = scheduler.schedule_task(Box::new(move || {
        let task = scheduled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task();
        }
    }));

    if let Err(error) = submit {
        tracing::warn!(%error, "task scheduler rejected task, running inline");
        let task = slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task();
        }
    }
}
