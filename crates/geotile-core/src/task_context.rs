//! Schedulable, cancellable units of work.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::cancellation::{CancellationContext, CancellationToken};
use crate::condition::Condition;
use crate::error::{ApiError, ApiResponse, ErrorCode};

const PENDING: u8 = 0;
const IN_PROGRESS: u8 = 1;
const COMPLETED: u8 = 2;

type ExecuteFn<T> = Box<dyn FnOnce(CancellationContext) -> ApiResponse<T> + Send + 'static>;
type CallbackFn<T> = Box<dyn FnOnce(ApiResponse<T>) + Send + 'static>;

/// A unit of work bundled with its cancellation context and result callback.
///
/// The callback is invoked exactly once: with the body's result, or with a
/// cancellation error if the task was cancelled before or while the body ran.
/// Handles are cheap to clone and compare equal when they refer to the same
/// task, so they can be stored in sets.
///
/// # Example
///
/// ```
/// use geotile_core::TaskContext;
///
/// let task = TaskContext::new(
///     |_context| Ok(42),
///     |response| assert_eq!(response, Ok(42)),
/// );
/// task.execute();
/// ```
#[derive(Clone)]
pub struct TaskContext {
    inner: Arc<dyn TaskImpl>,
}

/// Type-erased task operations.
trait TaskImpl: Send + Sync {
    fn execute(&self);
    fn blocking_cancel(&self, timeout: Duration) -> bool;
    fn cancel_token(&self) -> CancellationToken;
    fn is_completed(&self) -> bool;
    fn context(&self) -> &CancellationContext;
}

impl TaskContext {
    /// Create a task with a fresh cancellation context.
    pub fn new<T, E, C>(execute: E, callback: C) -> Self
    where
        T: Send + 'static,
        E: FnOnce(CancellationContext) -> ApiResponse<T> + Send + 'static,
        C: FnOnce(ApiResponse<T>) + Send + 'static,
    {
        Self::with_context(execute, callback, CancellationContext::new())
    }

    /// Create a task that runs under an existing cancellation context.
    pub fn with_context<T, E, C>(execute: E, callback: C, context: CancellationContext) -> Self
    where
        T: Send + 'static,
        E: FnOnce(CancellationContext) -> ApiResponse<T> + Send + 'static,
        C: FnOnce(ApiResponse<T>) + Send + 'static,
    {
        Self {
            inner: Arc::new(TaskContextImpl {
                state: AtomicU8::new(PENDING),
                slots: Mutex::new(Slots {
                    execute: Some(Box::new(execute)),
                    callback: Some(Box::new(callback)),
                }),
                context,
                condition: Condition::new(),
            }),
        }
    }

    /// Run the body unless cancelled and deliver the result.
    ///
    /// Only the first call has an effect.
    pub fn execute(&self) {
        self.inner.execute();
    }

    /// Cancel the task and wait up to `timeout` for its callback to finish.
    ///
    /// A body that has not started yet is dropped and never runs; the
    /// cancellation error is delivered once [`execute`](Self::execute) is
    /// called. Returns true if completion was observed, false on timeout.
    pub fn blocking_cancel(&self, timeout: Duration) -> bool {
        self.inner.blocking_cancel(timeout)
    }

    /// A token that cancels this task.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel_token()
    }

    /// Whether the callback has been delivered.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.inner.is_completed()
    }

    /// The cancellation context the body runs under.
    #[must_use]
    pub fn cancellation_context(&self) -> &CancellationContext {
        self.inner.context()
    }

    fn identity(&self) -> *const () {
        Arc::as_ptr(&self.inner).cast::<()>()
    }
}

impl PartialEq for TaskContext {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for TaskContext {}

impl Hash for TaskContext {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("id", &self.identity())
            .field("completed", &self.is_completed())
            .finish()
    }
}

struct Slots<T> {
    execute: Option<ExecuteFn<T>>,
    callback: Option<CallbackFn<T>>,
}

struct TaskContextImpl<T> {
    state: AtomicU8,
    slots: Mutex<Slots<T>>,
    context: CancellationContext,
    condition: Condition,
}

impl<T: Send + 'static> TaskImpl for TaskContextImpl<T> {
    fn execute(&self) {
        if self
            .state
            .compare_exchange(PENDING, IN_PROGRESS, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        // Taking both closures out guarantees each runs at most once.
        let (execute, callback) = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            (slots.execute.take(), slots.callback.take())
        };

        let mut response = Err(ApiError::cancelled());
        if let Some(execute) = execute {
            if !self.context.is_cancelled() {
                let result = execute(self.context.clone());
                // A result that raced with a cancel is discarded, timeouts excepted.
                let timed_out = matches!(&result, Err(e) if e.code() == ErrorCode::RequestTimeout);
                if !self.context.is_cancelled() || timed_out {
                    response = result;
                }
                self.context.release_token();
            }
        }

        if let Some(callback) = callback {
            callback(response);
        }

        self.condition.notify();
        self.state.store(COMPLETED, Ordering::Release);
    }

    fn blocking_cancel(&self, timeout: Duration) -> bool {
        if self.is_completed() {
            return true;
        }

        self.context.cancel_operation();

        let dropped = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .execute
            .take();
        drop(dropped);

        self.condition.wait(timeout)
    }

    fn cancel_token(&self) -> CancellationToken {
        let context = self.context.clone();
        CancellationToken::new(move || context.cancel_operation())
    }

    fn is_completed(&self) -> bool {
        self.state.load(Ordering::Acquire) == COMPLETED
    }

    fn context(&self) -> &CancellationContext {
        &self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::DEFAULT_WAIT_TIMEOUT;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::mpsc;
    use std::thread;

    type Response = ApiResponse<String>;

    fn recording_callback(
        counter: &Arc<AtomicUsize>,
    ) -> (impl FnOnce(Response) + Send + 'static, mpsc::Receiver<Response>) {
        let (sender, receiver) = mpsc::channel();
        let counter = Arc::clone(counter);
        let callback = move |response: Response| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = sender.send(response);
        };
        (callback, receiver)
    }

    #[test]
    fn test_execute_delivers_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (callback, receiver) = recording_callback(&counter);
        let task = TaskContext::new(
            |_| Err(ApiError::new(ErrorCode::InvalidArgument, "test")),
            callback,
        );

        task.execute();
        task.execute();
        task.execute();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(task.is_completed());
        let response = receiver.recv().unwrap();
        assert_eq!(response.unwrap_err().code(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn test_cancel_after_execute_keeps_result() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (callback, receiver) = recording_callback(&counter);
        let task = TaskContext::new(|_| Ok("done".to_string()), callback);

        task.execute();
        assert!(task.blocking_cancel(Duration::ZERO));

        assert_eq!(receiver.recv().unwrap(), Ok("done".to_string()));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_before_execute_skips_body() {
        let counter = Arc::new(AtomicUsize::new(0));
        let body_ran = Arc::new(AtomicBool::new(false));
        let (callback, receiver) = recording_callback(&counter);

        let flag = Arc::clone(&body_ran);
        let task = TaskContext::new(
            move |_| {
                flag.store(true, Ordering::SeqCst);
                Ok("unexpected".to_string())
            },
            callback,
        );

        // Nothing has run yet, so the wait times out.
        assert!(!task.blocking_cancel(Duration::ZERO));
        task.execute();

        assert!(!body_ran.load(Ordering::SeqCst));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(receiver.recv().unwrap().unwrap_err().is_cancelled());
    }

    #[test]
    fn test_cancel_token_before_execute() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (callback, receiver) = recording_callback(&counter);
        let task = TaskContext::new(|_| Ok("unexpected".to_string()), callback);

        task.cancel_token().cancel();
        assert!(task.cancellation_context().is_cancelled());
        task.execute();

        assert!(receiver.recv().unwrap().unwrap_err().is_cancelled());
    }

    #[test]
    fn test_shared_context_cancels_task() {
        let counter = Arc::new(AtomicUsize::new(0));
        let body_ran = Arc::new(AtomicBool::new(false));
        let (callback, receiver) = recording_callback(&counter);

        let context = CancellationContext::new();
        let flag = Arc::clone(&body_ran);
        let task = TaskContext::with_context(
            move |_| {
                flag.store(true, Ordering::SeqCst);
                Ok("unexpected".to_string())
            },
            callback,
            context.clone(),
        );
        assert!(task.cancellation_context().same_context(&context));

        context.cancel_operation();
        task.execute();

        assert!(!body_ran.load(Ordering::SeqCst));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(receiver.recv().unwrap().unwrap_err().is_cancelled());
    }

    #[test]
    fn test_shared_context_reaches_running_body() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (callback, receiver) = recording_callback(&counter);

        let context = CancellationContext::new();
        let outer = context.clone();
        let task = TaskContext::with_context(
            move |inner: CancellationContext| {
                // Cancelling the shared context is visible to the body.
                outer.cancel_operation();
                assert!(inner.is_cancelled());
                Ok("late".to_string())
            },
            callback,
            context,
        );
        task.execute();

        assert!(receiver.recv().unwrap().unwrap_err().is_cancelled());
    }

    #[test]
    fn test_cancel_during_execution_replaces_result() {
        let started = Arc::new(Condition::new());
        let resume = Arc::new(Condition::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let (callback, receiver) = recording_callback(&counter);

        let (started_signal, resume_wait) = (Arc::clone(&started), Arc::clone(&resume));
        let task = TaskContext::new(
            move |context: CancellationContext| {
                started_signal.notify();
                assert!(resume_wait.wait(DEFAULT_WAIT_TIMEOUT));
                assert!(context.is_cancelled());
                Ok("finished anyway".to_string())
            },
            callback,
        );

        let runner = task.clone();
        let handle = thread::spawn(move || runner.execute());

        assert!(started.wait(DEFAULT_WAIT_TIMEOUT));
        task.cancel_token().cancel();
        resume.notify();
        handle.join().unwrap();

        assert!(receiver.recv().unwrap().unwrap_err().is_cancelled());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timeout_result_survives_cancel() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (callback, receiver) = recording_callback(&counter);
        let task = TaskContext::new(
            |context: CancellationContext| {
                context.cancel_operation();
                Err(ApiError::timeout())
            },
            callback,
        );

        task.execute();
        let response = receiver.recv().unwrap();
        assert_eq!(response.unwrap_err().code(), ErrorCode::RequestTimeout);
    }

    #[test]
    fn test_blocking_cancel_waits_for_execution() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (callback, receiver) = recording_callback(&counter);
        let task = TaskContext::new(
            |context: CancellationContext| {
                assert!(context.is_cancelled());
                Ok("ignored".to_string())
            },
            callback,
        );

        let canceller = task.clone();
        let cancel_thread = thread::spawn(move || canceller.blocking_cancel(DEFAULT_WAIT_TIMEOUT));

        // The executor picks the task up only after the cancel landed.
        let runner = task.clone();
        let execute_thread = thread::spawn(move || {
            while !runner.cancellation_context().is_cancelled() {
                thread::yield_now();
            }
            runner.execute();
        });

        execute_thread.join().unwrap();
        assert!(cancel_thread.join().unwrap());
        assert!(receiver.recv().unwrap().unwrap_err().is_cancelled());
    }

    #[test]
    fn test_cancel_races_completion() {
        for _ in 0..200 {
            let counter = Arc::new(AtomicUsize::new(0));
            let (callback, receiver) = recording_callback(&counter);
            let task = TaskContext::new(|_| Ok("value".to_string()), callback);

            let runner = task.clone();
            let token = task.cancel_token();
            let execute = thread::spawn(move || runner.execute());
            let cancel = thread::spawn(move || token.cancel());
            execute.join().unwrap();
            cancel.join().unwrap();

            assert_eq!(counter.load(Ordering::SeqCst), 1);
            let response = receiver.recv().unwrap();
            assert!(response.is_ok() || response.unwrap_err().is_cancelled());
        }
    }

    #[test]
    fn test_identity() {
        let first = TaskContext::new(|_| Ok(1), |_| {});
        let second = TaskContext::new(|_| Ok(2), |_| {});

        let mut set = HashSet::new();
        assert!(set.insert(first.clone()));
        assert!(!set.insert(first.clone()));
        assert!(set.insert(second.clone()));
        assert_eq!(first, first.clone());
        assert_ne!(first, second);
    }
}
