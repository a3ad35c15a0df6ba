//! Chains of dependent asynchronous steps.
//!
//! A chain starts with [`TaskContinuation::new`] and grows with
//! [`then`](Continuation::then) and [`then_async`](Continuation::then_async).
//! Nothing runs until [`run`](Continuation::run) is called with the final
//! callback. Every step is submitted to the scheduler as its own task, and the
//! next step is submitted only once the previous one produced a value. An
//! error, a cancellation or a scheduler rejection skips the remaining steps
//! and goes straight to the final callback.
//!
//! All steps share one [`CancellationContext`]; cancelling it aborts
//! whichever step is in flight (through the tokens it registered with
//! [`CancellationContext::execute_or_cancelled`]) and keeps later steps from
//! starting.
//!
//! ```
//! use std::sync::{mpsc, Arc};
//! use geotile_core::thread::{TaskContinuation, ThreadPoolTaskScheduler};
//!
//! let scheduler = Arc::new(ThreadPoolTaskScheduler::new(1).unwrap());
//! let (sender, receiver) = mpsc::channel();
//!
//! TaskContinuation::new(scheduler)
//!     .then(|_context| Ok(20))
//!     .then(|_context, value| Ok(value + 1))
//!     .then(|_context, value| Ok(value * 2))
//!     .run(move |response| sender.send(response).unwrap());
//!
//! assert_eq!(receiver.recv().unwrap(), Ok(42));
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::cancellation::{CancellationContext, CancellationToken};
use crate::error::{ApiError, ApiResponse, ErrorCode};
use crate::thread::scheduler::{Priority, TaskScheduler};

type Deliver<T> = Box<dyn FnOnce(ApiResponse<T>) + Send + 'static>;
type Chain<T> = Box<dyn FnOnce(Arc<ChainShared>, Deliver<T>) + Send + 'static>;

/// Lifecycle of a continuation chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationState {
    /// No step has run yet.
    Pending,
    /// A step is executing or scheduled.
    Running,
    /// Every step succeeded and the final callback got the result.
    Completed,
    /// The chain was cancelled.
    Cancelled,
    /// A step or the scheduler reported an error.
    Failed,
}

impl ContinuationState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Completed,
            3 => Self::Cancelled,
            4 => Self::Failed,
            _ => Self::Pending,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed => 2,
            Self::Cancelled => 3,
            Self::Failed => 4,
        }
    }
}

struct ChainShared {
    scheduler: Arc<dyn TaskScheduler>,
    priority: Priority,
    context: CancellationContext,
    state: AtomicU8,
}

impl ChainShared {
    fn state(&self) -> ContinuationState {
        let state = ContinuationState::from_u8(self.state.load(Ordering::Acquire));
        if state == ContinuationState::Pending && self.context.is_cancelled() {
            ContinuationState::Cancelled
        } else {
            state
        }
    }

    fn set_state(&self, state: ContinuationState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Submit `job` to the scheduler.
    ///
    /// The job receives `Ok(())` when it runs on the scheduler, or the
    /// rejection error on the calling thread if the scheduler refused it.
    fn schedule<J>(&self, job: J)
    where
        J: FnOnce(Result<(), ApiError>) + Send + 'static,
    {
        let slot = Arc::new(Mutex::new(Some(job)));
        let scheduled = Arc::clone(&slot);
        let submitted = self.scheduler.schedule_task_with_priority(
            Box::new(move || {
                if let Some(job) = take_job(&scheduled) {
                    job(Ok(()));
                }
            }),
            self.priority,
        );

        if let Err(error) = submitted {
            tracing::warn!(%error, "task scheduler rejected continuation step");
            if let Some(job) = take_job(&slot) {
                job(Err(error));
            }
        }
    }
}

fn take_job<J>(slot: &Mutex<Option<J>>) -> Option<J> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

/// Entry point of a continuation chain.
pub struct TaskContinuation {
    scheduler: Arc<dyn TaskScheduler>,
    priority: Priority,
    context: CancellationContext,
}

impl TaskContinuation {
    /// Start a chain whose steps run on `scheduler`.
    pub fn new(scheduler: Arc<dyn TaskScheduler>) -> Self {
        Self {
            scheduler,
            priority: Priority::NORMAL,
            context: CancellationContext::new(),
        }
    }

    /// Submit the chain's steps with `priority`.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Run the chain under an existing cancellation context.
    #[must_use]
    pub fn with_context(mut self, context: CancellationContext) -> Self {
        self.context = context;
        self
    }

    /// Add the first step.
    pub fn then<U, F>(self, step: F) -> Continuation<U>
    where
        U: Send + 'static,
        F: FnOnce(CancellationContext) -> ApiResponse<U> + Send + 'static,
    {
        self.start().then(move |context, ()| step(context))
    }

    /// Add a first step that completes through a [`Next`] handle.
    pub fn then_async<U, F>(self, step: F) -> Continuation<U>
    where
        U: Send + 'static,
        F: FnOnce(CancellationContext, Next<U>) + Send + 'static,
    {
        self.start()
            .then_async(move |context, (), next| step(context, next))
    }

    fn start(self) -> Continuation<()> {
        Continuation {
            shared: Arc::new(ChainShared {
                scheduler: self.scheduler,
                priority: self.priority,
                context: self.context,
                state: AtomicU8::new(ContinuationState::Pending.as_u8()),
            }),
            chain: Box::new(|_, deliver| deliver(Ok(()))),
        }
    }
}

/// A chain whose last step produces a `T`.
pub struct Continuation<T> {
    shared: Arc<ChainShared>,
    chain: Chain<T>,
}

impl<T: Send + 'static> Continuation<T> {
    /// Append a step that maps the previous result.
    pub fn then<U, F>(self, step: F) -> Continuation<U>
    where
        U: Send + 'static,
        F: FnOnce(CancellationContext, T) -> ApiResponse<U> + Send + 'static,
    {
        self.then_async(move |context, value, next| {
            let response = step(context, value);
            next.complete(response);
        })
    }

    /// Append a step that completes through a [`Next`] handle.
    ///
    /// The step may hand `next` to an asynchronous operation and return right
    /// away; the chain continues when `next` is completed.
    pub fn then_async<U, F>(self, step: F) -> Continuation<U>
    where
        U: Send + 'static,
        F: FnOnce(CancellationContext, T, Next<U>) + Send + 'static,
    {
        let Self { shared, chain } = self;
        Continuation {
            shared: Arc::clone(&shared),
            chain: Box::new(move |shared: Arc<ChainShared>, deliver: Deliver<U>| {
                let step_shared = Arc::clone(&shared);
                chain(
                    shared,
                    Box::new(move |previous: ApiResponse<T>| {
                        let value = match previous {
                            Ok(value) => value,
                            Err(error) => return deliver(Err(error)),
                        };

                        let job_shared = Arc::clone(&step_shared);
                        step_shared.schedule(move |scheduled| {
                            if let Err(error) = scheduled {
                                return deliver(Err(error));
                            }
                            let context = job_shared.context.clone();
                            if context.is_cancelled() {
                                return deliver(Err(ApiError::cancelled()));
                            }
                            let next = Next {
                                deliver: Some(deliver),
                                context: context.clone(),
                            };
                            step(context, value, next);
                        });
                    }),
                );
            }),
        }
    }

    /// A token that cancels the whole chain.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        cancel_token_for(&self.shared)
    }

    /// Current state of the chain.
    #[must_use]
    pub fn state(&self) -> ContinuationState {
        self.shared.state()
    }

    /// Start the chain and deliver its outcome to `finally`.
    ///
    /// A chain cancelled before this call delivers the cancellation error
    /// without running any step. A chain cancelled while running delivers the
    /// cancellation error even if its last step succeeded.
    pub fn run<F>(self, finally: F) -> ContinuationHandle
    where
        F: FnOnce(ApiResponse<T>) + Send + 'static,
    {
        let Self { shared, chain } = self;
        let handle = ContinuationHandle {
            shared: Arc::clone(&shared),
        };

        if shared.context.is_cancelled() {
            shared.set_state(ContinuationState::Cancelled);
            finally(Err(ApiError::cancelled()));
            return handle;
        }

        shared.set_state(ContinuationState::Running);
        let final_shared = Arc::clone(&shared);
        chain(
            shared,
            Box::new(move |response| {
                let response = match response {
                    Ok(_) if final_shared.context.is_cancelled() => Err(ApiError::cancelled()),
                    other => other,
                };
                let state = match &response {
                    Ok(_) => ContinuationState::Completed,
                    Err(error) if error.is_cancelled() => ContinuationState::Cancelled,
                    Err(_) => ContinuationState::Failed,
                };
                final_shared.set_state(state);
                finally(response);
            }),
        );
        handle
    }
}

impl<T> fmt::Debug for Continuation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("state", &self.shared.state())
            .finish_non_exhaustive()
    }
}

fn cancel_token_for(shared: &Arc<ChainShared>) -> CancellationToken {
    let context = shared.context.clone();
    CancellationToken::new(move || context.cancel_operation())
}

/// Observes and cancels a running chain.
#[derive(Clone)]
pub struct ContinuationHandle {
    shared: Arc<ChainShared>,
}

impl ContinuationHandle {
    /// Current state of the chain.
    #[must_use]
    pub fn state(&self) -> ContinuationState {
        self.shared.state()
    }

    /// Cancel the chain.
    pub fn cancel(&self) {
        self.shared.context.cancel_operation();
    }

    /// A token that cancels the chain.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        cancel_token_for(&self.shared)
    }
}

impl fmt::Debug for ContinuationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContinuationHandle")
            .field("state", &self.state())
            .finish()
    }
}

/// Completes one asynchronous step.
///
/// Completing or dropping it releases the token the step registered, so a
/// later cancel reaches the step that runs next. Dropping it without
/// completing ends the chain: with the cancellation error if the chain was
/// cancelled, otherwise with an [`ErrorCode::Unknown`] error.
pub struct Next<U> {
    deliver: Option<Deliver<U>>,
    context: CancellationContext,
}

impl<U> Next<U> {
    /// Hand the step's response to the chain.
    pub fn complete(mut self, response: ApiResponse<U>) {
        if let Some(deliver) = self.deliver.take() {
            self.context.release_token();
            deliver(response);
        }
    }

    /// Complete the step with a value.
    pub fn succeed(self, value: U) {
        self.complete(Ok(value));
    }

    /// Fail the step, skipping the rest of the chain.
    pub fn fail(self, error: ApiError) {
        self.complete(Err(error));
    }
}

impl<U> Drop for Next<U> {
    fn drop(&mut self) {
        if let Some(deliver) = self.deliver.take() {
            let error = if self.context.is_cancelled() {
                ApiError::cancelled()
            } else {
                ApiError::new(ErrorCode::Unknown, "continuation step finished without a result")
            };
            self.context.release_token();
            deliver(Err(error));
        }
    }
}

impl<U> fmt::Debug for Next<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("pending", &self.deliver.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{Condition, DEFAULT_WAIT_TIMEOUT};
    use crate::thread::pool::ThreadPoolTaskScheduler;
    use crate::thread::scheduler::Task;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn scheduler() -> Arc<dyn TaskScheduler> {
        Arc::new(ThreadPoolTaskScheduler::new(2).unwrap())
    }

    struct RejectingScheduler;

    impl TaskScheduler for RejectingScheduler {
        fn schedule_task_with_priority(&self, _task: Task, _priority: Priority) -> Result<(), ApiError> {
            Err(ApiError::new(ErrorCode::ServiceUnavailable, "closed"))
        }
    }

    /// Runs tasks inline and remembers the priority of each.
    #[derive(Default)]
    struct RecordingScheduler {
        priorities: Mutex<Vec<Priority>>,
    }

    impl TaskScheduler for RecordingScheduler {
        fn schedule_task_with_priority(&self, task: Task, priority: Priority) -> Result<(), ApiError> {
            self.priorities.lock().unwrap().push(priority);
            task();
            Ok(())
        }
    }

    #[test]
    fn test_sequential_steps() {
        let (sender, receiver) = mpsc::channel();
        let handle = TaskContinuation::new(scheduler())
            .then(|_| Ok(1))
            .then(|_, value| {
                assert_eq!(value, 1);
                Ok(2)
            })
            .then(|_, value| {
                assert_eq!(value, 2);
                Ok(format!("step {}", value + 1))
            })
            .run(move |response| sender.send(response).unwrap());

        assert_eq!(receiver.recv().unwrap(), Ok("step 3".to_string()));
        assert_eq!(handle.state(), ContinuationState::Completed);
    }

    #[test]
    fn test_steps_run_on_scheduler() {
        let (sender, receiver) = mpsc::channel();
        let caller = thread::current().id();
        TaskContinuation::new(scheduler())
            .then(move |_| Ok(thread::current().id() != caller))
            .run(move |response| sender.send(response).unwrap());

        assert_eq!(receiver.recv().unwrap(), Ok(true));
    }

    #[test]
    fn test_cancel_before_run() {
        let ran = Arc::new(AtomicBool::new(false));
        let (sender, receiver) = mpsc::channel();

        let flag = Arc::clone(&ran);
        let continuation = TaskContinuation::new(scheduler()).then(move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok(1)
        });

        continuation.cancel_token().cancel();
        assert_eq!(continuation.state(), ContinuationState::Cancelled);

        let handle = continuation.run(move |response| sender.send(response).unwrap());
        assert!(receiver.recv().unwrap().unwrap_err().is_cancelled());
        assert_eq!(handle.state(), ContinuationState::Cancelled);
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_error_skips_remaining_steps() {
        let ran = Arc::new(AtomicBool::new(false));
        let (sender, receiver) = mpsc::channel();

        let flag = Arc::clone(&ran);
        let handle = TaskContinuation::new(scheduler())
            .then(|_| Ok(1))
            .then(|_, _value| -> ApiResponse<i32> {
                Err(ApiError::new(ErrorCode::BadRequest, "Bad Request"))
            })
            .then(move |_, value| {
                flag.store(true, Ordering::SeqCst);
                Ok(value)
            })
            .run(move |response| sender.send(response).unwrap());

        let error = receiver.recv().unwrap().unwrap_err();
        assert_eq!(error.code(), ErrorCode::BadRequest);
        assert_eq!(handle.state(), ContinuationState::Failed);
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_cancel_mid_flight() {
        let started = Arc::new(Condition::new());
        let resume = Arc::new(Condition::new());
        let third_ran = Arc::new(AtomicBool::new(false));
        let (sender, receiver) = mpsc::channel();

        let (started_signal, resume_wait) = (Arc::clone(&started), Arc::clone(&resume));
        let flag = Arc::clone(&third_ran);
        let handle = TaskContinuation::new(scheduler())
            .then(|_| Ok("first"))
            .then(move |context, _| {
                started_signal.notify();
                assert!(resume_wait.wait(DEFAULT_WAIT_TIMEOUT));
                assert!(context.is_cancelled());
                Ok("second")
            })
            .then(move |_, value| {
                flag.store(true, Ordering::SeqCst);
                Ok(value)
            })
            .run(move |response| sender.send(response).unwrap());

        assert!(started.wait(DEFAULT_WAIT_TIMEOUT));
        assert_eq!(handle.state(), ContinuationState::Running);
        handle.cancel();
        resume.notify();

        assert!(receiver.recv().unwrap().unwrap_err().is_cancelled());
        assert!(!third_ran.load(Ordering::SeqCst));
        assert_eq!(handle.state(), ContinuationState::Cancelled);
    }

    #[test]
    fn test_cancel_reaches_in_flight_step() {
        let aborted = Arc::new(AtomicBool::new(false));
        let (sender, receiver) = mpsc::channel();
        let (registered_sender, registered) = mpsc::channel();

        let flag = Arc::clone(&aborted);
        let handle = TaskContinuation::new(scheduler())
            .then_async(move |context, next: Next<u32>| {
                // The "request" is pending until its abort hook fires.
                let slot = Arc::new(Mutex::new(Some(next)));
                context.execute_or_cancelled(
                    || {
                        let slot = Arc::clone(&slot);
                        CancellationToken::new(move || {
                            flag.store(true, Ordering::SeqCst);
                            if let Some(next) = take_job(&slot) {
                                next.fail(ApiError::cancelled());
                            }
                        })
                    },
                    || {},
                );
                registered_sender.send(()).unwrap();
            })
            .run(move |response| sender.send(response).unwrap());

        registered.recv().unwrap();
        handle.cancel_token().cancel();

        assert!(receiver.recv().unwrap().unwrap_err().is_cancelled());
        assert!(aborted.load(Ordering::SeqCst));
    }

    #[test]
    fn test_async_step_completes_later() {
        let (sender, receiver) = mpsc::channel();
        TaskContinuation::new(scheduler())
            .then(|_| Ok(5))
            .then_async(|_, value, next| {
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(10));
                    next.succeed(value * 10);
                });
            })
            .run(move |response| sender.send(response).unwrap());

        assert_eq!(receiver.recv().unwrap(), Ok(50));
    }

    #[test]
    fn test_dropped_next_fails_chain() {
        let (sender, receiver) = mpsc::channel();
        let handle = TaskContinuation::new(scheduler())
            .then_async(|_, _next: Next<i32>| {})
            .run(move |response| sender.send(response).unwrap());

        let error = receiver.recv().unwrap().unwrap_err();
        assert_eq!(error.code(), ErrorCode::Unknown);
        assert_eq!(handle.state(), ContinuationState::Failed);
    }

    #[test]
    fn test_scheduler_rejection_fails_chain() {
        let (sender, receiver) = mpsc::channel();
        let handle = TaskContinuation::new(Arc::new(RejectingScheduler))
            .then(|_| Ok(1))
            .run(move |response| sender.send(response).unwrap());

        let error = receiver.recv().unwrap().unwrap_err();
        assert_eq!(error.code(), ErrorCode::ServiceUnavailable);
        assert_eq!(handle.state(), ContinuationState::Failed);
    }

    #[test]
    fn test_cancel_after_completion_keeps_result() {
        let (sender, receiver) = mpsc::channel();
        let handle = TaskContinuation::new(scheduler())
            .then(|_| Ok(1))
            .run(move |response| sender.send(response).unwrap());

        assert_eq!(receiver.recv().unwrap(), Ok(1));
        handle.cancel();
        assert_eq!(handle.state(), ContinuationState::Completed);
    }

    #[test]
    fn test_steps_use_chain_priority() {
        let recording = Arc::new(RecordingScheduler::default());
        let (sender, receiver) = mpsc::channel();
        TaskContinuation::new(Arc::clone(&recording) as Arc<dyn TaskScheduler>)
            .with_priority(Priority::HIGH)
            .then(|_| Ok(1))
            .then(|_, value| Ok(value + 1))
            .run(move |response| sender.send(response).unwrap());

        assert_eq!(receiver.recv().unwrap(), Ok(2));
        assert_eq!(
            *recording.priorities.lock().unwrap(),
            [Priority::HIGH, Priority::HIGH]
        );
    }

    #[test]
    fn test_external_context_cancels_chain() {
        let context = CancellationContext::new();
        let started = Arc::new(Condition::new());
        let resume = Arc::new(Condition::new());
        let (sender, receiver) = mpsc::channel();

        let (started_signal, resume_wait) = (Arc::clone(&started), Arc::clone(&resume));
        let handle = TaskContinuation::new(scheduler())
            .with_context(context.clone())
            .then(move |_| {
                started_signal.notify();
                assert!(resume_wait.wait(DEFAULT_WAIT_TIMEOUT));
                Ok(1)
            })
            .then(|_, value| Ok(value + 1))
            .run(move |response| sender.send(response).unwrap());

        assert!(started.wait(DEFAULT_WAIT_TIMEOUT));
        context.cancel_operation();
        resume.notify();

        assert!(receiver.recv().unwrap().unwrap_err().is_cancelled());
        assert_eq!(handle.state(), ContinuationState::Cancelled);
    }

    #[test]
    fn test_external_context_cancelled_before_run() {
        let context = CancellationContext::new();
        context.cancel_operation();

        let (sender, receiver) = mpsc::channel();
        let handle = TaskContinuation::new(scheduler())
            .with_context(context)
            .then(|_| Ok(1))
            .run(move |response| sender.send(response).unwrap());

        assert!(receiver.recv().unwrap().unwrap_err().is_cancelled());
        assert_eq!(handle.state(), ContinuationState::Cancelled);
    }

    #[test]
    fn test_finished_step_token_is_released() {
        let first_aborted = Arc::new(AtomicBool::new(false));
        let started = Arc::new(Condition::new());
        let resume = Arc::new(Condition::new());
        let (sender, receiver) = mpsc::channel();

        let flag = Arc::clone(&first_aborted);
        let (started_signal, resume_wait) = (Arc::clone(&started), Arc::clone(&resume));
        let handle = TaskContinuation::new(scheduler())
            .then(move |context| {
                let ran = context.execute_or_cancelled(
                    || CancellationToken::new(move || flag.store(true, Ordering::SeqCst)),
                    || {},
                );
                assert!(ran);
                Ok(1)
            })
            .then(move |_, value| {
                started_signal.notify();
                assert!(resume_wait.wait(DEFAULT_WAIT_TIMEOUT));
                Ok(value + 1)
            })
            .run(move |response| sender.send(response).unwrap());

        assert!(started.wait(DEFAULT_WAIT_TIMEOUT));
        handle.cancel();
        resume.notify();

        assert!(receiver.recv().unwrap().unwrap_err().is_cancelled());
        // The first step finished before the cancel, so its hook stays quiet.
        assert!(!first_aborted.load(Ordering::SeqCst));
    }

    #[test]
    fn test_dropped_next_releases_token() {
        let aborted = Arc::new(AtomicBool::new(false));
        let started = Arc::new(Condition::new());
        let resume = Arc::new(Condition::new());
        let (sender, receiver) = mpsc::channel();

        let flag = Arc::clone(&aborted);
        let (started_signal, resume_wait) = (Arc::clone(&started), Arc::clone(&resume));
        let handle = TaskContinuation::new(scheduler())
            .then_async(move |context, next: Next<i32>| {
                context.execute_or_cancelled(
                    || CancellationToken::new(move || flag.store(true, Ordering::SeqCst)),
                    || {},
                );
                drop(next);
            })
            .run(move |response| {
                started_signal.notify();
                assert!(resume_wait.wait(DEFAULT_WAIT_TIMEOUT));
                sender.send(response).unwrap();
            });

        assert!(started.wait(DEFAULT_WAIT_TIMEOUT));
        handle.cancel();
        resume.notify();

        assert_eq!(receiver.recv().unwrap().unwrap_err().code(), ErrorCode::Unknown);
        assert!(!aborted.load(Ordering::SeqCst));
    }
}
