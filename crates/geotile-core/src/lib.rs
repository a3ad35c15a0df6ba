//! Cancellation, task and scheduling primitives for the geotile platform SDK.
//!
//! Every asynchronous SDK operation is built from the types in this crate:
//!
//! - [`CancellationContext`] carries the cancellation state of one logical
//!   operation across its steps, and [`CancellationToken`] aborts one step.
//! - [`TaskContext`] packages a body, a result callback and a context into a
//!   unit of work that a [`TaskScheduler`](thread::TaskScheduler) can run.
//! - [`PendingRequests`] tracks a client's outstanding operations so they can
//!   be cancelled together.
//! - [`TaskContinuation`](thread::TaskContinuation) chains dependent steps.
//! - [`Condition`] and the backdown strategies support bounded waiting and
//!   retry pacing.
//!
//! # Example
//!
//! ```
//! use geotile_core::{CancellationContext, CancellationToken};
//!
//! let context = CancellationContext::new();
//! let started = context.execute_or_cancelled(
//!     || CancellationToken::new(|| println!("aborting request")),
//!     || println!("never started"),
//! );
//! assert!(started);
//!
//! // Prints "aborting request".
//! context.cancel_operation();
//! assert!(context.is_cancelled());
//! ```

mod backoff;
mod cancellation;
mod condition;
mod error;
mod pending_requests;
mod task_context;
pub mod thread;

pub use backoff::{BackdownStrategy, ExponentialBackdownStrategy};
pub use cancellation::{CancellationContext, CancellationToken};
pub use condition::{Condition, DEFAULT_WAIT_TIMEOUT};
pub use error::{ApiError, ApiResponse, ErrorCode};
pub use pending_requests::{PendingRequests, RequestKey};
pub use task_context::TaskContext;
