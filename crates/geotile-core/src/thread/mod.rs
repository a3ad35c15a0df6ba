//! Task scheduling and continuation chains.

mod continuation;
mod pool;
mod scheduler;

pub use continuation::{Continuation, ContinuationHandle, ContinuationState, Next, TaskContinuation};
pub use pool::ThreadPoolTaskScheduler;
pub use scheduler::{Priority, Task, TaskScheduler, execute_or_schedule};
