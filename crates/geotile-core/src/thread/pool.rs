//! A fixed-size thread pool implementing [`TaskScheduler`].

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crate::error::{ApiError, ErrorCode};
use crate::thread::scheduler::{Priority, Task, TaskScheduler};

/// Runs tasks on a fixed number of named worker threads.
///
/// Tasks are taken in priority order, first-in first-out within one priority.
/// Dropping the scheduler closes the queue, lets the workers drain what was
/// already accepted, and joins them.
pub struct ThreadPoolTaskScheduler {
    queue: Arc<SyncQueue>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPoolTaskScheduler {
    /// Spawn `thread_count` workers (at least one).
    ///
    /// # Errors
    ///
    /// Returns an error if a worker thread cannot be spawned.
    pub fn new(thread_count: usize) -> Result<Self, ApiError> {
        let queue = Arc::new(SyncQueue::default());
        let mut workers = Vec::with_capacity(thread_count.max(1));

        for index in 0..thread_count.max(1) {
            let name = format!("geotile-pool-{index}");
            let worker_queue = Arc::clone(&queue);
            let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
                tracing::info!(thread = %name, "starting worker thread");
                while let Some(task) = worker_queue.pull() {
                    task();
                }
            });

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    queue.close();
                    for worker in workers {
                        let _ = worker.join();
                    }
                    return Err(ApiError::new(
                        ErrorCode::InternalFailure,
                        format!("failed to spawn worker thread: {e}"),
                    ));
                }
            }
        }

        Ok(Self { queue, workers })
    }

    /// Number of worker threads.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }
}

impl TaskScheduler for ThreadPoolTaskScheduler {
    fn schedule_task_with_priority(&self, task: Task, priority: Priority) -> Result<(), ApiError> {
        if self.queue.push(task, priority) {
            Ok(())
        } else {
            Err(ApiError::new(
                ErrorCode::ServiceUnavailable,
                "task scheduler is shut down",
            ))
        }
    }
}

impl Drop for ThreadPoolTaskScheduler {
    fn drop(&mut self) {
        self.queue.close();
        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            // A task holding the last handle drops the pool on a worker thread.
            if worker.thread().id() == current {
                continue;
            }
            let _ = worker.join();
        }
    }
}

struct PrioritizedTask {
    task: Task,
    priority: Priority,
    sequence: u64,
}

impl PartialEq for PrioritizedTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PrioritizedTask {}

impl PartialOrd for PrioritizedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PrioritizedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then the lower sequence number.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Default)]
struct SyncQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<PrioritizedTask>,
    next_sequence: u64,
    closed: bool,
}

impl SyncQueue {
    fn push(&self, task: Task, priority: Priority) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return false;
        }
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.heap.push(PrioritizedTask {
            task,
            priority,
            sequence,
        });
        self.available.notify_one();
        true
    }

    /// Block until a task is available; `None` once closed and drained.
    fn pull(&self) -> Option<Task> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(entry) = state.heap.pop() {
                return Some(entry.task);
            }
            if state.closed {
                return None;
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn close(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed = true;
        self.available.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{Condition, DEFAULT_WAIT_TIMEOUT};
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::mpsc;

    #[test]
    fn test_runs_all_tasks() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let scheduler = ThreadPoolTaskScheduler::new(4).unwrap();
            assert_eq!(scheduler.thread_count(), 4);
            for _ in 0..100 {
                let counter = Arc::clone(&counter);
                scheduler
                    .schedule_task(Box::new(move || {
                        counter.fetch_add(1, AtomicOrdering::SeqCst);
                    }))
                    .unwrap();
            }
        }
        // Dropping the scheduler drains the queue.
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 100);
    }

    #[test]
    fn test_priority_order() {
        let scheduler = ThreadPoolTaskScheduler::new(1).unwrap();
        let gate = Arc::new(Condition::new());
        let (sender, receiver) = mpsc::channel();

        // Block the only worker so the queue fills up.
        let blocker = Arc::clone(&gate);
        scheduler
            .schedule_task(Box::new(move || {
                assert!(blocker.wait(DEFAULT_WAIT_TIMEOUT));
            }))
            .unwrap();

        for (label, priority) in [
            ("low", Priority::LOW),
            ("normal-1", Priority::NORMAL),
            ("high", Priority::HIGH),
            ("normal-2", Priority::NORMAL),
        ] {
            let sender = sender.clone();
            scheduler
                .schedule_task_with_priority(Box::new(move || sender.send(label).unwrap()), priority)
                .unwrap();
        }

        gate.notify();
        let order: Vec<_> = (0..4).map(|_| receiver.recv().unwrap()).collect();
        assert_eq!(order, ["high", "normal-1", "normal-2", "low"]);
    }

    #[test]
    fn test_zero_threads_spawns_one() {
        let scheduler = ThreadPoolTaskScheduler::new(0).unwrap();
        assert_eq!(scheduler.thread_count(), 1);
    }

    #[test]
    fn test_rejects_after_close() {
        let scheduler = ThreadPoolTaskScheduler::new(1).unwrap();
        scheduler.queue.close();
        let error = scheduler.schedule_task(Box::new(|| {})).unwrap_err();
        assert_eq!(error.code(), ErrorCode::ServiceUnavailable);
    }

    #[test]
    fn test_worker_threads_are_named() {
        let scheduler = ThreadPoolTaskScheduler::new(1).unwrap();
        let (sender, receiver) = mpsc::channel();
        scheduler
            .schedule_task(Box::new(move || {
                let name = thread::current().name().map(str::to_owned);
                sender.send(name).unwrap();
            }))
            .unwrap();
        assert_eq!(receiver.recv().unwrap().as_deref(), Some("geotile-pool-0"));
    }
}
