//! Error types for scheduler construction and lifecycle calls.

use thiserror::Error;

/// Errors reported by [`TaskScheduler`](crate::TaskScheduler) lifecycle operations.
///
/// The hot path (`spawn`, `wait_for_counter`, `parallel_for`) never fails;
/// only construction, thread binding and shutdown report errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A scheduler needs at least one worker (the main thread).
    #[error("a scheduler needs at least one worker thread")]
    NoThreads,

    /// The OS refused to create a worker thread.
    #[error("failed to spawn worker thread {index}")]
    Spawn {
        index: usize,
        #[source]
        source: std::io::Error,
    },

    /// Worker 0 is already owned by a different OS thread.
    #[error("the main worker is already bound to another thread")]
    MainThreadBound,

    /// The calling thread already drives a worker of some scheduler.
    #[error("this thread is already bound to a worker")]
    ThreadBound,

    /// One or more worker threads panicked outside of a task.
    #[error("{0} worker thread(s) panicked")]
    WorkerPanicked(usize),
}
