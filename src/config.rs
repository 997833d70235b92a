//! Scheduler configuration.

use serde::{Deserialize, Serialize};

/// Number of fibers preallocated per worker thread.
pub const MAX_FIBERS_PER_THREAD: usize = 128;

/// Default fiber stack size (64 KiB).
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Configuration for a [`TaskScheduler`](crate::TaskScheduler).
///
/// Every field has a default, so partial configs deserialize cleanly:
///
/// ```
/// let config: fibertask::SchedulerConfig =
///     serde_json::from_str(r#"{ "threads": 2 }"#).unwrap();
/// assert_eq!(config.threads, 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Total number of workers, including the main thread (worker 0).
    pub threads: usize,
    /// Stack size for each fiber in bytes.
    pub stack_size: usize,
    /// Fibers preallocated per worker at construction.
    pub fibers_per_thread: usize,
    /// Capacity of the fiber arena. Fibers allocated past this bound are
    /// freed after a single use instead of being pooled.
    pub max_fibers: usize,
    /// How long an idle worker sleeps between scans, in microseconds.
    pub idle_sleep_us: u64,
    /// Prefix for worker thread names; the worker index is appended.
    pub thread_name_prefix: String,
}

impl SchedulerConfig {
    /// Default configuration with an explicit worker count.
    pub fn with_threads(threads: usize) -> Self {
        Self {
            threads,
            ..Self::default()
        }
    }

    /// Number of fibers created up front.
    pub fn preallocated_fibers(&self) -> usize {
        self.threads * self.fibers_per_thread
    }

    /// Arena capacity actually used: never below the preallocated count.
    pub(crate) fn arena_capacity(&self) -> usize {
        self.max_fibers.max(self.preallocated_fibers())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            threads,
            stack_size: DEFAULT_STACK_SIZE,
            fibers_per_thread: MAX_FIBERS_PER_THREAD,
            max_fibers: threads * MAX_FIBERS_PER_THREAD * 4,
            idle_sleep_us: 1,
            thread_name_prefix: "fibertask-worker-".to_string(),
        }
    }
}
