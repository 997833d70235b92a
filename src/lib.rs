//! # fibertask - Cooperative Fiber-Based Task Scheduler
//!
//! A fixed pool of OS worker threads runs a much larger number of short-lived
//! tasks. Every task runs on a pooled fiber (a stackful coroutine), so a task
//! can spawn more tasks and suspend itself while it waits for them without
//! ever blocking its OS thread.
//!
//! ## Architecture
//!
//! - **Counter**: fan-in primitive; counts outstanding tasks and parks fibers
//!   that wait on it in a lock-free intrusive list
//! - **Fiber**: recycled stackful execution context running one task at a time
//! - **FiberPool**: lock-free free-list of idle fibers
//! - **Worker**: one OS thread with a work-stealing deque. Worker 0 is the
//!   application's own main thread, driven by `pump_main_thread_tasks`
//! - **TaskScheduler**: spawn / wait / parallel-for / main-thread affinity
//!
//! ## Example
//!
//! ```no_run
//! use fibertask::{Counter, TaskScheduler};
//!
//! let scheduler = TaskScheduler::new(4).unwrap();
//! scheduler.init_main_thread_worker().unwrap();
//!
//! let counter = Counter::new(0);
//! let handle = scheduler.handle();
//! scheduler.spawn(
//!     move || {
//!         let inner = Counter::new(0);
//!         handle.parallel_for(1000, 100, |start, end| {
//!             println!("chunk {start}..{end}");
//!         }, Some(&inner));
//!         handle.wait_for_counter(&inner);
//!     },
//!     Some(&counter),
//! );
//!
//! scheduler.wait_for_counter_with(&counter, || scheduler.pump_main_thread_tasks());
//! ```

pub mod config;
pub mod counter;
pub mod error;
pub mod fiber;
mod fiber_pool;
pub mod scheduler;
mod worker;

pub use config::{MAX_FIBERS_PER_THREAD, SchedulerConfig};
pub use counter::Counter;
pub use error::SchedulerError;
pub use fiber_pool::PoolStats;
pub use scheduler::{Scheduler, TaskScheduler};
