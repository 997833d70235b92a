//! The task scheduler: spawning, waiting, parallel loops and main-thread affinity.
//!
//! [`TaskScheduler`] owns the worker threads and stops them when dropped.
//! [`Scheduler`] is a cheap, clonable handle to the same scheduler that
//! tasks capture to spawn and wait on nested work.

use crate::config::SchedulerConfig;
use crate::counter::{Counter, Waiters};
use crate::error::SchedulerError;
use crate::fiber::{self, Affinity, Fiber, FiberHandle, FiberState, Task};
use crate::fiber_pool::{FiberPool, PoolStats};
use crate::worker::{self, Worker, WorkerContext};
use crossbeam::deque::{Injector, Steal};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

/// State shared by every thread of one scheduler.
pub(crate) struct Shared {
    config: SchedulerConfig,
    workers: Box<[Worker]>,
    /// Entry queue for work spawned from threads that are not workers.
    injector: Injector<FiberHandle>,
    /// Main-thread-only fibers submitted from other threads.
    main_queue: Mutex<VecDeque<FiberHandle>>,
    pool: FiberPool,
    running: AtomicBool,
}

impl Shared {
    pub(crate) fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn prepare(
        &self,
        task: Task,
        counter: Option<&Counter>,
        name: Option<&'static str>,
        affinity: Affinity,
    ) -> FiberHandle {
        let handle = self.pool.allocate();
        // SAFETY: a freshly allocated fiber belongs to us alone.
        let fiber = unsafe { handle.as_ref() };
        fiber.reset(task, counter.cloned(), name, affinity);
        // Counted before the fiber is visible to any queue, so it cannot
        // finish and observe a premature zero.
        if let Some(counter) = counter {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        handle
    }

    fn push_ready(&self, context: Option<&WorkerContext>, handle: FiberHandle) {
        match context {
            Some(context) => context.push(handle),
            None => self.injector.push(handle),
        }
    }

    fn push_main(&self, context: Option<&WorkerContext>, handle: FiberHandle) {
        match context {
            Some(context) if context.is_main() => context.push_pinned(handle),
            _ => self.main_queue.lock().push_back(handle),
        }
    }

    /// Requeues a woken fiber, keeping main-thread fibers on the main thread.
    fn reschedule(&self, context: Option<&WorkerContext>, handle: FiberHandle) {
        // SAFETY: a woken fiber is owned by whoever detached it.
        match unsafe { handle.as_ref() }.affinity() {
            Affinity::Any => self.push_ready(context, handle),
            Affinity::Main => self.push_main(context, handle),
        }
    }

    fn wake(&self, context: Option<&WorkerContext>, waiters: Waiters) {
        for handle in waiters {
            self.reschedule(context, handle);
        }
    }

    /// Local pop, then the entry queue, then peers.
    pub(crate) fn find_work(&self, context: Option<&WorkerContext>) -> Option<FiberHandle> {
        context
            .and_then(WorkerContext::pop)
            .or_else(|| self.steal(context))
    }

    fn steal(&self, context: Option<&WorkerContext>) -> Option<FiberHandle> {
        loop {
            let attempt = match context {
                Some(context) => self.injector.steal_batch_and_pop(context.local()),
                None => self.injector.steal(),
            };
            match attempt {
                Steal::Success(handle) => return Some(handle),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }

        let count = self.workers.len();
        let me = context.map(|context| context.index);
        let start = me.map_or(0, |index| index + 1);
        (0..count)
            .map(|offset| (start + offset) % count)
            .filter(|&victim| Some(victim) != me)
            .find_map(|victim| loop {
                match self.workers[victim].stealer.steal() {
                    Steal::Success(handle) => break Some(handle),
                    Steal::Empty => break None,
                    Steal::Retry => continue,
                }
            })
    }

    /// Switches into a fiber and does its bookkeeping once it switches back.
    pub(crate) fn execute(&self, context: Option<&WorkerContext>, handle: FiberHandle) {
        // SAFETY: the handle was just taken off a queue, so we own it.
        let fiber = unsafe { handle.as_ref() };
        let state = {
            let _span = tracing::trace_span!(
                "task",
                name = fiber.name().unwrap_or("<unnamed>"),
                worker = context.map(|context| context.index),
            )
            .entered();
            fiber.resume()
        };

        match state {
            FiberState::Waiting(counter) => self.park(context, handle, &counter),
            FiberState::Complete => self.finish(context, handle, fiber, None),
            FiberState::Panic(payload) => self.finish(context, handle, fiber, Some(payload)),
        }
    }

    /// Registers a fiber that switched out to wait on `counter`.
    ///
    /// Runs on the worker's stack, after the fiber's stack is no longer in use.
    fn park(&self, context: Option<&WorkerContext>, handle: FiberHandle, counter: &Counter) {
        // SAFETY: the fiber is suspended and in no other structure.
        unsafe { counter.push_waiter(handle) };
        // The last decrement may have raced with the push; whoever detaches
        // the list second finds it empty, so nothing is scheduled twice.
        if counter.load(Ordering::SeqCst) == 0 {
            self.wake(context, counter.take_waiters());
        }
    }

    fn finish(
        &self,
        context: Option<&WorkerContext>,
        handle: FiberHandle,
        fiber: &Fiber,
        panic: Option<Box<dyn Any + Send>>,
    ) {
        let signal = fiber.take_signal();

        if let Some(payload) = panic {
            tracing::error!(
                task = fiber.name().unwrap_or("<unnamed>"),
                "task panicked: {}",
                panic_message(payload.as_ref())
            );
            if let Some(counter) = &signal {
                counter.record_panic();
            }
        }

        if let Some(waiters) = signal.and_then(|counter| counter.complete_one()) {
            self.wake(context, waiters);
        }

        // SAFETY: the fiber finished, so it is off every queue and list.
        unsafe { self.pool.push(handle) };
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "Unknown panic"
    }
}

/// A clonable handle to a running scheduler.
///
/// Tasks capture a `Scheduler` (or fetch one with [`Scheduler::current`]) to
/// spawn and wait on nested work.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// The scheduler the calling thread is bound to, if any.
    pub fn current() -> Option<Scheduler> {
        WorkerContext::current().map(|context| Scheduler {
            shared: context.shared.clone(),
        })
    }

    /// Spawns a task, registering it against `counter` when one is given.
    pub fn spawn<F>(&self, work: F, counter: Option<&Counter>)
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_task(None, Box::new(work), counter);
    }

    /// Spawns a task with a debug name that shows up in logs and trace spans.
    pub fn spawn_named<F>(&self, name: &'static str, work: F, counter: Option<&Counter>)
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_task(Some(name), Box::new(work), counter);
    }

    fn spawn_task(&self, name: Option<&'static str>, task: Task, counter: Option<&Counter>) {
        let handle = self.shared.prepare(task, counter, name, Affinity::Any);
        let context = WorkerContext::current_for(&self.shared);
        self.shared.push_ready(context.as_deref(), handle);
    }

    /// Queues a task that only the main worker may run.
    ///
    /// It runs during a later [`Scheduler::pump_main_thread_tasks`] on the
    /// thread that called `init_main_thread_worker`, and if it waits it is
    /// resumed there too.
    pub fn submit_main_thread_task<F>(&self, work: F, counter: Option<&Counter>)
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = self
            .shared
            .prepare(Box::new(work), counter, None, Affinity::Main);
        let context = WorkerContext::current_for(&self.shared);
        self.shared.push_main(context.as_deref(), handle);
    }

    /// Waits until `counter` reaches zero.
    ///
    /// Inside a task this suspends the fiber and frees the worker for other
    /// work. Outside of one it keeps the calling thread busy running ready
    /// tasks until the counter drains.
    pub fn wait_for_counter(&self, counter: &Counter) {
        self.wait_for_counter_with(counter, || {});
    }

    /// Like [`Scheduler::wait_for_counter`], calling `on_idle` once per
    /// iteration of a root-context wait, before looking for a task to run.
    ///
    /// The main thread typically passes a closure that pumps its event loop
    /// or [`Scheduler::pump_main_thread_tasks`]; it keeps being called while
    /// the queues stay busy. Fiber waits never call it.
    pub fn wait_for_counter_with<F>(&self, counter: &Counter, mut on_idle: F)
    where
        F: FnMut(),
    {
        if counter.load(Ordering::Acquire) == 0 {
            return;
        }

        if Fiber::current().is_some() {
            // A wake only means the counter touched zero; it may have been
            // raised again before this fiber got to run.
            while counter.load(Ordering::Acquire) > 0 {
                fiber::suspend_until(counter);
            }
            return;
        }

        let context = WorkerContext::current_for(&self.shared);
        let context = context.as_deref();
        while counter.load(Ordering::Acquire) > 0 {
            on_idle();
            match self.shared.find_work(context) {
                Some(handle) => self.shared.execute(context, handle),
                None => thread::yield_now(),
            }
        }
    }

    /// Splits `[0, count)` into chunks of `chunk_size` and runs
    /// `body(start, end)` once per chunk as a separate task under `counter`.
    ///
    /// Returns as soon as the chunks are queued; wait on `counter` to join.
    /// A `chunk_size` of zero is treated as one.
    pub fn parallel_for<F>(&self, count: usize, chunk_size: usize, body: F, counter: Option<&Counter>)
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        let chunk_size = chunk_size.max(1);
        let body = Arc::new(body);
        for start in (0..count).step_by(chunk_size) {
            let end = start.saturating_add(chunk_size).min(count);
            let body = body.clone();
            self.spawn_named("parallel_for", move || body(start, end), counter);
        }
    }

    /// Runs everything queued for the main worker without blocking.
    ///
    /// Must be called from the thread bound by `init_main_thread_worker`;
    /// elsewhere it does nothing.
    pub fn pump_main_thread_tasks(&self) {
        let Some(context) = WorkerContext::current_for(&self.shared).filter(|c| c.is_main()) else {
            tracing::debug!("pump_main_thread_tasks called off the main worker");
            return;
        };
        let context = Some(&*context);

        loop {
            // Contention means another thread is submitting; catch it next pump.
            let next = self
                .shared
                .main_queue
                .try_lock()
                .and_then(|mut queue| queue.pop_front());
            match next {
                Some(handle) => self.shared.execute(context, handle),
                None => break,
            }
        }

        while let Some(handle) = context.and_then(WorkerContext::pop_pinned) {
            self.shared.execute(context, handle);
        }
        while let Some(handle) = context.and_then(WorkerContext::pop) {
            self.shared.execute(context, handle);
        }
    }

    /// Binds the calling thread as worker 0.
    ///
    /// Calling it again from the same thread is a no-op.
    pub fn init_main_thread_worker(&self) -> Result<(), SchedulerError> {
        if let Some(context) = WorkerContext::current() {
            return if Arc::ptr_eq(&context.shared, &self.shared) && context.is_main() {
                Ok(())
            } else {
                Err(SchedulerError::ThreadBound)
            };
        }
        let local = self.shared.workers[0]
            .unbound
            .lock()
            .take()
            .ok_or(SchedulerError::MainThreadBound)?;
        WorkerContext::bind(self.shared.clone(), 0, local);
        tracing::debug!(thread = ?thread::current().id(), "main thread bound as worker 0");
        Ok(())
    }

    /// Number of workers, including the main thread.
    pub fn thread_count(&self) -> usize {
        self.shared.workers.len()
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.pool.stats()
    }

    fn stop(&self) {
        if self.shared.running.swap(false, Ordering::AcqRel) {
            tracing::info!("task scheduler stopping");
        }
    }

    fn is_bound_here(&self) -> bool {
        WorkerContext::current_for(&self.shared).is_some()
    }
}

/// The main fiber-based task scheduler.
///
/// Owns worker threads 1..N-1; worker 0 is the application thread that calls
/// [`TaskScheduler::init_main_thread_worker`]. Dropping the scheduler stops
/// the workers and joins them without draining queued work.
pub struct TaskScheduler {
    scheduler: Scheduler,
    threads: Vec<JoinHandle<()>>,
}

impl TaskScheduler {
    /// Creates a scheduler with `thread_count` workers (including the main
    /// thread) and default settings otherwise.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use fibertask::{Counter, TaskScheduler};
    ///
    /// let scheduler = TaskScheduler::new(4).unwrap();
    /// scheduler.init_main_thread_worker().unwrap();
    ///
    /// let counter = Counter::new(0);
    /// scheduler.spawn(|| println!("Hello from a fiber!"), Some(&counter));
    /// scheduler.wait_for_counter(&counter);
    /// ```
    pub fn new(thread_count: usize) -> Result<Self, SchedulerError> {
        Self::with_config(SchedulerConfig::with_threads(thread_count))
    }

    /// Creates a scheduler with custom configuration.
    pub fn with_config(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        let thread_count = config.threads;
        if thread_count == 0 {
            return Err(SchedulerError::NoThreads);
        }

        let (workers, mut locals): (Vec<_>, Vec<_>) = (0..thread_count).map(|_| Worker::new()).unzip();
        *workers[0].unbound.lock() = Some(locals.remove(0));

        let pool = FiberPool::new(
            config.preallocated_fibers(),
            config.arena_capacity(),
            config.stack_size,
        );
        tracing::info!(
            threads = thread_count,
            fibers = config.preallocated_fibers(),
            stack_size = config.stack_size,
            "task scheduler starting"
        );

        let shared = Arc::new(Shared {
            workers: workers.into_boxed_slice(),
            injector: Injector::new(),
            main_queue: Mutex::new(VecDeque::new()),
            pool,
            running: AtomicBool::new(true),
            config,
        });

        // Built before spawning so a failed spawn stops the threads already running.
        let mut scheduler = TaskScheduler {
            scheduler: Scheduler {
                shared: shared.clone(),
            },
            threads: Vec::with_capacity(thread_count - 1),
        };

        for (index, local) in (1..thread_count).zip(locals) {
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("{}{}", shared.config.thread_name_prefix, index))
                .spawn(move || worker::run(shared, index, local))
                .map_err(|source| SchedulerError::Spawn { index, source })?;
            scheduler.threads.push(handle);
        }

        Ok(scheduler)
    }

    /// Creates a scheduler with one worker per available CPU.
    pub fn with_default_threads() -> Result<Self, SchedulerError> {
        Self::with_config(SchedulerConfig::default())
    }

    /// Returns a clonable handle for use inside tasks.
    pub fn handle(&self) -> Scheduler {
        self.scheduler.clone()
    }

    pub fn init_main_thread_worker(&self) -> Result<(), SchedulerError> {
        self.scheduler.init_main_thread_worker()
    }

    pub fn spawn<F>(&self, work: F, counter: Option<&Counter>)
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler.spawn(work, counter);
    }

    pub fn spawn_named<F>(&self, name: &'static str, work: F, counter: Option<&Counter>)
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler.spawn_named(name, work, counter);
    }

    pub fn submit_main_thread_task<F>(&self, work: F, counter: Option<&Counter>)
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler.submit_main_thread_task(work, counter);
    }

    pub fn wait_for_counter(&self, counter: &Counter) {
        self.scheduler.wait_for_counter(counter);
    }

    pub fn wait_for_counter_with<F>(&self, counter: &Counter, on_idle: F)
    where
        F: FnMut(),
    {
        self.scheduler.wait_for_counter_with(counter, on_idle);
    }

    pub fn parallel_for<F>(&self, count: usize, chunk_size: usize, body: F, counter: Option<&Counter>)
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        self.scheduler.parallel_for(count, chunk_size, body, counter);
    }

    pub fn pump_main_thread_tasks(&self) {
        self.scheduler.pump_main_thread_tasks();
    }

    pub fn thread_count(&self) -> usize {
        self.scheduler.thread_count()
    }

    pub fn stats(&self) -> PoolStats {
        self.scheduler.stats()
    }

    /// Flags the workers to exit. Queued and suspended tasks are not drained.
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    /// Stops the scheduler and joins its worker threads.
    ///
    /// Returns an error if any worker thread panicked.
    pub fn shutdown(mut self) -> Result<(), SchedulerError> {
        match self.join_workers() {
            0 => Ok(()),
            failed => Err(SchedulerError::WorkerPanicked(failed)),
        }
    }

    fn join_workers(&mut self) -> usize {
        self.stop();
        let mut failed = 0;
        for (offset, handle) in self.threads.drain(..).enumerate() {
            if handle.join().is_err() {
                failed += 1;
                tracing::error!(worker = offset + 1, "worker thread panicked");
            }
        }
        if self.scheduler.is_bound_here() {
            WorkerContext::unbind();
        }
        failed
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.join_workers();
    }
}
