//! Worker threads and per-thread execution context.
//!
//! Each worker owns one end of a work-stealing deque; every other thread
//! holds a [`Stealer`] for the opposite end. Worker 0 is the embedding
//! application's own thread: it has no OS thread of its own and its deque
//! waits in [`Worker::unbound`] until that thread calls
//! `init_main_thread_worker`.

use crate::fiber::FiberHandle;
use crate::scheduler::Shared;
use crossbeam::deque::{Stealer, Worker as Deque};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Shared view of one worker.
pub(crate) struct Worker {
    pub(crate) stealer: Stealer<FiberHandle>,
    /// The deque of a worker whose thread has not bound yet.
    pub(crate) unbound: Mutex<Option<Deque<FiberHandle>>>,
}

impl Worker {
    /// Creates the shared half of a worker and returns the owner half.
    pub(crate) fn new() -> (Self, Deque<FiberHandle>) {
        let local = Deque::new_lifo();
        let worker = Worker {
            stealer: local.stealer(),
            unbound: Mutex::new(None),
        };
        (worker, local)
    }
}

/// State private to the OS thread driving a worker.
pub(crate) struct WorkerContext {
    pub(crate) shared: Arc<Shared>,
    pub(crate) index: usize,
    local: Deque<FiberHandle>,
    /// Main-thread-only fibers submitted from the main thread itself.
    pinned: RefCell<VecDeque<FiberHandle>>,
}

thread_local! {
    static CONTEXT: RefCell<Option<Rc<WorkerContext>>> = const { RefCell::new(None) };
}

impl WorkerContext {
    /// Installs a worker context for the calling thread.
    pub(crate) fn bind(shared: Arc<Shared>, index: usize, local: Deque<FiberHandle>) -> Rc<Self> {
        let context = Rc::new(WorkerContext {
            shared,
            index,
            local,
            pinned: RefCell::new(VecDeque::new()),
        });
        CONTEXT.with(|slot| *slot.borrow_mut() = Some(context.clone()));
        tracing::debug!(worker = index, "thread bound to worker");
        context
    }

    /// Removes the calling thread's context.
    pub(crate) fn unbind() -> Option<Rc<Self>> {
        let context = CONTEXT.with(|slot| slot.borrow_mut().take());
        if let Some(context) = &context {
            tracing::debug!(worker = context.index, "thread unbound from worker");
        }
        context
    }

    /// The calling thread's context, whichever scheduler it belongs to.
    pub(crate) fn current() -> Option<Rc<Self>> {
        CONTEXT.with(|slot| slot.borrow().clone())
    }

    /// The calling thread's context if it belongs to `shared`.
    pub(crate) fn current_for(shared: &Arc<Shared>) -> Option<Rc<Self>> {
        Self::current().filter(|context| Arc::ptr_eq(&context.shared, shared))
    }

    pub(crate) fn is_main(&self) -> bool {
        self.index == 0
    }

    pub(crate) fn push(&self, handle: FiberHandle) {
        self.local.push(handle);
    }

    pub(crate) fn pop(&self) -> Option<FiberHandle> {
        self.local.pop()
    }

    pub(crate) fn local(&self) -> &Deque<FiberHandle> {
        &self.local
    }

    pub(crate) fn push_pinned(&self, handle: FiberHandle) {
        self.pinned.borrow_mut().push_back(handle);
    }

    pub(crate) fn pop_pinned(&self) -> Option<FiberHandle> {
        self.pinned.borrow_mut().pop_front()
    }
}

/// Main loop of worker threads 1..N-1.
///
/// Pops local work, then steals, then sleeps briefly, until the scheduler stops.
pub(crate) fn run(shared: Arc<Shared>, index: usize, local: Deque<FiberHandle>) {
    let context = WorkerContext::bind(shared.clone(), index, local);
    let idle = Duration::from_micros(shared.config().idle_sleep_us);

    while shared.is_running() {
        match shared.find_work(Some(&context)) {
            Some(handle) => shared.execute(Some(&context), handle),
            None => thread::sleep(idle),
        }
    }

    drop(context);
    WorkerContext::unbind();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::deque::Steal;

    fn handle(n: usize) -> FiberHandle {
        FiberHandle::from_ptr(n as *mut crate::fiber::Fiber)
    }

    #[test]
    fn test_owner_pops_newest_first() {
        let (_worker, local) = Worker::new();
        local.push(handle(1));
        local.push(handle(2));
        local.push(handle(3));

        assert_eq!(local.pop(), Some(handle(3)));
        assert_eq!(local.pop(), Some(handle(2)));
        assert_eq!(local.pop(), Some(handle(1)));
        assert_eq!(local.pop(), None);
    }

    #[test]
    fn test_thieves_take_oldest_first() {
        let (worker, local) = Worker::new();
        local.push(handle(1));
        local.push(handle(2));

        assert_eq!(worker.stealer.steal(), Steal::Success(handle(1)));
        assert_eq!(worker.stealer.steal(), Steal::Success(handle(2)));
        assert!(worker.stealer.steal().is_empty());
    }

    #[test]
    fn test_concurrent_steals_never_duplicate() {
        let (worker, local) = Worker::new();
        let total = 10_000;
        for i in 1..=total {
            local.push(handle(i));
        }

        let stealer = worker.stealer.clone();
        let thieves: Vec<_> = (0..3)
            .map(|_| {
                let stealer = stealer.clone();
                thread::spawn(move || {
                    let mut taken = Vec::new();
                    loop {
                        match stealer.steal() {
                            Steal::Success(h) => taken.push(h.as_ptr() as usize),
                            Steal::Retry => continue,
                            Steal::Empty => break,
                        }
                    }
                    taken
                })
            })
            .collect();

        let mut seen: Vec<usize> = Vec::new();
        while let Some(h) = local.pop() {
            seen.push(h.as_ptr() as usize);
        }
        for thief in thieves {
            seen.extend(thief.join().unwrap());
        }

        assert_eq!(seen.len(), total);
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), total, "a fiber was handed out twice");
    }
}
