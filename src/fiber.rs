//! Fiber management and execution context.
//!
//! A fiber is a stackful coroutine (`corosensei`) that is created once and
//! recycled for many tasks. Its body is a trampoline: it runs the task it was
//! started with, reports completion back to the worker, and parks at the top
//! of its loop until the worker starts it again with new work.
//!
//! Stack setup, register save areas and ABI alignment for the context switch
//! are handled by `corosensei`; nothing outside this module touches them.

use crate::counter::Counter;
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};

use std::any::Any;
use std::cell::{Cell, UnsafeCell};
use std::mem::ManuallyDrop;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};

/// A unit of work run on a fiber.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Raw handle to a fiber, passed between queues and threads.
///
/// Fibers are owned by the scheduler's fiber pool; a
/// handle is only ever held by one structure at a time (a worker queue, a
/// counter's waiting list, the running worker, or the free-list).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FiberHandle(*mut Fiber);

// SAFETY: ownership of the pointee is transferred with the handle; no two
// threads operate on the same fiber at once.
unsafe impl Send for FiberHandle {}
unsafe impl Sync for FiberHandle {}

impl FiberHandle {
    pub(crate) fn from_ptr(ptr: *mut Fiber) -> Self {
        FiberHandle(ptr)
    }

    pub fn as_ptr(self) -> *mut Fiber {
        self.0
    }

    /// # Safety
    ///
    /// The fiber must still be alive and the caller must be its current owner.
    pub unsafe fn as_ref<'a>(self) -> &'a Fiber {
        unsafe { &*self.0 }
    }
}

/// Where a fiber is allowed to run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Affinity {
    /// Any worker may run or steal it.
    #[default]
    Any,
    /// Only the thread bound as the main worker may run it.
    Main,
}

/// Value handed to the coroutine on resume.
pub(crate) enum Resume {
    Start { task: Task, fiber: FiberHandle },
    Continue,
}

/// Value handed back to the worker when the coroutine switches out.
pub(crate) enum Suspend {
    /// The task wants to sleep until the counter drains. The worker, not the
    /// fiber, registers it on the counter's waiting list.
    Wait(Counter),
    /// The task ran to completion (or unwound) and the fiber is idle again.
    Complete(std::thread::Result<()>),
}

/// Outcome of a single [`Fiber::resume`].
pub enum FiberState {
    Waiting(Counter),
    Complete,
    Panic(Box<dyn Any + Send>),
}

/// A lightweight stackful execution context.
pub struct Fiber {
    coroutine: UnsafeCell<ManuallyDrop<Coroutine<Resume, Suspend, (), DefaultStack>>>,
    /// Written by the coroutine body when it starts; the yielder lives on the
    /// fiber's own stack and stays put for the coroutine's lifetime.
    yielder: Cell<*const Yielder<Resume, Suspend>>,
    work: Cell<Option<Task>>,
    signal: Cell<Option<Counter>>,
    name: Cell<Option<&'static str>>,
    affinity: Cell<Affinity>,
    /// Started and not yet finished.
    in_flight: Cell<bool>,
    pub(crate) next_waiting: AtomicPtr<Fiber>,
    /// Free-list link: arena index + 1, zero for none.
    pub(crate) next_pool: AtomicU32,
    /// Set while the fiber sits idle on the pool's free-list.
    pub(crate) pooled: AtomicBool,
    pool_index: Option<u32>,
}

// SAFETY: a fiber moves between threads only through queues that publish it;
// the thread that pops it has exclusive access until it hands it on.
unsafe impl Send for Fiber {}

thread_local! {
    static CURRENT_FIBER: Cell<Option<FiberHandle>> = const { Cell::new(None) };
}

impl Fiber {
    /// Creates an idle fiber with its own stack.
    ///
    /// `pool_index` is the fiber's slot in the pool arena; overflow fibers
    /// that live outside the arena have none.
    ///
    /// # Panics
    ///
    /// Panics if the stack cannot be mapped, like any other failed allocation.
    pub fn new(stack_size: usize, pool_index: Option<u32>) -> Self {
        let stack = DefaultStack::new(stack_size).unwrap_or_else(|err| {
            panic!("failed to allocate a {stack_size}-byte fiber stack: {err}")
        });

        let coroutine = Coroutine::with_stack(
            stack,
            |yielder: &Yielder<Resume, Suspend>, mut input: Resume| loop {
                input = match input {
                    Resume::Start { task, fiber } => {
                        // SAFETY: the fiber owns this coroutine and outlives it.
                        unsafe { fiber.as_ref() }.yielder.set(yielder as *const _);
                        let result = catch_unwind(AssertUnwindSafe(task));
                        yielder.suspend(Suspend::Complete(result))
                    }
                    Resume::Continue => yielder.suspend(Suspend::Complete(Ok(()))),
                };
            },
        );

        Fiber {
            coroutine: UnsafeCell::new(ManuallyDrop::new(coroutine)),
            yielder: Cell::new(std::ptr::null()),
            work: Cell::new(None),
            signal: Cell::new(None),
            name: Cell::new(None),
            affinity: Cell::new(Affinity::Any),
            in_flight: Cell::new(false),
            next_waiting: AtomicPtr::new(std::ptr::null_mut()),
            next_pool: AtomicU32::new(0),
            pooled: AtomicBool::new(false),
            pool_index,
        }
    }

    /// Primes an idle fiber with a new task.
    pub fn reset(
        &self,
        task: Task,
        signal: Option<Counter>,
        name: Option<&'static str>,
        affinity: Affinity,
    ) {
        debug_assert!(!self.in_flight.get(), "reset of a fiber that is still running");
        self.work.set(Some(task));
        self.signal.set(signal);
        self.name.set(name);
        self.affinity.set(affinity);
        self.next_waiting
            .store(std::ptr::null_mut(), Ordering::Relaxed);
        self.next_pool.store(0, Ordering::Relaxed);
    }

    /// Switches into the fiber until it finishes or waits.
    ///
    /// The first resume after [`Fiber::reset`] starts the task; later resumes
    /// continue it from its last wait.
    pub fn resume(&self) -> FiberState {
        let handle = FiberHandle::from_ptr(self as *const Fiber as *mut Fiber);
        let input = match self.work.take() {
            Some(task) => {
                self.in_flight.set(true);
                Resume::Start { task, fiber: handle }
            }
            None => Resume::Continue,
        };

        let previous = CURRENT_FIBER.replace(Some(handle));
        // SAFETY: only the owning thread resumes a fiber, never re-entrantly.
        let result = unsafe { &mut *self.coroutine.get() }.resume(input);
        CURRENT_FIBER.set(previous);

        match result {
            CoroutineResult::Yield(Suspend::Wait(counter)) => FiberState::Waiting(counter),
            CoroutineResult::Yield(Suspend::Complete(outcome)) => {
                self.in_flight.set(false);
                match outcome {
                    Ok(()) => FiberState::Complete,
                    Err(payload) => FiberState::Panic(payload),
                }
            }
            CoroutineResult::Return(()) => {
                self.in_flight.set(false);
                FiberState::Complete
            }
        }
    }

    /// Detaches the counter to signal on completion.
    pub(crate) fn take_signal(&self) -> Option<Counter> {
        self.signal.take()
    }

    pub fn name(&self) -> Option<&'static str> {
        self.name.get()
    }

    pub fn affinity(&self) -> Affinity {
        self.affinity.get()
    }

    pub fn pool_index(&self) -> Option<u32> {
        self.pool_index
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.get()
    }

    /// Handle of the fiber running on this thread, if any.
    ///
    /// Kept out of line: a fiber may resume on another thread, and the
    /// thread-local must be looked up again after every switch.
    #[inline(never)]
    pub fn current() -> Option<FiberHandle> {
        CURRENT_FIBER.get()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        if self.in_flight.get() {
            // A task parked mid-wait would have its destructors run on the
            // dropping thread by a forced unwind; leak its stack instead.
            return;
        }
        // SAFETY: the coroutine is idle and dropped exactly once.
        unsafe { ManuallyDrop::drop(self.coroutine.get_mut()) };
    }
}

/// Suspends the running fiber, asking its worker to park it on `counter`.
///
/// Returns `false` without suspending when called outside of a fiber.
#[inline(never)]
pub(crate) fn suspend_until(counter: &Counter) -> bool {
    let Some(handle) = Fiber::current() else {
        return false;
    };
    // SAFETY: CURRENT_FIBER is only set while that fiber is running here.
    let yielder = unsafe { handle.as_ref() }.yielder.get();
    assert!(!yielder.is_null(), "fiber suspended before it started");
    // SAFETY: the yielder sits on this fiber's stack, which we are running on.
    let _ = unsafe { &*yielder }.suspend(Suspend::Wait(counter.clone()));
    true
}
