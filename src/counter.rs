//! Counter-based synchronization primitives for task completion tracking.
//!
//! A [`Counter`] is the fan-in primitive of the scheduler: every task spawned
//! against it adds one, every finished task subtracts one, and fibers that
//! wait on it are parked on an intrusive, lock-free list until it drains.

use crate::fiber::{Fiber, FiberHandle};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicPtr, AtomicUsize, Ordering};

struct InnerCounter {
    value: AtomicI64,
    /// Head of the waiting list, linked through `Fiber::next_waiting`.
    waiting: AtomicPtr<Fiber>,
    panicked: AtomicUsize,
}

/// A thread-safe counter of outstanding tasks.
///
/// Cloning a `Counter` produces another handle to the same value, which is
/// how the scheduler keeps it alive for the tasks registered against it.
#[derive(Clone)]
pub struct Counter {
    inner: Arc<InnerCounter>,
}

impl Counter {
    /// Creates a new counter with the specified initial value.
    pub fn new(initial: i64) -> Self {
        Counter {
            inner: Arc::new(InnerCounter {
                value: AtomicI64::new(initial),
                waiting: AtomicPtr::new(std::ptr::null_mut()),
                panicked: AtomicUsize::new(0),
            }),
        }
    }

    pub fn load(&self, order: Ordering) -> i64 {
        self.inner.value.load(order)
    }

    pub fn store(&self, value: i64, order: Ordering) {
        self.inner.value.store(value, order);
    }

    /// Adds to the value, returning the previous value.
    pub fn fetch_add(&self, arg: i64, order: Ordering) -> i64 {
        self.inner.value.fetch_add(arg, order)
    }

    /// Subtracts from the value, returning the previous value.
    ///
    /// This does not release waiters; only task completion does.
    pub fn fetch_sub(&self, arg: i64, order: Ordering) -> i64 {
        self.inner.value.fetch_sub(arg, order)
    }

    /// Checks if the counter has drained to zero.
    pub fn is_complete(&self) -> bool {
        self.load(Ordering::Acquire) == 0
    }

    /// Number of tasks registered against this counter that panicked.
    pub fn panicked_tasks(&self) -> usize {
        self.inner.panicked.load(Ordering::Acquire)
    }

    /// Returns true if both handles refer to the same counter.
    pub fn ptr_eq(&self, other: &Counter) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn record_panic(&self) {
        self.inner.panicked.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements on behalf of a finished task.
    ///
    /// Returns the waiting list when this decrement drained the counter.
    pub(crate) fn complete_one(&self) -> Option<Waiters> {
        // AcqRel: the task's writes must be visible to whoever is woken.
        let prev = self.inner.value.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            Some(self.take_waiters())
        } else {
            None
        }
    }

    /// Pushes a suspended fiber onto the waiting list.
    ///
    /// # Safety
    ///
    /// The fiber must be suspended and must not be a member of any other
    /// list or queue until it is handed back by [`Counter::take_waiters`].
    pub(crate) unsafe fn push_waiter(&self, handle: FiberHandle) {
        // SAFETY: the caller owns the suspended fiber exclusively.
        let fiber = unsafe { handle.as_ref() };
        let mut head = self.inner.waiting.load(Ordering::Relaxed);
        loop {
            fiber.next_waiting.store(head, Ordering::Relaxed);
            // AcqRel pairs with the swap in `take_waiters`: whichever of the
            // two comes second observes the other's value update.
            match self.inner.waiting.compare_exchange_weak(
                head,
                handle.as_ptr(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
    }

    /// Atomically detaches the whole waiting list.
    pub(crate) fn take_waiters(&self) -> Waiters {
        let head = self
            .inner
            .waiting
            .swap(std::ptr::null_mut(), Ordering::AcqRel);
        Waiters { head }
    }
}

impl Default for Counter {
    fn default() -> Self {
        Counter::new(0)
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Counter")
            .field("value", &self.load(Ordering::Relaxed))
            .field("panicked", &self.panicked_tasks())
            .finish()
    }
}

/// A detached waiting list. Iterating unlinks each fiber as it is yielded.
pub(crate) struct Waiters {
    head: *mut Fiber,
}

impl Iterator for Waiters {
    type Item = FiberHandle;

    fn next(&mut self) -> Option<FiberHandle> {
        if self.head.is_null() {
            return None;
        }
        let handle = FiberHandle::from_ptr(self.head);
        // SAFETY: fibers on a detached list are exclusively owned by it.
        let fiber = unsafe { handle.as_ref() };
        self.head = fiber
            .next_waiting
            .swap(std::ptr::null_mut(), Ordering::Relaxed);
        Some(handle)
    }
}
