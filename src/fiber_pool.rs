//! Lock-free pool of reusable fibers.
//!
//! Fibers live in a fixed-capacity arena and are recycled through a LIFO
//! free-list. Links are arena indices (`Fiber::next_pool`), and the list head
//! packs a modification tag next to the index so a pop that raced with a
//! pop/push pair on the same fiber fails its CAS instead of corrupting the list.

use crate::fiber::{Fiber, FiberHandle};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

const INDEX_MASK: u64 = 0xFFFF_FFFF;

fn pack(tag: u64, link: u32) -> u64 {
    (tag << 32) | link as u64
}

fn link_of(head: u64) -> u32 {
    (head & INDEX_MASK) as u32
}

fn tag_of(head: u64) -> u64 {
    head >> 32
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Fibers created inside the arena (they are never freed before the pool).
    pub arena_fibers: usize,
    /// Fibers currently idle on the free-list.
    pub idle_fibers: usize,
    /// Single-use fibers created after the arena filled up.
    pub overflow_fibers: usize,
}

pub(crate) struct FiberPool {
    slots: Box<[AtomicPtr<Fiber>]>,
    /// Next arena slot to hand out; may run past `slots.len()`.
    next_slot: AtomicUsize,
    head: AtomicU64,
    idle: AtomicUsize,
    overflow: AtomicUsize,
    overflow_warned: AtomicBool,
    stack_size: usize,
}

impl FiberPool {
    /// Creates a pool with room for `capacity` fibers and fills `initial` of them.
    pub(crate) fn new(initial: usize, capacity: usize, stack_size: usize) -> Self {
        let capacity = capacity.max(initial).min(INDEX_MASK as usize - 1);
        let slots = (0..capacity)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect();
        let pool = FiberPool {
            slots,
            next_slot: AtomicUsize::new(0),
            head: AtomicU64::new(0),
            idle: AtomicUsize::new(0),
            overflow: AtomicUsize::new(0),
            overflow_warned: AtomicBool::new(false),
            stack_size,
        };
        for _ in 0..initial {
            if let Some(handle) = pool.create_in_arena() {
                // SAFETY: a freshly created fiber is in no other structure.
                unsafe { pool.push(handle) };
            }
        }
        pool
    }

    /// Pops an idle fiber, or `None` when the free-list is empty.
    pub(crate) fn pop(&self) -> Option<FiberHandle> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let link = link_of(head);
            if link == 0 {
                return None;
            }
            let fiber = self.slot(link - 1);
            // SAFETY: arena fibers are never freed while the pool is alive.
            // The read may be stale; the tag makes the CAS below fail then.
            let next = unsafe { &(*fiber).next_pool }.load(Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                pack(tag_of(head).wrapping_add(1), next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.idle.fetch_sub(1, Ordering::Relaxed);
                    // SAFETY: the CAS made us the fiber's only owner.
                    unsafe { &(*fiber).pooled }.store(false, Ordering::Relaxed);
                    return Some(FiberHandle::from_ptr(fiber));
                }
                Err(current) => head = current,
            }
        }
    }

    /// Returns a finished fiber to the pool.
    ///
    /// Overflow fibers have no arena slot and are freed here instead.
    ///
    /// # Safety
    ///
    /// `handle` must come from this pool's [`FiberPool::allocate`] or
    /// [`FiberPool::pop`], must not be running, and must not sit in any
    /// queue or waiting list. Ownership passes to the pool.
    ///
    /// # Panics
    ///
    /// Panics if an arena fiber is pushed while it is already idle.
    pub(crate) unsafe fn push(&self, handle: FiberHandle) {
        // SAFETY: the caller hands over exclusive ownership of the fiber.
        let fiber = unsafe { handle.as_ref() };
        let Some(index) = fiber.pool_index() else {
            // SAFETY: overflow fibers were created by `Box::into_raw` below.
            drop(unsafe { Box::from_raw(handle.as_ptr()) });
            return;
        };
        assert!(
            !fiber.pooled.swap(true, Ordering::Relaxed),
            "fiber returned to the pool twice"
        );
        // Counted before linking so a racing pop never drives it below zero.
        self.idle.fetch_add(1, Ordering::Relaxed);
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            fiber.next_pool.store(link_of(head), Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                pack(tag_of(head).wrapping_add(1), index + 1),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
    }

    /// Pops an idle fiber or creates a new one.
    ///
    /// New fibers go into the arena while it has room and stay pooled for
    /// good; past that they are overflow fibers, freed after one task.
    pub(crate) fn allocate(&self) -> FiberHandle {
        if let Some(handle) = self.pop() {
            return handle;
        }
        if let Some(handle) = self.create_in_arena() {
            return handle;
        }
        self.overflow.fetch_add(1, Ordering::Relaxed);
        if !self.overflow_warned.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                capacity = self.slots.len(),
                "fiber arena is full, falling back to single-use fibers"
            );
        }
        FiberHandle::from_ptr(Box::into_raw(Box::new(Fiber::new(self.stack_size, None))))
    }

    pub(crate) fn stats(&self) -> PoolStats {
        PoolStats {
            arena_fibers: self.next_slot.load(Ordering::Relaxed).min(self.slots.len()),
            idle_fibers: self.idle.load(Ordering::Relaxed),
            overflow_fibers: self.overflow.load(Ordering::Relaxed),
        }
    }

    fn create_in_arena(&self) -> Option<FiberHandle> {
        let index = self.next_slot.fetch_add(1, Ordering::Relaxed);
        if index >= self.slots.len() {
            return None;
        }
        let fiber = Box::into_raw(Box::new(Fiber::new(self.stack_size, Some(index as u32))));
        // Published to other threads by the release CAS in `push`.
        self.slots[index].store(fiber, Ordering::Release);
        Some(FiberHandle::from_ptr(fiber))
    }

    fn slot(&self, index: u32) -> *mut Fiber {
        self.slots[index as usize].load(Ordering::Acquire)
    }
}

impl Drop for FiberPool {
    fn drop(&mut self) {
        for slot in self.slots.iter_mut() {
            let fiber = *slot.get_mut();
            if !fiber.is_null() {
                // SAFETY: all workers are gone; the pool is the last owner.
                drop(unsafe { Box::from_raw(fiber) });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::{Affinity, FiberState};
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};
    use std::thread;

    const TEST_STACK: usize = 16 * 1024;

    #[test]
    fn test_pool_preallocates() {
        let pool = FiberPool::new(8, 16, TEST_STACK);
        let stats = pool.stats();
        assert_eq!(stats.arena_fibers, 8);
        assert_eq!(stats.idle_fibers, 8);
        assert_eq!(stats.overflow_fibers, 0);
        assert_eq!(pool.slots.len(), 16);
    }

    #[test]
    fn test_pool_is_lifo() {
        let pool = FiberPool::new(2, 2, TEST_STACK);
        let a = pool.pop().unwrap();
        let b = pool.pop().unwrap();
        assert!(pool.pop().is_none());

        unsafe {
            pool.push(a);
            pool.push(b);
        }
        assert_eq!(pool.pop(), Some(b));
        assert_eq!(pool.pop(), Some(a));
    }

    #[test]
    fn test_allocate_grows_arena_then_overflows() {
        let pool = FiberPool::new(1, 2, TEST_STACK);
        let first = pool.allocate();
        let second = pool.allocate();
        let third = pool.allocate();

        unsafe {
            assert!(first.as_ref().pool_index().is_some());
            assert_eq!(second.as_ref().pool_index(), Some(1));
            assert_eq!(third.as_ref().pool_index(), None);
        }
        let stats = pool.stats();
        assert_eq!(stats.arena_fibers, 2);
        assert_eq!(stats.overflow_fibers, 1);

        unsafe {
            pool.push(first);
            pool.push(second);
            pool.push(third);
        }
        // The overflow fiber was freed, the arena ones are idle.
        assert_eq!(pool.stats().idle_fibers, 2);
    }

    #[test]
    fn test_recycled_fiber_runs_new_work() {
        let pool = FiberPool::new(1, 1, TEST_STACK);
        for round in 0..3usize {
            let handle = pool.allocate();
            let seen = Arc::new(Mutex::new(None));
            let seen_clone = seen.clone();
            let fiber = unsafe { handle.as_ref() };
            fiber.reset(
                Box::new(move || *seen_clone.lock().unwrap() = Some(round)),
                None,
                None,
                Affinity::Any,
            );
            assert!(matches!(fiber.resume(), FiberState::Complete));
            assert_eq!(*seen.lock().unwrap(), Some(round));
            unsafe { pool.push(handle) };
        }
        assert_eq!(pool.stats().arena_fibers, 1);
    }

    #[test]
    fn test_concurrent_pop_push_never_hands_out_a_live_fiber() {
        let pool = Arc::new(FiberPool::new(8, 8, TEST_STACK));
        let live = Arc::new(Mutex::new(HashSet::new()));

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                let live = live.clone();
                thread::spawn(move || {
                    for _ in 0..5_000 {
                        let Some(handle) = pool.pop() else {
                            thread::yield_now();
                            continue;
                        };
                        assert!(
                            live.lock().unwrap().insert(handle),
                            "fiber handed out twice"
                        );
                        thread::yield_now();
                        assert!(live.lock().unwrap().remove(&handle));
                        unsafe { pool.push(handle) };
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }

        let mut drained = HashSet::new();
        while let Some(handle) = pool.pop() {
            assert!(drained.insert(handle));
        }
        assert_eq!(drained.len(), 8);
    }

    #[test]
    #[should_panic(expected = "fiber returned to the pool twice")]
    fn test_double_push_is_rejected() {
        let pool = FiberPool::new(1, 1, TEST_STACK);
        let handle = pool.pop().unwrap();
        unsafe {
            pool.push(handle);
            pool.push(handle);
        }
    }

    #[test]
    fn test_popped_fiber_can_be_returned_again() {
        let pool = FiberPool::new(1, 1, TEST_STACK);
        for _ in 0..3 {
            let handle = pool.pop().unwrap();
            assert!(pool.pop().is_none());
            unsafe { pool.push(handle) };
        }
        assert_eq!(pool.stats().idle_fibers, 1);
    }
}
