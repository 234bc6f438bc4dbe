// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-thread, power-of-two-bucketed reuse cache for task/awaitable/timer-entry-sized
//! allocations.
//!
//! This is deliberately a smaller surface than a production slab allocator -- it
//! exists to exercise the interface the scheduler/blocking/timer hot paths would use
//! (`get_or_alloc`/`recycle`), not to compete with the system allocator on layout
//! sophistication. Every cached block shares one generous alignment; callers that need
//! a specific type's alignment should allocate that type directly and only use this
//! cache for interchangeable byte blocks.
//!
//! Every scheduler, blocking-worker, and timer thread calls [`register`] once at
//! startup and holds the returned [`Registration`] guard for its entire run loop,
//! tying this thread-local cache explicitly to that thread's lifetime rather than
//! leaving it a free-floating global with no relationship to the owning lifecycle.

use std::alloc::{alloc, dealloc, Layout};
use std::cell::RefCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

const BLOCK_ALIGN: usize = 16;

static BYTE_LIMIT: AtomicUsize = AtomicUsize::new(1 << 20);

/// Set the per-bucket byte limit used by every thread's cache from this point on.
///
/// Called once by [`crate::lifecycle::Lifecycle::new`]; existing cached blocks on
/// other threads are not retroactively evicted, only future `recycle` calls are
/// affected.
pub(crate) fn configure(byte_limit: usize) {
    BYTE_LIMIT.store(byte_limit, Ordering::Relaxed);
}

struct Bucket {
    blocks: Vec<NonNull<u8>>,
    bytes: usize,
}

impl Bucket {
    fn new() -> Self {
        Self {
            blocks: Vec::new(),
            bytes: 0,
        }
    }
}

struct Buckets {
    buckets: Vec<Bucket>,
}

impl Buckets {
    fn new() -> Self {
        Self {
            buckets: Vec::new(),
        }
    }

    fn pop(&mut self, bucket_size: usize) -> Option<NonNull<u8>> {
        let index = bucket_size.trailing_zeros() as usize;
        let bucket = self.buckets.get_mut(index)?;
        let ptr = bucket.blocks.pop()?;
        bucket.bytes -= bucket_size;
        Some(ptr)
    }

    /// Returns `true` if `ptr` was accepted into the cache; `false` if the bucket is at
    /// its byte limit and the caller must free `ptr` itself.
    fn push(&mut self, bucket_size: usize, ptr: NonNull<u8>, byte_limit: usize) -> bool {
        let index = bucket_size.trailing_zeros() as usize;
        if self.buckets.len() <= index {
            self.buckets.resize_with(index + 1, Bucket::new);
        }
        let bucket = &mut self.buckets[index];
        if bucket.bytes + bucket_size > byte_limit {
            return false;
        }
        bucket.blocks.push(ptr);
        bucket.bytes += bucket_size;
        true
    }
}

impl Drop for Buckets {
    fn drop(&mut self) {
        for (index, bucket) in self.buckets.iter_mut().enumerate() {
            let bucket_size = 1usize << index;
            let layout = layout_for(bucket_size);
            for ptr in bucket.blocks.drain(..) {
                // Safety: every pointer in `blocks` was allocated by `alloc_block` with
                // this exact bucket's layout and has not been freed elsewhere.
                unsafe { dealloc(ptr.as_ptr(), layout) };
            }
        }
    }
}

thread_local! {
    static CACHE: RefCell<Buckets> = RefCell::new(Buckets::new());
    static REGISTERED: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// An RAII guard for this thread's registration with the active lifecycle's memory
/// cache. Dropping it -- normally when the registering thread exits -- clears the
/// registration, so a later [`register`] call on the same thread identity succeeds
/// again.
pub(crate) struct Registration {
    _private: (),
}

impl Drop for Registration {
    fn drop(&mut self) {
        REGISTERED.with(|registered| registered.set(false));
    }
}

/// Register this thread's cache with the active lifecycle.
///
/// Every scheduler, blocking-worker, and timer thread registers once at startup and
/// holds the returned guard for its entire run loop, tying the cache's lifetime
/// explicitly to the owning thread rather than leaving it a free-floating global.
/// Registering twice on the same thread while the first [`Registration`] is still
/// alive is rejected, mirroring the original engine's `cache_already_registered`
/// guard.
pub(crate) fn register() -> Result<Registration, crate::error::CacheError> {
    let already_registered = REGISTERED.with(|registered| registered.replace(true));
    if already_registered {
        return Err(crate::error::CacheError);
    }
    Ok(Registration { _private: () })
}

fn layout_for(bucket_size: usize) -> Layout {
    Layout::from_size_align(bucket_size, BLOCK_ALIGN).expect("invalid block layout")
}

fn alloc_block(bucket_size: usize) -> NonNull<u8> {
    let layout = layout_for(bucket_size);
    // Safety: `layout` has a nonzero size (bucket sizes are powers of two, minimum 1)
    // and valid alignment.
    let ptr = unsafe { alloc(layout) };
    NonNull::new(ptr).unwrap_or_else(|| std::alloc::handle_alloc_error(layout))
}

fn bucket_size_for(requested: usize) -> usize {
    requested.max(1).next_power_of_two()
}

/// Get a block of at least `size` bytes, reusing one from this thread's cache if
/// available, else allocating fresh from the system allocator.
pub(crate) fn get_or_alloc(size: usize) -> NonNull<u8> {
    let bucket_size = bucket_size_for(size);
    let cached = CACHE.with(|cache| cache.borrow_mut().pop(bucket_size));
    cached.unwrap_or_else(|| alloc_block(bucket_size))
}

/// Return a block previously obtained from [`get_or_alloc`] with the same `size`.
///
/// Falls through to the system allocator if the relevant bucket is already at its
/// configured byte limit.
pub(crate) fn recycle(ptr: NonNull<u8>, size: usize) {
    let bucket_size = bucket_size_for(size);
    let byte_limit = BYTE_LIMIT.load(Ordering::Relaxed);
    let accepted = CACHE.with(|cache| cache.borrow_mut().push(bucket_size, ptr, byte_limit));
    if !accepted {
        let layout = layout_for(bucket_size);
        // Safety: `ptr` was allocated with this same bucket's layout by `alloc_block`
        // and the cache just declined to retain it, so no other owner exists.
        unsafe { dealloc(ptr.as_ptr(), layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // `configure` sets a process-wide byte limit shared by every thread's cache;
    // serialize the tests that touch it so they cannot observe each other's limit.
    static CONFIG_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn bucket_size_rounds_up_to_power_of_two() {
        assert_eq!(bucket_size_for(1), 1);
        assert_eq!(bucket_size_for(17), 32);
        assert_eq!(bucket_size_for(64), 64);
    }

    #[test]
    fn recycled_block_is_reused() {
        let _guard = CONFIG_LOCK.lock().unwrap();
        configure(1 << 20);
        let a = get_or_alloc(100);
        recycle(a, 100);
        let b = get_or_alloc(100);
        assert_eq!(a, b, "expected the cached block to be handed back out");
        recycle(b, 100);
    }

    #[test]
    fn over_limit_blocks_fall_through_to_system_allocator() {
        // With a byte limit smaller than one block, `recycle` must reject every block
        // (falling through to `dealloc` directly) rather than panicking or growing the
        // cache unboundedly; we only assert this completes cleanly.
        let _guard = CONFIG_LOCK.lock().unwrap();
        configure(8);
        let a = get_or_alloc(16);
        recycle(a, 16);
        let b = get_or_alloc(64);
        recycle(b, 64);
        configure(1 << 20);
    }

    #[test]
    fn double_registration_on_same_thread_is_rejected() {
        // Run on a dedicated thread so this test's registration state can't collide
        // with another test running concurrently on the same thread pool worker.
        std::thread::spawn(|| {
            let first = register().unwrap();
            assert_eq!(register().unwrap_err(), crate::error::CacheError);
            drop(first);
            // Dropping the guard releases the registration; a fresh one succeeds.
            let _second = register().unwrap();
        })
        .join()
        .unwrap();
    }
}
