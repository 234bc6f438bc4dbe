// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Tracks, per OS thread, which scheduler (if any) is currently polling a task on it.
//!
//! [`crate::blocking::BlockingService::block`] consults this to decide whether it was
//! called from inside a task (dispatch to a worker and suspend) or from a plain thread
//! (run synchronously). It is also how the blocking service distinguishes the global
//! scheduler's thread from other schedulers' for worker-cache sizing.

use std::cell::Cell;

thread_local! {
    static CURRENT_SCHEDULER: Cell<Option<usize>> = const { Cell::new(None) };
    static IN_BLOCKING_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// The index of the scheduler currently polling a task on this thread, if any.
pub(crate) fn current_scheduler_index() -> Option<usize> {
    CURRENT_SCHEDULER.with(Cell::get)
}

/// Whether this thread is a blocking worker's dedicated thread.
///
/// Used to guard against the unbounded-spawn cycle that would result if a callable
/// running inside a blocking worker itself called `block()`.
pub(crate) fn is_blocking_worker() -> bool {
    IN_BLOCKING_WORKER.with(Cell::get)
}

/// RAII guard marking the current thread as a blocking worker for its lifetime.
pub(crate) struct BlockingWorker;

impl BlockingWorker {
    pub(crate) fn enter() -> Self {
        IN_BLOCKING_WORKER.with(|c| c.set(true));
        Self
    }
}

impl Drop for BlockingWorker {
    fn drop(&mut self) {
        IN_BLOCKING_WORKER.with(|c| c.set(false));
    }
}

/// RAII guard installing `index` as the current scheduler for the lifetime of the
/// guard, restoring the previous value on drop. Re-entrant: nesting is harmless,
/// though the runtime never nests scheduler contexts in practice (a scheduler's run
/// loop never polls a task while already polling another).
pub(crate) struct Entered {
    previous: Option<usize>,
}

impl Entered {
    pub(crate) fn scheduler(index: usize) -> Self {
        let previous = CURRENT_SCHEDULER.with(|c| c.replace(Some(index)));
        Self { previous }
    }
}

impl Drop for Entered {
    fn drop(&mut self) {
        CURRENT_SCHEDULER.with(|c| c.set(self.previous));
    }
}
