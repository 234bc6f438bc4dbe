// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A single-threaded cooperative executor.
//!
//! Each `Scheduler` owns one dedicated OS thread running [`Scheduler::run`]. Tasks are
//! submitted through [`Scheduler::spawn`] (or, for already-built cells, the
//! [`task::Schedule`] impl used by wakers); the run loop swaps the shared submission
//! queue into a private one before draining it, so a task that reschedules itself mid-
//! drain -- whether by yielding or by some other waker firing synchronously -- lands in
//! the *next* drain rather than being visited twice in the same pass.

use crate::awaitable::Awaitable;
use crate::error::{JoinError, ScheduleError};
use crate::task::{JoinHandle, Schedule, TaskBuilder, TaskCell};
use parking_lot::{Condvar, Mutex};
use static_assertions::assert_impl_all;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunState {
    Ready = 0,
    Running = 1,
    Suspended = 2,
    Halted = 3,
}

impl RunState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Ready,
            1 => Self::Running,
            2 => Self::Suspended,
            _ => Self::Halted,
        }
    }
}

/// A single-threaded run loop draining a FIFO of runnable tasks.
pub(crate) struct Scheduler {
    index: usize,
    queue: Mutex<VecDeque<Arc<TaskCell>>>,
    condvar: Condvar,
    state: AtomicU8,
    scheduled_count: AtomicUsize,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Scheduler {
    /// Construct a scheduler and launch its run loop on a dedicated OS thread.
    pub(crate) fn launch(index: usize) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            index,
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            state: AtomicU8::new(RunState::Ready as u8),
            scheduled_count: AtomicUsize::new(0),
            thread: Mutex::new(None),
        });

        let worker = scheduler.clone();
        let handle = std::thread::Builder::new()
            .name(format!("scheduler-{index}"))
            .spawn(move || worker.run())
            .expect("failed to spawn scheduler thread");
        *scheduler.thread.lock() = Some(handle);

        scheduler
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Best-effort snapshot of queued-plus-executing tasks. Used by the thread pool's
    /// load balancer; no locking guarantees.
    pub(crate) fn scheduled_count(&self) -> usize {
        self.scheduled_count.load(Ordering::Relaxed)
    }

    /// Signal the run loop to stop once it has drained whatever is currently queued.
    /// Does not block; call [`Scheduler::join`] to wait for the OS thread to exit.
    pub(crate) fn halt(&self) {
        self.set_state(RunState::Halted);
        let _guard = self.queue.lock();
        self.condvar.notify_all();
    }

    /// Block until this scheduler's run loop thread has exited.
    ///
    /// Must only be called after [`Scheduler::halt`]; calling it on a scheduler that is
    /// still accepting work blocks forever.
    pub(crate) fn join(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!(scheduler.index = self.index, "scheduler thread panicked");
            }
        }
    }

    fn is_halted(&self) -> bool {
        self.state() == RunState::Halted
    }

    fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: RunState) {
        self.state.store(state as u8, Ordering::Release);
        tracing::debug!(scheduler.index = self.index, ?state, "scheduler state transition");
    }

    /// Spawn `future` onto this scheduler, returning a handle to await its result.
    ///
    /// If this scheduler has already been halted, no task is created: the returned
    /// handle resolves immediately with a [`crate::error::JoinError`] wrapping
    /// [`ScheduleError`], matching the "sentinel not-scheduled awaitable" behaviour
    /// called for when submissions race a shutdown.
    pub(crate) fn spawn<F>(self: &Arc<Self>, name: Option<&str>, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.is_halted() {
            tracing::warn!(scheduler.index = self.index, "schedule rejected: scheduler halted");
            let awaitable = Awaitable::ready(Err(JoinError::rejected(ScheduleError)));
            return JoinHandle { awaitable };
        }

        let weak: Weak<dyn Schedule> = Arc::downgrade(self);
        let mut builder = TaskBuilder::new(weak);
        if let Some(name) = name {
            builder = builder.name(name);
        }
        builder.spawn(future)
    }

    fn run(self: Arc<Self>) {
        // Held for the run loop's entire lifetime; ties the thread-local memory cache
        // to this thread explicitly rather than leaving it a free-floating global.
        let _cache = crate::memory::register().ok();
        let mut private: VecDeque<Arc<TaskCell>> = VecDeque::new();

        loop {
            {
                let mut guard = self.queue.lock();
                while guard.is_empty() && self.state() != RunState::Halted {
                    self.set_state(RunState::Suspended);
                    self.condvar.wait(&mut guard);
                }
                if guard.is_empty() {
                    // Halted with nothing left to drain.
                    break;
                }
                std::mem::swap(&mut *guard, &mut private);
            }

            self.set_state(RunState::Running);
            let _entered = crate::context::Entered::scheduler(self.index);
            for task in private.drain(..) {
                self.scheduled_count.fetch_sub(1, Ordering::Relaxed);
                let _ = task.poll();
            }
        }

        tracing::debug!(scheduler.index = self.index, "run loop exiting");
    }

    /// Run exactly one swap-and-drain pass without a background thread.
    ///
    /// Used only by tests that need to pin down drain boundaries deterministically;
    /// production code always goes through the OS-thread-driven [`Scheduler::run`].
    #[cfg(test)]
    fn drain_once(&self) {
        let mut private: VecDeque<Arc<TaskCell>> = VecDeque::new();
        {
            let mut guard = self.queue.lock();
            std::mem::swap(&mut *guard, &mut private);
        }
        for task in private.drain(..) {
            self.scheduled_count.fetch_sub(1, Ordering::Relaxed);
            let _ = task.poll();
        }
    }
}

impl Schedule for Scheduler {
    fn schedule(&self, task: Arc<TaskCell>) {
        if self.is_halted() {
            tracing::trace!(
                scheduler.index = self.index,
                task.id = task.id.as_u64(),
                "dropping schedule: scheduler halted"
            );
            return;
        }
        let mut guard = self.queue.lock();
        guard.push_back(task);
        self.scheduled_count.fetch_add(1, Ordering::Relaxed);
        self.condvar.notify_one();
    }
}

assert_impl_all!(Scheduler: Schedule, Send, Sync);

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("index", &self.index)
            .field("state", &self.state())
            .field("scheduled_count", &self.scheduled_count())
            .finish()
    }
}
