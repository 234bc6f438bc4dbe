// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The task handle: an opaque reference to a suspendable computation.
//!
//! # Cancellation
//!
//! This engine does not support cancelling an individual task. A task runs to
//! completion or for the lifetime of the scheduler; the
//! only way to stop work early is to halt the scheduler it runs on, which lets
//! in-flight tasks finish and refuses new submissions.
//!
//! # Blocking & yielding
//!
//! Task bodies must not perform blocking work directly -- doing so stalls the
//! scheduler's single worker thread and every other task queued behind it. Use
//! [`crate::block`] to move blocking work onto a dedicated OS thread, and
//! [`yield_now`] to cooperatively hand control back to the scheduler between phases of
//! a long-running task.

mod builder;
mod join;
mod yield_now;

use crate::id::Id;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

pub use builder::TaskBuilder;
pub use join::JoinHandle;
pub use yield_now::yield_now;

/// The scheduler-facing API a [`TaskCell`] needs in order to reschedule itself.
///
/// This is implemented by [`crate::scheduler::Scheduler`]; it exists as a trait purely
/// so `task` does not need to depend on `scheduler`'s concrete type, avoiding a module
/// cycle.
pub(crate) trait Schedule: Send + Sync {
    fn schedule(&self, task: Arc<TaskCell>);
}

/// A type-erased, poll-once-to-Ready-or-Pending computation.
///
/// Every spawned `Future` is wrapped in a `TaskFuture<F>` implementing this trait so
/// the scheduler can hold a homogeneous `Arc<dyn ErasedTask>` regardless of the
/// concrete future type -- a hand-rolled task vtable would dodge per-future
/// monomorphization cost, but ordinary trait objects are the simpler, equally correct
/// tool in hosted Rust.
trait ErasedTask: Send {
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()>;
}

struct TaskFuture<F: Future> {
    future: F,
    join: crate::awaitable::Awaitable<Result<F::Output, crate::error::JoinError>>,
}

impl<F> ErasedTask for TaskFuture<F>
where
    F: Future + Send,
    F::Output: Send,
{
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        // Safety: `self` is never moved out of; we only ever project `future` through
        // a pinned reference obtained from a `Pin<&mut Self>`.
        let this = unsafe { self.get_unchecked_mut() };
        let fut = unsafe { Pin::new_unchecked(&mut this.future) };

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| fut.poll(cx)));

        match result {
            Ok(Poll::Ready(value)) => {
                this.join.fulfill(Ok(value));
                Poll::Ready(())
            }
            Ok(Poll::Pending) => Poll::Pending,
            Err(payload) => {
                this.join
                    .fulfill(Err(crate::error::JoinError::from_panic(payload.as_ref())));
                Poll::Ready(())
            }
        }
    }
}

/// A spawned task, pending or in progress, identified by [`Id`].
///
/// `TaskCell` is reference-counted: the scheduler's run queue holds one `Arc`, and the
/// `Waker` handed to the task's `Future::poll` holds another (via [`std::task::Wake`]),
/// so a task that has suspended itself on some unrelated awaitable is kept alive by
/// whichever external actor intends to wake it, exactly as the data model's ownership
/// section describes.
pub(crate) struct TaskCell {
    pub(crate) id: Id,
    pub(crate) name: Option<Box<str>>,
    span: tracing::Span,
    scheduler: std::sync::Weak<dyn Schedule>,
    future: parking_lot::Mutex<Pin<Box<dyn ErasedTask>>>,
}

impl TaskCell {
    pub(crate) fn new(
        id: Id,
        name: Option<Box<str>>,
        span: tracing::Span,
        scheduler: std::sync::Weak<dyn Schedule>,
        future: Pin<Box<dyn ErasedTask>>,
    ) -> Self {
        Self {
            id,
            name,
            span,
            scheduler,
            future: parking_lot::Mutex::new(future),
        }
    }

    pub(crate) fn poll(self: &Arc<Self>) -> Poll<()> {
        let _span = self.span.enter();
        let waker = std::task::Waker::from(self.clone());
        let mut cx = Context::from_waker(&waker);
        let mut guard = self.future.lock();
        guard.as_mut().poll(&mut cx)
    }
}

impl std::task::Wake for TaskCell {
    fn wake(self: Arc<Self>) {
        Self::wake_by_ref(&self)
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            tracing::trace!(task.id = self.id.as_u64(), "waking task");
            scheduler.schedule(self.clone());
        } else {
            tracing::trace!(
                task.id = self.id.as_u64(),
                "dropping wake for task whose scheduler no longer exists"
            );
        }
    }
}

impl std::fmt::Debug for TaskCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCell")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
