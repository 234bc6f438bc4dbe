// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A cooperative coroutine runtime.
//!
//! [`initialize`] starts a [`Lifecycle`] scoping the runtime's four core services: a
//! pool of single-threaded cooperative [`Scheduler`]s (`scheduler`/`pool`), an off-thread
//! [`block`] facility for calling blocking code from a task without stalling its
//! scheduler, a timer service backing [`sleep`]/[`timer_start`], and a per-thread memory
//! cache used by the hot paths of all three. `module::import` loads an external `cdylib`
//! built against this crate and awaits its `start` entry point to completion.
//!
//! [`Scheduler`]: crate::scheduler::Scheduler

mod awaitable;
pub mod chan;
mod blocking;
pub mod config;
mod context;
mod error;
mod id;
mod lifecycle;
mod memory;
pub mod module;
mod pool;
mod scheduler;
pub mod task;
mod timer;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

pub use awaitable::{Awaitable, AwaitableFuture};
pub use config::Config;
pub use error::{CacheError, JoinError, ScheduleError, TimerError};
pub use id::{Id, Sid};
pub use lifecycle::Lifecycle;
pub use task::{yield_now, JoinHandle};

/// Construct the runtime, returning a handle that scopes its existence.
///
/// Dropping the returned [`Lifecycle`] tears down every service in the reverse of their
/// construction order. Only one `Lifecycle` may be alive in the process at a time;
/// constructing a second one while the first is still alive aborts the process (see
/// [`error::fatal`]).
pub fn initialize(config: Config) -> Lifecycle {
    Lifecycle::new(config)
}

/// Schedule `future` onto a lightly-loaded scheduler in the thread pool.
///
/// Equivalent to `threadpool::schedule`; provided at the crate root because it is the
/// overwhelmingly common case.
pub fn schedule<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    lifecycle::active().thread_pool.schedule(future)
}

/// Schedule `future` onto a lightly-loaded scheduler, tagging the resulting task with
/// `name` for `tracing` output and `Debug` formatting.
pub fn schedule_named<F>(name: &str, future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    lifecycle::active().thread_pool.schedule_named(name, future)
}

/// Thread-pool-scoped scheduling and load-balancer introspection.
pub mod threadpool {
    use super::*;

    /// Schedule `future` onto a lightly-loaded scheduler, selected by the "lightest"
    /// algorithm (see [`lightest`]).
    pub fn schedule<F>(future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        crate::schedule(future)
    }

    /// The index of the scheduler the "lightest" algorithm would currently pick.
    ///
    /// Exposed for tests and diagnostics; `schedule` already applies this selection
    /// internally, there is no separate step needed to use it.
    pub fn lightest() -> usize {
        lifecycle::active().thread_pool.select().index()
    }
}

/// Run `f` on a dedicated blocking-capable OS thread, returning an awaitable of its
/// result.
///
/// Called from inside a task, this suspends the calling task (without blocking its
/// scheduler's other work) until `f` returns. Called from a plain thread -- including
/// from a timer callback, which never runs inside a scheduler's task-polling context --
/// `f` runs synchronously on the calling thread instead, since there is no task to keep
/// responsive.
pub fn block<F, R>(f: F) -> AwaitableFuture<Result<R, JoinError>>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    AwaitableFuture(lifecycle::active().blocking.block(f))
}

/// The future returned by [`sleep`].
pub struct Sleep(Awaitable<bool>);

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        self.get_mut().0.poll(cx).map(|_fired| ())
    }
}

/// Suspend for `duration`, backed by the timer service.
pub fn sleep(duration: Duration) -> Result<Sleep, TimerError> {
    let (_sid, awaitable) = lifecycle::active().timer.after(duration)?;
    Ok(Sleep(awaitable))
}

/// Start a timer that fires `on_timeout` when `deadline` is reached, or `on_cancel` if
/// [`timer_cancel`] is called first.
///
/// This is the direct entry point: it takes an absolute deadline and cannot fail (there
/// is no duration-to-deadline arithmetic to overflow). [`timer_start`] is the
/// duration-based convenience built on top of it, computing `deadline = now + duration`.
///
/// Returns the new timer's [`Sid`] and an awaitable resolving to `true` if the timer
/// fired, `false` if it was cancelled.
pub fn timer_start_at<FTimeout, FCancel>(
    deadline: std::time::Instant,
    on_timeout: FTimeout,
    on_cancel: Option<FCancel>,
) -> (Sid, AwaitableFuture<bool>)
where
    FTimeout: FnOnce() + Send + 'static,
    FCancel: FnOnce() + Send + 'static,
{
    let registry = lifecycle::active();

    let awaitable = Awaitable::new();
    let on_timeout_awaitable = awaitable.clone();
    let on_cancel_awaitable = awaitable.clone();

    let sid = registry.timer.insert(
        deadline,
        Box::new(move || {
            on_timeout();
            on_timeout_awaitable.fulfill(true);
        }),
        Some(Box::new(move || {
            if let Some(on_cancel) = on_cancel {
                on_cancel();
            }
            on_cancel_awaitable.fulfill(false);
        })),
    );

    (sid, AwaitableFuture(awaitable))
}

/// Start a timer that fires `on_timeout` after `duration`, or `on_cancel` if
/// [`timer_cancel`] is called first.
///
/// Convenience over [`timer_start_at`]: computes `deadline = Instant::now() + duration`,
/// failing with [`TimerError::DurationTooLong`] if that addition overflows the clock's
/// representable range.
///
/// Returns the new timer's [`Sid`] and an awaitable resolving to `true` if the timer
/// fired, `false` if it was cancelled.
pub fn timer_start<FTimeout, FCancel>(
    duration: Duration,
    on_timeout: FTimeout,
    on_cancel: Option<FCancel>,
) -> Result<(Sid, AwaitableFuture<bool>), TimerError>
where
    FTimeout: FnOnce() + Send + 'static,
    FCancel: FnOnce() + Send + 'static,
{
    let deadline = std::time::Instant::now()
        .checked_add(duration)
        .ok_or(TimerError::DurationTooLong { requested: duration })?;

    Ok(timer_start_at(deadline, on_timeout, on_cancel))
}

/// Cancel a pending timer started by [`timer_start`] or [`sleep`].
///
/// Returns `true` iff the timer was still pending and has now been cancelled (running
/// its on-cancel callback and resolving its awaitable to `false`).
pub fn timer_cancel(sid: &Sid) -> bool {
    lifecycle::active().timer.cancel(sid)
}

/// Whether a timer started by [`timer_start`] or [`sleep`] is still pending.
pub fn timer_running(sid: &Sid) -> bool {
    lifecycle::active().timer.running(sid)
}
