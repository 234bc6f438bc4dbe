// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Error taxonomy for the runtime.
//!
//! Errors here fall into three of the four buckets described by the engine's error
//! handling design: operation-rejected errors (returned to the caller), recoverable
//! errors (not really errors at all, just signalled through `Result`), and propagated
//! user errors (a panic inside a `block()` callable or a task). Fatal invariant
//! violations are not representable as values; they abort the process, see
//! [`crate::fatal`].

use std::fmt;
use std::time::Duration;

/// Returned by [`crate::Scheduler::schedule`] when the scheduler has already been
/// halted.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub struct ScheduleError;

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("scheduler has been halted, no further tasks can be scheduled")
    }
}

impl std::error::Error for ScheduleError {}

/// Errors produced by the timer service.
#[derive(Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum TimerError {
    /// The requested duration, when added to `now`, overflowed the clock's
    /// representable range.
    DurationTooLong {
        requested: Duration,
    },
}

impl fmt::Display for TimerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerError::DurationTooLong { requested } => {
                write!(f, "duration too long to schedule a timer for: {requested:?}")
            }
        }
    }
}

impl std::error::Error for TimerError {}

/// A thread attempted to register its per-thread memory cache with the active
/// lifecycle while a previous registration on that same thread was still live.
///
/// Mirrors the original engine's `cache_already_registered` exception: each thread
/// scheduler, blocking-worker, or timer thread registers its cache exactly once at
/// startup, and the registration is released when the thread's [`crate::memory::Registration`]
/// guard drops at shutdown.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub struct CacheError;

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("this thread's memory cache is already registered")
    }
}

impl std::error::Error for CacheError {}

/// A task's result could not be joined cleanly.
///
/// This is a propagated user error: a `block()` callable or task body panicked. The
/// panic payload is captured (where it can be, i.e. it is a `String` or `&'static str`)
/// so callers can decide how to react, per the engine's rule that user-visible errors
/// flow through the same awaitable channel as successful results.
#[derive(Debug)]
pub struct JoinError {
    message: String,
}

impl JoinError {
    pub(crate) fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "task panicked with a non-string payload".to_string()
        };
        Self { message }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Wrap an operation-rejected error (e.g. [`ScheduleError`]) as a join result.
    ///
    /// Used when a task is never actually spawned -- scheduling onto an already-halted
    /// scheduler -- so the caller still gets a `JoinHandle` that resolves, rather than
    /// one that hangs forever.
    pub(crate) fn rejected(err: impl fmt::Display) -> Self {
        Self {
            message: err.to_string(),
        }
    }
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task panicked: {}", self.message)
    }
}

impl std::error::Error for JoinError {}

/// Report a fatal invariant violation and abort the process.
///
/// The engine cannot meaningfully recover from its own invariant breaches (an awaited
/// awaitable dropped without being resumed, an unhandled panic escaping a scheduler's
/// resume of a task, two lifecycles alive at once): these are bugs in the runtime or in
/// code that bypasses its API, not conditions application code can be expected to
/// handle.
#[track_caller]
pub(crate) fn fatal(what: &str) -> ! {
    let location = std::panic::Location::caller();
    tracing::error!(%location, "fatal invariant violation: {what}");
    std::process::abort();
}
