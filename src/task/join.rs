// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::awaitable::Awaitable;
use crate::error::JoinError;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// A handle returned by `schedule`/`spawn`, used to await a task's completion/result.
///
/// Polling (or `.await`ing) a `JoinHandle` suspends the caller -- which may itself be a
/// task on some other scheduler -- until the spawned task completes or panics.
#[must_use = "a JoinHandle does nothing unless polled or awaited; dropping it detaches the task"]
pub struct JoinHandle<T> {
    pub(crate) awaitable: Awaitable<Result<T, JoinError>>,
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.awaitable.poll(cx)
    }
}

impl<T> std::fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinHandle").finish_non_exhaustive()
    }
}
