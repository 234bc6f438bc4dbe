// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::awaitable::Awaitable;
use crate::id::Id;
use crate::task::join::JoinHandle;
use crate::task::{Schedule, TaskCell, TaskFuture};
use std::future::Future;
use std::sync::{Arc, Weak};

/// Configures a task before spawning it onto a scheduler.
///
/// By default tasks are unnamed; giving a task a name only affects `tracing` output
/// and `Debug` formatting.
pub struct TaskBuilder<'a> {
    scheduler: Weak<dyn Schedule>,
    name: Option<&'a str>,
}

impl<'a> TaskBuilder<'a> {
    pub(crate) fn new(scheduler: Weak<dyn Schedule>) -> Self {
        Self {
            scheduler,
            name: None,
        }
    }

    /// Override the name of the task spawned by this builder.
    pub fn name(mut self, name: &'a str) -> Self {
        self.name = Some(name);
        self
    }

    /// Spawn `future` onto this builder's scheduler.
    ///
    /// Spawning on its own does nothing but enqueue the task; the scheduler's own run
    /// loop (on its dedicated OS thread) is what actually polls it.
    #[track_caller]
    pub fn spawn<F>(self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let id = Id::next();
        let span = tracing::trace_span!(
            "task",
            task.id = id.as_u64(),
            task.name = self.name.unwrap_or("<unnamed>"),
        );

        let join = Awaitable::new();
        let task_future = TaskFuture {
            future,
            join: join.clone(),
        };

        let boxed: std::pin::Pin<Box<dyn crate::task::ErasedTask>> = Box::pin(task_future);
        let cell = Arc::new(TaskCell::new(
            id,
            self.name.map(Into::into),
            span,
            self.scheduler.clone(),
            boxed,
        ));

        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.schedule(cell);
        } else {
            tracing::warn!(task.id = id.as_u64(), "scheduler dropped before spawn");
        }

        JoinHandle { awaitable: join }
    }
}
