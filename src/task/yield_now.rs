// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Yield control back to the scheduler once, then resume.
///
/// The first poll always returns `Pending` after waking its own waker, which
/// re-enqueues the task at the tail of the scheduler's submission queue; the scheduler
/// then moves on to the next runnable task before coming back around to this one.
///
/// ```
/// # #![allow(unused)]
/// async {
///     loop {
///         cothread::task::yield_now().await;
///         // ... do one unit of work, then loop back around ...
///     }
/// };
/// ```
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

#[doc(hidden)]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
