// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The producer/consumer handshake used throughout the runtime.
//!
//! A task suspends on an [`Awaitable`] by polling it inside a `Future` impl; some
//! external actor -- a blocking worker finishing a callable, the timer thread reaching
//! a deadline, or another task completing -- fulfils it from a (possibly different)
//! thread. Fulfilling wakes whatever [`Waker`] was last registered, which is how the
//! resumer re-enqueues the suspended task on its origin scheduler: the waker handed to
//! `poll` by a scheduler's task already closes over that scheduler, so there is no need
//! for `Awaitable` to separately track where the task came from.

use parking_lot::Mutex;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

enum State<T> {
    Pending(Option<Waker>),
    Ready(T),
    Consumed,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    awaited: AtomicBool,
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        if !self.awaited.load(Ordering::Acquire) {
            return;
        }
        let guard = self.state.lock();
        if matches!(&*guard, State::Pending(_)) {
            drop(guard);
            crate::error::fatal("awaitable was awaited but dropped before being resumed");
        }
    }
}

/// A rendezvous object: the awaiter polls it, the resumer fulfils it.
///
/// Cloning an `Awaitable` clones the handle, not the state -- both sides share one
/// underlying slot, exactly like the two ends of a `oneshot::channel`.
pub struct Awaitable<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Awaitable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Awaitable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Awaitable<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending(None)),
                awaited: AtomicBool::new(false),
            }),
        }
    }

    /// Construct an already-`Ready` awaitable, e.g. for `block()` invoked off-task.
    pub fn ready(value: T) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Ready(value)),
                awaited: AtomicBool::new(false),
            }),
        }
    }

    /// Fulfil the awaitable with `value`, waking whoever is currently suspended on it.
    ///
    /// Must be called at most once; calling it twice is a logic error in the caller
    /// (the second call silently overwrites an already-consumed or already-ready slot)
    /// and is debug-asserted against.
    pub fn fulfill(&self, value: T) {
        let waker = {
            let mut guard = self.inner.state.lock();
            match std::mem::replace(&mut *guard, State::Ready(value)) {
                State::Pending(waker) => waker,
                State::Ready(_) | State::Consumed => {
                    debug_assert!(false, "Awaitable::fulfill called more than once");
                    None
                }
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Poll for the result, registering `cx`'s waker if not yet ready.
    pub fn poll(&self, cx: &mut Context<'_>) -> Poll<T> {
        self.inner.awaited.store(true, Ordering::Release);
        let mut guard = self.inner.state.lock();
        match &mut *guard {
            State::Pending(waker) => {
                *waker = Some(cx.waker().clone());
                Poll::Pending
            }
            State::Ready(_) => {
                let State::Ready(value) = std::mem::replace(&mut *guard, State::Consumed) else {
                    unreachable!()
                };
                Poll::Ready(value)
            }
            State::Consumed => crate::error::fatal("Awaitable polled after its result was taken"),
        }
    }

    /// `true` once a value has been delivered (whether or not it has been consumed).
    pub fn is_ready(&self) -> bool {
        matches!(&*self.inner.state.lock(), State::Ready(_) | State::Consumed)
    }
}

impl<T> fmt::Debug for Awaitable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Awaitable")
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// A [`Future`]-compatible wrapper so an [`Awaitable`] can be `.await`ed directly.
pub struct AwaitableFuture<T>(pub Awaitable<T>);

impl<T> std::future::Future for AwaitableFuture<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().0.poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::task::{RawWaker, RawWakerVTable};

    fn noop_waker() -> Waker {
        fn clone(_: *const ()) -> RawWaker {
            RawWaker::new(std::ptr::null(), &VTABLE)
        }
        fn noop(_: *const ()) {}
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
        // Safety: the vtable's functions are all no-ops and never dereference the
        // data pointer, so a null pointer is sound here.
        unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
    }

    #[test]
    fn fulfill_before_poll_resolves_immediately() {
        let a = Awaitable::new();
        a.fulfill(42);
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let fut = AwaitableFuture(a);
        futures_pin_poll(fut, &mut cx);
    }

    fn futures_pin_poll<T>(fut: AwaitableFuture<T>, cx: &mut Context<'_>) -> T {
        let mut fut = Box::pin(fut);
        match fut.as_mut().poll(cx) {
            Poll::Ready(v) => v,
            Poll::Pending => panic!("expected Ready"),
        }
    }

    #[test]
    fn poll_then_fulfill_wakes() {
        let a = Awaitable::new();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(matches!(a.poll(&mut cx), Poll::Pending));
        a.fulfill("hello");
        assert!(matches!(a.poll(&mut cx), Poll::Ready("hello")));
    }

    #[test]
    fn unawaited_ready_awaitable_can_be_dropped() {
        let a: Awaitable<i32> = Awaitable::ready(7);
        drop(a);
    }
}
