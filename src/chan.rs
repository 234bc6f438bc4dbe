// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A minimal unbounded multi-producer, single-consumer channel for moving values
//! between tasks.
//!
//! This is not one of the four core subsystems -- it exists so a task waiting on
//! another task's output has something other than a raw [`crate::awaitable::Awaitable`]
//! to reach for, the same ergonomic role `async-kit`'s channel types play over the
//! engine's bare rendezvous primitive.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

struct Shared<T> {
    queue: Mutex<VecDeque<T>>,
    waker: Mutex<Option<Waker>>,
    senders: AtomicUsize,
    receiver_dropped: std::sync::atomic::AtomicBool,
}

/// The sending half of a channel. Cheap to clone; the channel stays open as long as at
/// least one `Sender` is alive.
pub struct Sender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.shared.senders.fetch_add(1, Ordering::Relaxed);
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        if self.shared.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(waker) = self.shared.waker.lock().take() {
                waker.wake();
            }
        }
    }
}

/// Returned by [`Sender::send`] if every [`Receiver`] has already been dropped.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SendError;

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("receiver has been dropped")
    }
}

impl std::error::Error for SendError {}

impl<T> Sender<T> {
    /// Push a value onto the channel, waking a pending [`Receiver::recv`] if one is
    /// registered.
    pub fn send(&self, value: T) -> Result<(), SendError> {
        if self.shared.receiver_dropped.load(Ordering::Acquire) {
            return Err(SendError);
        }
        self.shared.queue.lock().push_back(value);
        if let Some(waker) = self.shared.waker.lock().take() {
            waker.wake();
        }
        Ok(())
    }
}

/// The receiving half of a channel.
pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.shared.receiver_dropped.store(true, Ordering::Release);
    }
}

impl<T> Receiver<T> {
    /// Await the next value, resolving to `None` once every `Sender` has been dropped
    /// and the queue is empty.
    pub fn recv(&mut self) -> Recv<'_, T> {
        Recv { receiver: self }
    }
}

/// The future returned by [`Receiver::recv`].
pub struct Recv<'a, T> {
    receiver: &'a mut Receiver<T>,
}

impl<T> Future for Recv<'_, T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let shared = &self.receiver.shared;
        if let Some(value) = shared.queue.lock().pop_front() {
            return Poll::Ready(Some(value));
        }
        if shared.senders.load(Ordering::Acquire) == 0 {
            return Poll::Ready(None);
        }
        *shared.waker.lock() = Some(cx.waker().clone());
        // Re-check after registering the waker: a sender may have pushed a value (or
        // dropped itself) between the first check and the lock above.
        if let Some(value) = shared.queue.lock().pop_front() {
            return Poll::Ready(Some(value));
        }
        if shared.senders.load(Ordering::Acquire) == 0 {
            return Poll::Ready(None);
        }
        Poll::Pending
    }
}

/// Create a new channel, returning its sender and receiver halves.
pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(VecDeque::new()),
        waker: Mutex::new(None),
        senders: AtomicUsize::new(1),
        receiver_dropped: std::sync::atomic::AtomicBool::new(false),
    });
    (
        Sender {
            shared: shared.clone(),
        },
        Receiver { shared },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::{RawWaker, RawWakerVTable};

    fn noop_waker() -> Waker {
        fn clone(_: *const ()) -> RawWaker {
            RawWaker::new(std::ptr::null(), &VTABLE)
        }
        fn noop(_: *const ()) {}
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
        // Safety: the vtable's functions are all no-ops and never dereference the data
        // pointer, so a null pointer is sound here.
        unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
    }

    #[test]
    fn send_then_recv_in_fifo_order() {
        let (tx, mut rx) = channel::<i32>();
        tx.send(1).unwrap();
        tx.send(2).unwrap();

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut recv = Box::pin(rx.recv());
        assert_eq!(recv.as_mut().poll(&mut cx), Poll::Ready(Some(1)));
        drop(recv);

        let mut recv = Box::pin(rx.recv());
        assert_eq!(recv.as_mut().poll(&mut cx), Poll::Ready(Some(2)));
    }

    #[test]
    fn recv_resolves_to_none_once_every_sender_is_dropped() {
        let (tx, mut rx) = channel::<i32>();
        drop(tx);

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut recv = Box::pin(rx.recv());
        assert_eq!(recv.as_mut().poll(&mut cx), Poll::Ready(None));
    }

    #[test]
    fn send_after_receiver_dropped_errors() {
        let (tx, rx) = channel::<i32>();
        drop(rx);
        assert_eq!(tx.send(1), Err(SendError));
    }

    #[test]
    fn pending_recv_wakes_on_send() {
        let (tx, mut rx) = channel::<i32>();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut recv = Box::pin(rx.recv());
        assert_eq!(recv.as_mut().poll(&mut cx), Poll::Pending);
        tx.send(7).unwrap();
        assert_eq!(recv.as_mut().poll(&mut cx), Poll::Ready(Some(7)));
    }
}
