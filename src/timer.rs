// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A dedicated thread maintaining a time-ordered list of pending timers.
//!
//! The run loop locks, drains every timer whose deadline has passed into a local list,
//! unlocks and invokes their callbacks, relocks, then decides between a timed
//! condition-variable wait and a tight busy-wait spin depending on how close the next
//! deadline is.

use crate::awaitable::Awaitable;
use crate::config::{TimeoutAlgorithm, TimerConfig};
use crate::error::TimerError;
use crate::id::Sid;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct TimerEntry {
    sid: Sid,
    deadline: Instant,
    on_timeout: Box<dyn FnOnce() + Send>,
    on_cancel: Option<Box<dyn FnOnce() + Send>>,
}

struct Shared {
    entries: Mutex<Vec<TimerEntry>>,
    condvar: Condvar,
    /// Bumped on every insert/cancel so a busy-waiting thread notices it should
    /// re-evaluate instead of spinning on a deadline that no longer applies.
    generation: AtomicU64,
    halted: AtomicBool,
}

/// The process-wide timer service.
pub(crate) struct TimerService {
    shared: Arc<Shared>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl TimerService {
    pub(crate) fn launch(config: TimerConfig) -> Arc<Self> {
        let shared = Arc::new(Shared {
            entries: Mutex::new(Vec::new()),
            condvar: Condvar::new(),
            generation: AtomicU64::new(0),
            halted: AtomicBool::new(false),
        });

        let service = Arc::new(Self {
            shared: shared.clone(),
            thread: Mutex::new(None),
        });

        let handle = std::thread::Builder::new()
            .name("timer".to_string())
            .spawn(move || run(shared, config))
            .expect("failed to spawn timer thread");
        *service.thread.lock() = Some(handle);

        service
    }

    /// Insert a new timer, sorted into the list by ascending deadline.
    pub(crate) fn insert(
        &self,
        deadline: Instant,
        on_timeout: Box<dyn FnOnce() + Send>,
        on_cancel: Option<Box<dyn FnOnce() + Send>>,
    ) -> Sid {
        let sid = Sid::new();
        let entry = TimerEntry {
            sid: sid.clone(),
            deadline,
            on_timeout,
            on_cancel,
        };

        {
            let mut guard = self.shared.entries.lock();
            let pos = guard.partition_point(|e| e.deadline <= deadline);
            guard.insert(pos, entry);
        }
        self.shared.generation.fetch_add(1, Ordering::Release);
        self.shared.condvar.notify_all();

        sid
    }

    /// Cancel a pending timer, running its on-cancel callback if present.
    ///
    /// Returns `true` iff `sid` was found still running and removed.
    pub(crate) fn cancel(&self, sid: &Sid) -> bool {
        let removed = {
            let mut guard = self.shared.entries.lock();
            let pos = guard.iter().position(|e| &e.sid == sid);
            pos.map(|i| guard.remove(i))
        };
        self.shared.generation.fetch_add(1, Ordering::Release);
        self.shared.condvar.notify_all();

        match removed {
            Some(entry) => {
                if let Some(on_cancel) = entry.on_cancel {
                    on_cancel();
                }
                true
            }
            None => false,
        }
    }

    pub(crate) fn running(&self, sid: &Sid) -> bool {
        self.shared.entries.lock().iter().any(|e| &e.sid == sid)
    }

    /// Start a timer that resolves an [`Awaitable<bool>`] with `true` on fire or
    /// `false` on cancel -- the shape `sleep`/`timer_start` build on.
    pub(crate) fn after(&self, duration: Duration) -> Result<(Sid, Awaitable<bool>), TimerError> {
        let now = Instant::now();
        let deadline = now
            .checked_add(duration)
            .ok_or(TimerError::DurationTooLong { requested: duration })?;

        let awaitable = Awaitable::new();
        let on_timeout_awaitable = awaitable.clone();
        let on_cancel_awaitable = awaitable.clone();

        let sid = self.insert(
            deadline,
            Box::new(move || on_timeout_awaitable.fulfill(true)),
            Some(Box::new(move || on_cancel_awaitable.fulfill(false))),
        );

        Ok((sid, awaitable))
    }

    /// Cancel every pending timer (running each `on_cancel`, resuming any task
    /// suspended on it) and stop the timer thread.
    pub(crate) fn shutdown(&self) {
        let drained = {
            let mut guard = self.shared.entries.lock();
            std::mem::take(&mut *guard)
        };
        for entry in drained {
            if let Some(on_cancel) = entry.on_cancel {
                on_cancel();
            }
        }

        self.shared.halted.store(true, Ordering::Release);
        {
            let _guard = self.shared.entries.lock();
            self.shared.condvar.notify_all();
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                tracing::warn!("timer thread panicked during shutdown");
            }
        }
    }
}

impl std::fmt::Debug for TimerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerService").finish_non_exhaustive()
    }
}

/// The default early-wakeup algorithm: trades CPU for precision on longer sleeps by
/// tiering the wakeup target between a long threshold (re-check occasionally), a short
/// threshold (enter the busy-wait window), and the busy-wait threshold itself (spin).
fn early_wakeup(now: Instant, deadline: Instant, config: &TimerConfig) -> Instant {
    match config.algorithm {
        TimeoutAlgorithm::Exact => deadline,
        TimeoutAlgorithm::ShortLongThreshold => {
            let remaining = deadline.saturating_duration_since(now);
            if remaining > config.early_wakeup_long_threshold {
                deadline
                    .checked_sub(config.early_wakeup_long_threshold)
                    .unwrap_or(now)
            } else if remaining > config.early_wakeup_short_threshold {
                deadline
                    .checked_sub(config.busy_wait_threshold)
                    .unwrap_or(now)
            } else {
                now + config.early_wakeup_short_threshold
            }
        }
    }
}

fn run(shared: Arc<Shared>, config: TimerConfig) {
    // Held for the timer thread's entire lifetime; see `memory::register`.
    let _cache = crate::memory::register().ok();
    loop {
        if shared.halted.load(Ordering::Acquire) {
            return;
        }

        let mut ready = Vec::new();
        {
            let mut guard = shared.entries.lock();
            loop {
                if shared.halted.load(Ordering::Acquire) {
                    return;
                }
                match guard.first() {
                    None => shared.condvar.wait(&mut guard),
                    Some(entry) => {
                        if Instant::now() >= entry.deadline {
                            ready.push(guard.remove(0));
                        } else {
                            break;
                        }
                    }
                }
            }
        }

        // Callbacks run outside the lock: they may call back into this service (e.g.
        // a task immediately starting a new timer) or into a scheduler.
        for entry in ready.drain(..) {
            (entry.on_timeout)();
        }

        let snapshot = {
            let guard = shared.entries.lock();
            guard.first().map(|e| e.deadline)
        };

        match snapshot {
            None => {
                let mut guard = shared.entries.lock();
                if guard.is_empty() && !shared.halted.load(Ordering::Acquire) {
                    shared.condvar.wait(&mut guard);
                }
            }
            Some(deadline) => {
                let now = Instant::now();
                let remaining = deadline.saturating_duration_since(now);
                let generation = shared.generation.load(Ordering::Acquire);

                if remaining <= config.busy_wait_threshold {
                    while Instant::now() < deadline
                        && shared.generation.load(Ordering::Acquire) == generation
                        && !shared.halted.load(Ordering::Acquire)
                    {
                        std::hint::spin_loop();
                    }
                } else {
                    let wake_at = early_wakeup(now, deadline, &config);
                    let wait_for = wake_at.saturating_duration_since(Instant::now());
                    let mut guard = shared.entries.lock();
                    let _ = shared.condvar.wait_for(&mut guard, wait_for);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

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
    fn timer_fires_within_bounded_window() {
        let service = TimerService::launch(TimerConfig::default());
        let start = Instant::now();
        let (_sid, awaitable) = service.after(Duration::from_millis(20)).unwrap();

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        loop {
            if let Poll::Ready(fired) = awaitable.poll(&mut cx) {
                assert!(fired);
                break;
            }
            if start.elapsed() > Duration::from_secs(2) {
                panic!("timer never fired");
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(start.elapsed() >= Duration::from_millis(20));
        service.shutdown();
    }

    #[test]
    fn cancel_resolves_false_and_running_reflects_state() {
        let service = TimerService::launch(TimerConfig::default());
        let (sid, awaitable) = service.after(Duration::from_millis(500)).unwrap();
        assert!(service.running(&sid));

        std::thread::sleep(Duration::from_millis(10));
        assert!(service.cancel(&sid));
        assert!(!service.running(&sid));
        // Cancelling twice returns false the second time.
        assert!(!service.cancel(&sid));

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        match awaitable.poll(&mut cx) {
            Poll::Ready(fired) => assert!(!fired),
            Poll::Pending => panic!("expected the cancel to have resolved the awaitable"),
        }
        service.shutdown();
    }

    #[test]
    fn duration_overflow_is_rejected() {
        let service = TimerService::launch(TimerConfig::default());
        let err = service.after(Duration::MAX).unwrap_err();
        assert!(matches!(err, TimerError::DurationTooLong { .. }));
        service.shutdown();
    }
}
