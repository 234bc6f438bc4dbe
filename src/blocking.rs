// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Off-thread execution of arbitrary blocking callables.
//!
//! Dispatched work runs on a dedicated OS thread drawn from a two-level cache: a
//! per-scheduler cache (consulted only when `block()` is called from inside that
//! scheduler's task-polling thread) and a process-wide cache behind that. Workers that
//! neither cache has room for are shut down rather than leaked.

use crate::awaitable::Awaitable;
use crate::config::BlockingConfig;
use crate::context;
use crate::error::JoinError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle as ThreadHandle;

enum Job {
    Run(Box<dyn FnOnce() + Send>),
    Shutdown,
}

/// A handle to a dedicated worker thread, cheap to clone and store in a cache.
struct Worker {
    sender: mpsc::Sender<Job>,
}

struct Shared {
    global_cache: Mutex<VecDeque<Worker>>,
    global_cache_cap: usize,
    per_scheduler_caches: Vec<Mutex<VecDeque<Worker>>>,
    per_scheduler_caps: Vec<usize>,
    all_handles: Mutex<Vec<ThreadHandle<()>>>,
    next_worker_id: std::sync::atomic::AtomicUsize,
}

impl Shared {
    /// Return a finished worker to whichever cache has room, or shut it down.
    fn return_worker(&self, worker: Worker, origin: usize) {
        if let Some(cache) = self.per_scheduler_caches.get(origin) {
            let cap = self.per_scheduler_caps[origin];
            let mut guard = cache.lock();
            if guard.len() < cap {
                guard.push_back(worker);
                return;
            }
        }
        {
            let mut guard = self.global_cache.lock();
            if guard.len() < self.global_cache_cap {
                guard.push_back(worker);
                return;
            }
        }
        tracing::trace!("blocking worker cache full, shutting worker down");
        let _ = worker.sender.send(Job::Shutdown);
    }
}

/// The process-wide blocking service.
pub(crate) struct BlockingService {
    shared: Arc<Shared>,
}

impl BlockingService {
    pub(crate) fn new(config: &BlockingConfig, scheduler_count: usize) -> Self {
        let per_scheduler_caps = (0..scheduler_count)
            .map(|index| {
                if index == 0 {
                    config.global_scheduler_cache_size
                } else {
                    config.other_scheduler_cache_size
                }
            })
            .collect::<Vec<_>>();
        let per_scheduler_caches = (0..scheduler_count)
            .map(|_| Mutex::new(VecDeque::new()))
            .collect();

        Self {
            shared: Arc::new(Shared {
                global_cache: Mutex::new(VecDeque::new()),
                global_cache_cap: config.process_cache_size,
                per_scheduler_caches,
                per_scheduler_caps,
                all_handles: Mutex::new(Vec::new()),
                next_worker_id: std::sync::atomic::AtomicUsize::new(0),
            }),
        }
    }

    fn acquire(&self, origin: usize) -> Worker {
        if let Some(cache) = self.shared.per_scheduler_caches.get(origin) {
            if let Some(worker) = cache.lock().pop_front() {
                return worker;
            }
        }
        if let Some(worker) = self.shared.global_cache.lock().pop_front() {
            return worker;
        }
        self.spawn_worker(origin)
    }

    fn spawn_worker(&self, origin: usize) -> Worker {
        let id = self
            .shared
            .next_worker_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (tx, rx) = mpsc::channel::<Job>();
        let tx_for_return = tx.clone();
        let weak_shared: Weak<Shared> = Arc::downgrade(&self.shared);

        let handle = std::thread::Builder::new()
            .name(format!("blocking-{origin}-{id}"))
            .spawn(move || {
                let _guard = context::BlockingWorker::enter();
                // Held for the worker's entire lifetime; see `memory::register`.
                let _cache = crate::memory::register().ok();
                while let Ok(job) = rx.recv() {
                    match job {
                        Job::Shutdown => break,
                        Job::Run(run) => {
                            run();
                            match weak_shared.upgrade() {
                                Some(shared) => shared.return_worker(
                                    Worker {
                                        sender: tx_for_return.clone(),
                                    },
                                    origin,
                                ),
                                None => break,
                            }
                        }
                    }
                }
                tracing::trace!(worker.id = id, "blocking worker thread exiting");
            })
            .expect("failed to spawn blocking worker thread");

        self.shared.all_handles.lock().push(handle);
        Worker { sender: tx }
    }

    /// Dispatch `f` onto a blocking worker, or run it synchronously if this is not a
    /// scheduler's task-polling thread (or is itself a blocking worker's thread).
    pub(crate) fn block<F, R>(&self, f: F) -> Awaitable<Result<R, JoinError>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if context::is_blocking_worker() {
            tracing::trace!("block() re-entered on a blocking worker thread, running synchronously");
            return Awaitable::ready(run_catching(f));
        }

        let Some(origin) = context::current_scheduler_index() else {
            return Awaitable::ready(run_catching(f));
        };

        let result = Awaitable::new();
        let result_for_job = result.clone();
        let worker = self.acquire(origin);
        let job = Job::Run(Box::new(move || {
            result_for_job.fulfill(run_catching(f));
        }));

        if let Err(mpsc::SendError(Job::Run(run))) = worker.sender.send(job) {
            tracing::warn!("blocking worker channel closed unexpectedly, running synchronously");
            run();
        }

        result
    }

    /// Shut down every cached worker and join their threads. Workers currently mid-job
    /// are not interrupted; they exit after returning themselves once their cache slot
    /// is gone (see [`Shared::return_worker`]).
    pub(crate) fn shutdown(&self) {
        for cache in &self.shared.per_scheduler_caches {
            for worker in cache.lock().drain(..) {
                let _ = worker.sender.send(Job::Shutdown);
            }
        }
        for worker in self.shared.global_cache.lock().drain(..) {
            let _ = worker.sender.send(Job::Shutdown);
        }
        for handle in self.shared.all_handles.lock().drain(..) {
            if handle.join().is_err() {
                tracing::warn!("blocking worker thread panicked during shutdown");
            }
        }
    }
}

fn run_catching<F, R>(f: F) -> Result<R, JoinError>
where
    F: FnOnce() -> R,
{
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Ok(value),
        Err(payload) => Err(JoinError::from_panic(payload.as_ref())),
    }
}

impl std::fmt::Debug for BlockingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingService").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
    use std::time::Duration;

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
    fn block_off_task_runs_synchronously() {
        let config = BlockingConfig::default();
        let service = BlockingService::new(&config, 1);
        let awaitable = service.block(|| 42);
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        match awaitable.poll(&mut cx) {
            Poll::Ready(Ok(42)) => {}
            other => panic!("expected immediate Ready(Ok(42)), got {other:?}"),
        }
        service.shutdown();
    }

    #[test]
    fn block_propagates_panics() {
        let config = BlockingConfig::default();
        let service = BlockingService::new(&config, 1);
        let awaitable = service.block(|| -> i32 { panic!("boom") });
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        match awaitable.poll(&mut cx) {
            Poll::Ready(Err(err)) => assert_eq!(err.message(), "boom"),
            other => panic!("expected a JoinError, got {other:?}"),
        }
        service.shutdown();
    }

    #[test]
    fn block_from_scheduler_thread_dispatches_and_resumes() {
        let config = BlockingConfig::default();
        let service = Arc::new(BlockingService::new(&config, 2));

        let _entered = context::Entered::scheduler(1);
        let awaitable = service.block(|| {
            std::thread::sleep(Duration::from_millis(10));
            7
        });

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        // Immediately after dispatch the result is not ready yet; the task context
        // would normally suspend here and be woken once the worker fulfils it.
        assert!(matches!(awaitable.poll(&mut cx), Poll::Pending));

        let start = std::time::Instant::now();
        loop {
            if let Poll::Ready(Ok(value)) = awaitable.poll(&mut cx) {
                assert_eq!(value, 7);
                break;
            }
            if start.elapsed() > Duration::from_secs(2) {
                panic!("blocking dispatch never completed");
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        service.shutdown();
    }
}
