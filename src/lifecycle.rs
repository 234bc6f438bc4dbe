// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Owns construction and teardown order for every core service, and the single
//! process-wide registry the top-level `cothread::*` functions dispatch through.

use crate::blocking::BlockingService;
use crate::config::Config;
use crate::pool::ThreadPool;
use crate::timer::TimerService;
use parking_lot::Mutex;
use std::sync::Arc;

static ACTIVE: Mutex<Option<Arc<Registry>>> = Mutex::new(None);

/// The set of live services, shared by `Arc` with anything that needs to reach them --
/// including a dynamically loaded [`crate::module`], which reconstructs its own `Arc`
/// from a raw pointer handed across the `extern "C"` boundary rather than reaching into
/// process-global symbols shared with the host.
pub(crate) struct Registry {
    pub(crate) thread_pool: Arc<ThreadPool>,
    pub(crate) blocking: Arc<BlockingService>,
    pub(crate) timer: Arc<TimerService>,
}

/// An RAII scope for the entire runtime. Dropping it tears down every service in the
/// reverse of their construction order.
///
/// Exactly one `Lifecycle` may exist in the process at a time; constructing a second
/// one while the first is still alive is a fatal invariant violation.
pub struct Lifecycle {
    registry: Arc<Registry>,
}

impl Lifecycle {
    pub(crate) fn new(config: Config) -> Self {
        let mut guard = ACTIVE.lock();
        if guard.is_some() {
            crate::error::fatal("a Lifecycle is already active in this process");
        }

        crate::memory::configure(config.memory.cache_byte_limit);

        let thread_pool = Arc::new(ThreadPool::launch(config.threadpool.resolved_worker_count()));
        let blocking = Arc::new(BlockingService::new(&config.blocking, thread_pool.worker_count()));
        let timer = TimerService::launch(config.timer.clone());

        let registry = Arc::new(Registry {
            thread_pool,
            blocking,
            timer,
        });
        *guard = Some(registry.clone());
        drop(guard);

        tracing::info!(
            workers = registry.thread_pool.worker_count(),
            "runtime initialized"
        );

        Self { registry }
    }

    pub(crate) fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        tracing::info!("runtime shutting down");
        // Reverse of construction order: timer service, then blocking service, then
        // thread pool. Cancelling pending timers first (and draining blocking workers
        // before halting schedulers) gives any task suspended on one of them a chance
        // to resume and finish draining before its scheduler stops.
        self.registry.timer.shutdown();
        self.registry.blocking.shutdown();
        self.registry.thread_pool.shutdown();
        *ACTIVE.lock() = None;
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("workers", &self.registry.thread_pool.worker_count())
            .finish_non_exhaustive()
    }
}

/// The currently active registry, or a fatal invariant violation if no [`Lifecycle`]
/// has been constructed yet.
pub(crate) fn active() -> Arc<Registry> {
    ACTIVE.lock().clone().unwrap_or_else(|| {
        crate::error::fatal("no active Lifecycle: call cothread::initialize() first")
    })
}

/// Serializes every test across the crate that constructs a [`Lifecycle`] (there can
/// only be one live at a time, process-wide, and `cargo test` runs `#[test]`s
/// concurrently by default).
#[cfg(test)]
pub(crate) static TEST_LOCK: Mutex<()> = Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_can_be_recreated_after_drop() {
        let _guard = TEST_LOCK.lock();
        let mut config = Config::default();
        config.threadpool.worker_count = 2;

        let first = Lifecycle::new(config.clone());
        assert_eq!(first.registry().thread_pool.worker_count(), 2);
        drop(first);

        // A second lifecycle is fine once the first has been dropped.
        let second = Lifecycle::new(config);
        assert_eq!(second.registry().thread_pool.worker_count(), 2);
        drop(second);
    }
}
