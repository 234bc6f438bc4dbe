// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Loads a dynamically linked module and runs its `start` entry point to completion.
//!
//! A `dlopen`-style loader that copies a raw service-pointer table across the module
//! boundary relies on process-global symbols a separately linked module shares with the
//! host under a C++ toolchain. Rust has no such stable ABI to copy safely across
//! independently compiled `cdylib`s, so instead the host hands the module a raw
//! `Arc<Registry>` pointer; the module is expected to reconstruct its own `Arc` from it
//! inside `hce_module_create` (via [`std::sync::Arc::increment_strong_count`] and
//! [`std::sync::Arc::from_raw`]) and use that for every subsequent service access,
//! including from the future `start` returns.

use crate::lifecycle::{Lifecycle, Registry};
use libloading::{Library, Symbol};
use std::ffi::c_void;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake};

type CreateFn = unsafe extern "C" fn(*const Registry) -> *mut c_void;
type DestroyFn = unsafe extern "C" fn(*mut c_void);
type StartFn = unsafe extern "C" fn(*mut c_void) -> Pin<Box<dyn Future<Output = i32> + Send>>;

/// Errors loading or running a module.
#[derive(Debug)]
#[non_exhaustive]
pub enum ModuleError {
    Load(libloading::Error),
    MissingSymbol(libloading::Error),
    Panicked(crate::error::JoinError),
}

impl std::fmt::Display for ModuleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModuleError::Load(e) => write!(f, "failed to load module: {e}"),
            ModuleError::MissingSymbol(e) => write!(f, "module is missing a required symbol: {e}"),
            ModuleError::Panicked(e) => write!(f, "module's start entry point panicked: {e}"),
        }
    }
}

impl std::error::Error for ModuleError {}

/// Load the `cdylib` at `path`, run its `start` entry point to completion on the
/// thread pool, and return its exit code.
pub fn import(path: impl AsRef<Path>, lifecycle: &Lifecycle) -> Result<i32, ModuleError> {
    let registry = lifecycle.registry();

    // Safety: loading an arbitrary shared object is inherently unsafe; the caller is
    // trusted to supply a module built against this crate's ABI (see module docs).
    let library = unsafe { Library::new(path.as_ref()) }.map_err(ModuleError::Load)?;

    // Safety: `hce_module_create`/`hce_module_destroy`/`start` are resolved by name and
    // invoked per the documented signatures; a mismatched module violates this
    // function's safety contract, not this call site's.
    let (module_ptr, exit_code_result) = unsafe {
        let create: Symbol<CreateFn> = library
            .get(b"hce_module_create\0")
            .map_err(ModuleError::MissingSymbol)?;
        let destroy: Symbol<DestroyFn> = library
            .get(b"hce_module_destroy\0")
            .map_err(ModuleError::MissingSymbol)?;
        let start: Symbol<StartFn> = library.get(b"start\0").map_err(ModuleError::MissingSymbol)?;

        let module_ptr = create(Arc::as_ptr(registry));
        let future = start(module_ptr);
        let join = registry.thread_pool.schedule(future);
        let result = block_on(join);
        destroy(module_ptr);
        (module_ptr, result)
    };
    let _ = module_ptr;

    exit_code_result.map_err(ModuleError::Panicked)
}

struct ThreadWaker(std::thread::Thread);

impl Wake for ThreadWaker {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.unpark();
    }
}

/// A minimal single-future executor: parks the calling thread between polls, woken by
/// the thread's own unpark. Used only here, to drive a module's `start` future to
/// completion from a synchronous call site.
fn block_on<F: Future>(future: F) -> F::Output {
    let mut future = future;
    // Safety: `future` is not moved again after this; it is shadowed, and every access
    // below goes through the pinned reference.
    let mut future = unsafe { Pin::new_unchecked(&mut future) };

    let waker = std::task::Waker::from(Arc::new(ThreadWaker(std::thread::current())));
    let mut cx = Context::from_waker(&waker);

    loop {
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(value) => return value,
            Poll::Pending => std::thread::park(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_on_resolves_ready_future() {
        let value = block_on(async { 1 + 1 });
        assert_eq!(value, 2);
    }

    #[test]
    fn import_reports_missing_library() {
        let _guard = crate::lifecycle::TEST_LOCK.lock();
        let mut config = crate::config::Config::default();
        config.threadpool.worker_count = 1;
        let lifecycle = Lifecycle::new(config);

        let err = import("/nonexistent/path/does-not-exist.so", &lifecycle).unwrap_err();
        assert!(matches!(err, ModuleError::Load(_)));
    }
}
