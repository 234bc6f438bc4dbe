// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A process-unique numeric identifier handed out to tasks.
///
/// Unique among all *currently live* tasks, not unique across the lifetime of the
/// process (the counter wraps, though not in any process that runs long enough to
/// matter in practice).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct Id(u64);

impl Id {
    pub(crate) fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A shareable identity handle used for timer cancellation.
///
/// Two `Sid`s compare equal iff they refer to the same underlying allocation, not by
/// value -- this matches the timer service's contract of identifying *this particular*
/// `timer_start` call, even if two timers happen to share a deadline.
#[derive(Clone)]
pub struct Sid(Arc<()>);

impl Sid {
    pub(crate) fn new() -> Self {
        Self(Arc::new(()))
    }
}

impl PartialEq for Sid {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Sid {}

impl fmt::Debug for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sid({:p})", Arc::as_ptr(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct() {
        let a = Id::next();
        let b = Id::next();
        assert_ne!(a, b);
    }

    #[test]
    fn sids_compare_by_identity() {
        let a = Sid::new();
        let b = a.clone();
        let c = Sid::new();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
