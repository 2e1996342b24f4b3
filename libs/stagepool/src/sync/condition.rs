// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use crate::sync::{Signal, WaitQueue};
use core::fmt;
use core::ptr;
use std::time::Instant;

/// A latching, broadcast-only condition.
///
/// Once [`signal_all`] has been called, every present and future waiter
/// returns immediately; the latch never resets. There is deliberately no
/// single-wake operation on this type.
///
/// The waiter queue is only allocated once somebody actually waits, so a
/// condition that is signalled before anyone waits on it costs a single
/// atomic store.
///
/// Waiting re-checks the latch *after* registering on the queue. That
/// re-check is what closes the race against a concurrent [`signal_all`]: a
/// broadcast that ran between the first latch check and the registration has
/// already missed our entry, but it cannot have missed the latch store, so
/// the re-check observes it and the waiter never parks.
///
/// [`signal_all`]: OneShotCondition::signal_all
pub struct OneShotCondition {
    signalled: AtomicBool,
    waiters: AtomicPtr<WaitQueue>,
}

impl Default for OneShotCondition {
    fn default() -> Self {
        Self::new()
    }
}

impl OneShotCondition {
    #[must_use]
    pub fn new() -> Self {
        Self {
            signalled: AtomicBool::new(false),
            waiters: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// `true` once [`signal_all`](OneShotCondition::signal_all) has run.
    #[must_use]
    pub fn is_signalled(&self) -> bool {
        self.signalled.load(Ordering::SeqCst)
    }

    /// Latch the condition and wake every current waiter.
    ///
    /// Idempotent: repeated calls are indistinguishable from a single one.
    pub fn signal_all(&self) {
        self.signalled.store(true, Ordering::SeqCst);
        if let Some(waiters) = self.waiters_ref() {
            waiters.signal_all();
        }
    }

    /// Block the calling thread until the condition is signalled.
    ///
    /// Returns immediately if it already is.
    pub fn wait(&self) {
        if self.is_signalled() {
            return;
        }

        let waiters = self.ensure_waiters();
        let signal = waiters.register();

        // a broadcast may have run between the check above and our
        // registration; it set the latch first, so this observes it
        if self.is_signalled() {
            signal.cancel();
            return;
        }

        signal.wait();
    }

    /// Block until the condition is signalled or `deadline` passes.
    ///
    /// Returns `true` if the condition was signalled, `false` on deadline.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        if self.is_signalled() {
            return true;
        }
        if Instant::now() >= deadline {
            return self.is_signalled();
        }

        let waiters = self.ensure_waiters();
        let signal = waiters.register();

        if self.is_signalled() {
            signal.cancel();
            return true;
        }

        if signal.wait_until(deadline) {
            return true;
        }

        // retire the entry; a wake that lands in this window still counts
        signal.check_and_clear() || self.is_signalled()
    }

    fn waiters_ref(&self) -> Option<&WaitQueue> {
        let ptr = self.waiters.load(Ordering::SeqCst);
        if ptr.is_null() {
            None
        } else {
            // Safety: a non-null pointer was installed exactly once by
            // `ensure_waiters` via `Box::into_raw` and is only freed in
            // `drop`, which has exclusive access.
            Some(unsafe { &*ptr })
        }
    }

    fn ensure_waiters(&self) -> &WaitQueue {
        if let Some(waiters) = self.waiters_ref() {
            return waiters;
        }

        let fresh = Box::into_raw(Box::new(WaitQueue::new()));
        match self.waiters.compare_exchange(
            ptr::null_mut(),
            fresh,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            // Safety: we just installed `fresh`, see `waiters_ref`
            Ok(_) => unsafe { &*fresh },
            Err(existing) => {
                // lost the installation race; the duplicate is discarded
                // Safety: `fresh` never left this function
                drop(unsafe { Box::from_raw(fresh) });
                // Safety: `existing` is the installed pointer, see `waiters_ref`
                unsafe { &*existing }
            }
        }
    }
}

impl Drop for OneShotCondition {
    fn drop(&mut self) {
        let ptr = self.waiters.load(Ordering::SeqCst);
        if !ptr.is_null() {
            // Safety: `drop` has exclusive access and the pointer came from
            // `Box::into_raw` in `ensure_waiters`
            drop(unsafe { Box::from_raw(ptr) });
        }
    }
}

impl fmt::Debug for OneShotCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OneShotCondition")
            .field("signalled", &self.is_signalled())
            .finish_non_exhaustive()
    }
}

static_assertions::assert_impl_all!(OneShotCondition: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::sync::Arc;
    use crate::loom::thread;
    use std::time::Duration;

    #[cfg(not(loom))]
    #[test]
    fn signal_before_wait_returns_immediately() {
        let condition = OneShotCondition::new();
        condition.signal_all();
        // must not park: the latch is already set
        condition.wait();
        assert!(condition.is_signalled());
    }

    #[cfg(not(loom))]
    #[test]
    fn signal_all_is_idempotent() {
        let condition = OneShotCondition::new();
        condition.signal_all();
        condition.signal_all();
        assert!(condition.is_signalled());
        assert!(condition.wait_until(Instant::now()));
    }

    #[cfg(not(loom))]
    #[test]
    fn wait_until_past_deadline_does_not_park() {
        let condition = OneShotCondition::new();
        assert!(!condition.wait_until(Instant::now() - Duration::from_millis(1)));
    }

    #[cfg(not(loom))]
    #[test]
    fn wait_until_times_out_unsignalled() {
        let condition = OneShotCondition::new();
        let start = Instant::now();
        assert!(!condition.wait_until(start + Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn wait_racing_signal_all_never_parks_forever() {
        crate::loom::model(|| {
            let condition = Arc::new(OneShotCondition::new());

            let waiter = {
                let condition = condition.clone();
                thread::spawn(move || {
                    condition.wait();
                    assert!(condition.is_signalled());
                })
            };

            condition.signal_all();
            waiter.join().unwrap();
        });
    }

    #[cfg(not(loom))]
    #[test]
    fn broadcast_releases_many_waiters() {
        let condition = std::sync::Arc::new(OneShotCondition::new());

        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let condition = condition.clone();
                thread::spawn(move || {
                    condition.wait();
                    assert!(condition.is_signalled());
                })
            })
            .collect();

        // give waiters a moment to actually park
        std::thread::sleep(Duration::from_millis(20));
        condition.signal_all();

        for waiter in waiters {
            waiter.join().unwrap();
        }
    }
}
