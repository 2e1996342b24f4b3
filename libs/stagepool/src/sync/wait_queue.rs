// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::park;
use crate::sync::Registered;
use crate::sync::signal::SignalEntry;
use crate::loom::sync::Arc;
use arrayvec::ArrayVec;
use core::fmt;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// How many delivered wakes are buffered before the queue lock is released
/// to unpark them.
const WAKE_BATCH: usize = 32;

/// A queue of waiting threads which can be woken in first-in, first-out
/// order ([`signal`]) or all at once ([`signal_all`]).
///
/// Threads join the queue by [`register`]ing a [`Signal`](crate::Signal) and
/// then waiting on it; registration order is wake order. A waiter that gives
/// up retires its entry through cancellation, and a waiter that cancels
/// *after* its wake was delivered forwards that wake to the next waiter, so
/// a wake handed to the queue is never silently dropped.
///
/// # Implementation Notes
///
/// Entries keep their whole state in one atomic word, so delivering a wake is
/// a single CAS; the queue itself is a [`Mutex`] around a [`VecDeque`] of
/// entries. Pops, sweeps, and walks hold the lock only long enough to move
/// entries out; actual unparking always happens with the lock released.
/// Practical lock-free doubly-linked designs need deferred reclamation
/// (hazard pointers or similar) to support mid-queue removal, and the
/// critical sections here are short enough that the lock costs less.
///
/// Broadcast walks ([`signal_all`]) have to terminate even though woken
/// threads are free to immediately re-register: the walk samples the woken
/// threads at geometrically growing intervals and stops as soon as it wakes
/// a thread it has already sampled.
///
/// [`register`]: WaitQueue::register
/// [`signal`]: WaitQueue::signal
/// [`signal_all`]: WaitQueue::signal_all
pub struct WaitQueue {
    waiters: Mutex<VecDeque<Arc<SignalEntry>>>,
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Append a fresh signal bound to the calling thread.
    ///
    /// Must be called by the thread that will wait on the returned signal;
    /// the handle is `!Send` for that reason.
    pub fn register(&self) -> Registered<'_> {
        let entry = Arc::new(SignalEntry::new(park::current()));
        self.waiters.lock().push_back(entry.clone());
        tracing::trace!(queue = ?self, "registered waiter");
        Registered::new(entry, self)
    }

    /// Wake the first waiter still waiting.
    ///
    /// Entries that already reached a terminal state are discarded along the
    /// way. Returns `true` if a waiter was woken and `false` only if the
    /// queue drained without finding one.
    pub fn signal(&self) -> bool {
        loop {
            let entry = self.waiters.lock().pop_front();
            let Some(entry) = entry else {
                return false;
            };

            if entry.try_signal() {
                entry.owner().unpark();
                return true;
            }
            // cancelled or already signalled: discard and keep looking
        }
    }

    /// Wake every waiter registered at the time of the call.
    ///
    /// Waiters are woken in registration order, in batches, with the queue
    /// lock released while unparking. Because woken threads may re-register
    /// during the walk, the walk terminates once it encounters a thread it
    /// has woken before (sampled at geometrically increasing intervals)
    /// rather than trying to snapshot the queue.
    pub fn signal_all(&self) {
        let mut batch: ArrayVec<Arc<SignalEntry>, WAKE_BATCH> = ArrayVec::new();
        let mut sampled: Vec<u64> = Vec::new();
        let mut woken: u64 = 0;
        let mut next_sample: u64 = 1;

        loop {
            let drained = {
                let mut waiters = self.waiters.lock();
                loop {
                    if batch.is_full() {
                        break false;
                    }
                    let Some(entry) = waiters.pop_front() else {
                        break true;
                    };
                    if entry.try_signal() {
                        batch.push(entry);
                    }
                }
            };

            let mut repeat = false;
            for entry in batch.drain(..) {
                entry.owner().unpark();
                woken += 1;

                let token = entry.owner().token();
                if sampled.contains(&token) {
                    // saw this thread before: it must have re-registered
                    // during the walk, stop after this batch
                    repeat = true;
                } else if woken == next_sample {
                    sampled.push(token);
                    next_sample = next_sample.saturating_mul(2);
                }
            }

            if drained || repeat {
                return;
            }
        }
    }

    /// `true` if any non-cancelled waiter is registered.
    #[must_use]
    pub fn has_waiters(&self) -> bool {
        self.waiter_count() > 0
    }

    /// The number of registered, non-cancelled waiters.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.waiters
            .lock()
            .iter()
            .filter(|entry| !entry.is_cancelled())
            .count()
    }

    /// Drop cancelled entries.
    ///
    /// Invoked whenever a waiter cancels, so a quiescent queue is eventually
    /// garbage-free.
    pub(crate) fn sweep_cancelled(&self) {
        self.waiters.lock().retain(|entry| !entry.is_cancelled());
    }
}

impl fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("WaitQueue");
        match self.waiters.try_lock() {
            Some(waiters) => s.field("len", &waiters.len()),
            None => s.field("len", &"<locked>"),
        };
        s.finish_non_exhaustive()
    }
}

static_assertions::assert_impl_all!(WaitQueue: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::sync::atomic::{AtomicUsize, Ordering};
    use crate::loom::thread;
    use crate::sync::Signal;
    use std::time::{Duration, Instant};

    #[cfg(not(loom))]
    #[test]
    fn signal_on_an_empty_queue_is_false() {
        let queue = WaitQueue::new();
        assert!(!queue.signal());
    }

    #[cfg(not(loom))]
    #[test]
    fn signal_wakes_in_registration_order() {
        let queue = WaitQueue::new();
        let first = queue.register();
        let second = queue.register();

        assert!(queue.signal());
        assert!(first.is_signalled());
        assert!(!second.is_signalled());

        assert!(queue.signal());
        assert!(second.is_signalled());
        assert!(!queue.signal());
    }

    #[cfg(not(loom))]
    #[test]
    fn cancel_after_wake_forwards_to_the_next_waiter() {
        let queue = WaitQueue::new();
        let w1 = queue.register();
        let w2 = queue.register();

        // w1 receives the wake but gives up before consuming it
        assert!(queue.signal());
        assert!(w1.is_signalled());
        w1.cancel();

        // the wake moved on instead of disappearing
        assert!(w2.is_signalled());
        assert!(w2.check_and_clear());
    }

    #[cfg(not(loom))]
    #[test]
    fn terminal_heads_are_discarded() {
        let queue = WaitQueue::new();
        let head = queue.register();
        let tail = queue.register();

        head.cancel();
        assert_eq!(queue.waiter_count(), 1);

        assert!(queue.signal());
        assert!(tail.is_signalled());
    }

    #[cfg(not(loom))]
    #[test]
    fn broadcast_wakes_every_parked_waiter() {
        const WAITERS: usize = 100;

        let queue = std::sync::Arc::new(WaitQueue::new());
        let started = std::sync::Arc::new(AtomicUsize::new(0));
        let woken = std::sync::Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..WAITERS)
            .map(|_| {
                let queue = queue.clone();
                let started = started.clone();
                let woken = woken.clone();
                thread::spawn(move || {
                    let signal = queue.register();
                    started.fetch_add(1, Ordering::SeqCst);
                    signal.wait();
                    assert!(signal.is_signalled());
                    woken.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        // wait for everyone to be registered before broadcasting
        let deadline = Instant::now() + Duration::from_secs(10);
        while started.load(Ordering::SeqCst) < WAITERS {
            assert!(Instant::now() < deadline, "waiters failed to register");
            std::thread::yield_now();
        }

        queue.signal_all();

        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(woken.load(Ordering::SeqCst), WAITERS);
        assert_eq!(queue.waiter_count(), 0);
    }

    #[cfg(not(loom))]
    #[test]
    fn waiter_count_ignores_cancelled_entries() {
        let queue = WaitQueue::new();
        let a = queue.register();
        let _b = queue.register();

        assert_eq!(queue.waiter_count(), 2);
        a.cancel();
        assert_eq!(queue.waiter_count(), 1);
        assert!(queue.has_waiters());
    }

    #[test]
    fn concurrent_signal_wakes_exactly_one_registered_waiter() {
        crate::loom::model(|| {
            let queue = Arc::new(WaitQueue::new());
            let waker = {
                let queue = queue.clone();
                thread::spawn(move || queue.signal())
            };

            // registration on this thread races the signal on the other; if
            // the signal lost the race it found nobody, and our entry must
            // still be pending
            let signal = queue.register();
            let woke = waker.join().unwrap();
            assert_eq!(woke, signal.is_signalled());
            signal.cancel();
        });
    }
}
