// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::Arc;
use crate::loom::sync::atomic::{AtomicU8, Ordering};
use crate::park::{self, Unpark};
use crate::sync::WaitQueue;
use core::marker::PhantomData;
use std::time::Instant;

const NOT_SET: u8 = 0;
const SIGNALLED: u8 = 1;
const CANCELLED: u8 = 2;

/// A one-shot wakeup latch owned by the thread that registered it.
///
/// A signal is in exactly one of three states: not set, signalled, or
/// cancelled. There is at most one successful transition out of the initial
/// state; once terminal, the state is terminal for every outside observer.
/// (The owner may downgrade a signalled entry to cancelled when it chooses to
/// pass its wake on, see [`cancel`].)
///
/// All methods other than the state probes must only be called by the owning
/// thread; [`Registered`] is `!Send` to enforce this.
///
/// [`cancel`]: Signal::cancel
pub trait Signal {
    /// `true` once a wake was delivered to this signal.
    fn is_signalled(&self) -> bool;

    /// `true` once the owner retired this signal without consuming a wake.
    fn is_cancelled(&self) -> bool;

    /// `true` once the signal has reached either terminal state.
    fn is_set(&self) -> bool {
        self.is_signalled() || self.is_cancelled()
    }

    /// Consume the wake if one was delivered, else retire the signal.
    ///
    /// Returns `true` if the signal was signalled. When this races with a
    /// wake, the loser of the race still returns `true`: the wake was
    /// delivered and is considered consumed.
    fn check_and_clear(&self) -> bool;

    /// Retire this signal.
    ///
    /// If a wake was already delivered but not consumed, the wake is
    /// forwarded to another waiter on the same queue rather than dropped.
    /// Cancelling an already-cancelled signal is a no-op.
    fn cancel(&self);

    /// Park the calling thread until this signal is signalled.
    ///
    /// Tolerates spurious unparks. The signal is terminal when this returns.
    fn wait(&self) {
        while !self.is_signalled() {
            park::park();
        }
        self.check_and_clear();
    }

    /// Park the calling thread until this signal is signalled or the
    /// monotonic `deadline` passes.
    ///
    /// Returns `true` if the signal fired, `false` on deadline. A deadline
    /// that has already passed returns the current state without parking.
    /// On `false` the signal is still registered; the owner retires it via
    /// [`check_and_clear`](Signal::check_and_clear) or
    /// [`cancel`](Signal::cancel).
    fn wait_until(&self, deadline: Instant) -> bool {
        loop {
            if self.is_signalled() {
                self.check_and_clear();
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return self.is_signalled();
            }

            park::park_timeout(deadline - now);
        }
    }
}

/// Shared state of a queue-registered signal.
///
/// The queue holds one strong reference per registration; the owner holds the
/// other through [`Registered`].
pub(crate) struct SignalEntry {
    state: AtomicU8,
    owner: Unpark,
}

impl SignalEntry {
    pub(crate) fn new(owner: Unpark) -> Self {
        Self {
            state: AtomicU8::new(NOT_SET),
            owner,
        }
    }

    /// Deliver a wake: transition `NotSet -> Signalled`.
    ///
    /// Returns `false` if the entry is already terminal. The caller unparks
    /// the owner after a successful transition (outside any queue lock).
    pub(crate) fn try_signal(&self) -> bool {
        self.state
            .compare_exchange(NOT_SET, SIGNALLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn is_signalled(&self) -> bool {
        self.state.load(Ordering::SeqCst) == SIGNALLED
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::SeqCst) == CANCELLED
    }

    pub(crate) fn owner(&self) -> &Unpark {
        &self.owner
    }
}

impl core::fmt::Debug for SignalEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = match self.state.load(Ordering::SeqCst) {
            NOT_SET => "NotSet",
            SIGNALLED => "Signalled",
            _ => "Cancelled",
        };
        f.debug_struct("SignalEntry")
            .field("state", &state)
            .finish_non_exhaustive()
    }
}

/// A [`Signal`] registered on a [`WaitQueue`], bound to the thread that
/// called [`WaitQueue::register`].
///
/// Dropping a `Registered` whose wake was neither consumed nor delivered
/// retires the queue entry.
#[derive(Debug)]
pub struct Registered<'q> {
    entry: Arc<SignalEntry>,
    queue: &'q WaitQueue,
    // owner-thread discipline: the handle must stay on the registering thread
    _not_send: PhantomData<*mut ()>,
}

impl<'q> Registered<'q> {
    pub(crate) fn new(entry: Arc<SignalEntry>, queue: &'q WaitQueue) -> Self {
        Self {
            entry,
            queue,
            _not_send: PhantomData,
        }
    }
}

impl Signal for Registered<'_> {
    fn is_signalled(&self) -> bool {
        self.entry.is_signalled()
    }

    fn is_cancelled(&self) -> bool {
        self.entry.is_cancelled()
    }

    fn check_and_clear(&self) -> bool {
        match self.entry.state.compare_exchange(
            NOT_SET,
            CANCELLED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                self.queue.sweep_cancelled();
                false
            }
            // lost the race against a wake: the wake counts as consumed
            Err(SIGNALLED) => true,
            Err(_) => false,
        }
    }

    fn cancel(&self) {
        match self.entry.state.compare_exchange(
            NOT_SET,
            CANCELLED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => self.queue.sweep_cancelled(),
            Err(CANCELLED) => {}
            Err(_) => {
                // a wake was already delivered; pass it on instead of
                // swallowing it
                self.entry.state.store(CANCELLED, Ordering::SeqCst);
                self.queue.signal();
            }
        }
    }
}

impl Drop for Registered<'_> {
    fn drop(&mut self) {
        // only retire a still-pending entry here: a delivered wake may have
        // been consumed already, and a consumed wake must not be forwarded
        if self
            .entry
            .state
            .compare_exchange(NOT_SET, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.queue.sweep_cancelled();
        }
    }
}

static_assertions::assert_not_impl_any!(Registered<'static>: Send, Sync);

/// A composite signal that fires when *any* child has fired.
///
/// Composites own no queue entry themselves; the composing thread registers
/// the children (on one or several queues) and then waits on the composite,
/// which delegates parking to the shared owner thread.
#[derive(Debug)]
pub struct AnySignal<S> {
    children: Vec<S>,
}

/// A composite signal over `children`; signalled when any child is signalled
/// and cancelled only once every child is cancelled.
pub fn any<S: Signal>(children: Vec<S>) -> AnySignal<S> {
    AnySignal { children }
}

impl<S: Signal> Signal for AnySignal<S> {
    fn is_signalled(&self) -> bool {
        self.children.iter().any(Signal::is_signalled)
    }

    fn is_cancelled(&self) -> bool {
        !self.children.is_empty() && self.children.iter().all(Signal::is_cancelled)
    }

    fn check_and_clear(&self) -> bool {
        // clear every child; no short-circuiting
        let mut signalled = false;
        for child in &self.children {
            if child.check_and_clear() {
                signalled = true;
            }
        }
        signalled
    }

    fn cancel(&self) {
        for child in &self.children {
            child.cancel();
        }
    }
}

/// A composite signal that fires only once *every* child has fired.
#[derive(Debug)]
pub struct AllSignal<S> {
    children: Vec<S>,
}

/// A composite signal over `children`; signalled only when every child is
/// signalled, cancelled as soon as any child is cancelled (it can no longer
/// complete).
pub fn all<S: Signal>(children: Vec<S>) -> AllSignal<S> {
    AllSignal { children }
}

impl<S: Signal> Signal for AllSignal<S> {
    fn is_signalled(&self) -> bool {
        !self.children.is_empty() && self.children.iter().all(Signal::is_signalled)
    }

    fn is_cancelled(&self) -> bool {
        self.children.iter().any(Signal::is_cancelled)
    }

    fn check_and_clear(&self) -> bool {
        let mut signalled = !self.children.is_empty();
        for child in &self.children {
            if !child.check_and_clear() {
                signalled = false;
            }
        }
        signalled
    }

    fn cancel(&self) {
        for child in &self.children {
            child.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::thread;

    #[test]
    fn wake_delivery_races_are_single_winner() {
        crate::loom::model(|| {
            let entry = Arc::new(SignalEntry::new(park::current()));
            let other = entry.clone();

            let signaller = thread::spawn(move || other.try_signal());
            let won = entry.try_signal();
            let they_won = signaller.join().unwrap();

            // exactly one successful transition out of NotSet
            assert_ne!(won, they_won);
            assert!(entry.is_signalled());
        });
    }

    #[cfg(not(loom))]
    #[test]
    fn check_and_clear_loser_still_sees_the_wake() {
        let queue = WaitQueue::new();
        let signal = queue.register();

        assert!(queue.signal());
        // the wake was delivered first, so the "clear" loses and reports it
        assert!(signal.check_and_clear());
        assert!(signal.is_signalled());
    }

    #[cfg(not(loom))]
    #[test]
    fn cancel_twice_is_a_no_op() {
        let queue = WaitQueue::new();
        let signal = queue.register();

        signal.cancel();
        assert!(signal.is_cancelled());
        signal.cancel();
        assert!(signal.is_cancelled());
        assert!(!signal.is_signalled());
        assert_eq!(queue.waiter_count(), 0);
    }

    #[cfg(not(loom))]
    #[test]
    fn any_fires_on_a_single_child() {
        let queue_a = WaitQueue::new();
        let queue_b = WaitQueue::new();
        let composite = any(vec![queue_a.register(), queue_b.register()]);

        assert!(!composite.is_signalled());
        assert!(queue_b.signal());
        assert!(composite.is_signalled());
        assert!(!composite.is_cancelled());

        // clearing retires the un-fired child as well
        assert!(composite.check_and_clear());
        assert_eq!(queue_a.waiter_count(), 0);
    }

    #[cfg(not(loom))]
    #[test]
    fn all_requires_every_child() {
        let queue_a = WaitQueue::new();
        let queue_b = WaitQueue::new();
        let composite = all(vec![queue_a.register(), queue_b.register()]);

        assert!(queue_a.signal());
        assert!(!composite.is_signalled());
        assert!(queue_b.signal());
        assert!(composite.is_signalled());
        assert!(composite.check_and_clear());
    }

    #[cfg(not(loom))]
    #[test]
    fn wait_until_past_deadline_reports_current_state() {
        let queue = WaitQueue::new();
        let signal = queue.register();

        // no park: the deadline is already behind us
        assert!(!signal.wait_until(Instant::now() - std::time::Duration::from_millis(1)));
        signal.cancel();
    }
}
