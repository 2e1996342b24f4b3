// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::{TaskFailed, TimedOut};
use crate::sync::OneShotCondition;
use core::fmt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

/// An opaque unit of work queued on a stage.
pub(crate) struct Task {
    run: Box<dyn FnOnce() + Send + 'static>,
}

impl Task {
    pub(crate) fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self { run: Box::new(f) }
    }

    pub(crate) fn run(self) {
        (self.run)();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").finish_non_exhaustive()
    }
}

/// Completion slot shared between a spawned task and its [`JoinHandle`].
///
/// The task stores its outcome (value or captured failure) and then latches
/// the condition; the handle latches on the condition before taking the
/// outcome, so the store is always visible by the time `join` returns.
pub(crate) struct Completion<T> {
    done: OneShotCondition,
    slot: Mutex<Option<Result<T, TaskFailed>>>,
}

impl<T> Completion<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            done: OneShotCondition::new(),
            slot: Mutex::new(None),
        })
    }

    pub(crate) fn fulfil(&self, result: Result<T, TaskFailed>) {
        *self.slot.lock() = Some(result);
        self.done.signal_all();
    }
}

/// Handle to the eventual outcome of a task submitted with
/// [`StageExecutor::spawn`](crate::StageExecutor::spawn).
pub struct JoinHandle<T> {
    inner: Arc<Completion<T>>,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(inner: Arc<Completion<T>>) -> Self {
        Self { inner }
    }

    /// `true` once the task has finished (successfully or not).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner.done.is_signalled()
    }

    /// Block until the task finishes and return its outcome.
    ///
    /// # Errors
    ///
    /// Returns [`TaskFailed`] if the task panicked; the worker that ran it
    /// survives either way.
    #[expect(
        clippy::missing_panics_doc,
        reason = "the slot is filled before the condition latches"
    )]
    pub fn join(self) -> Result<T, TaskFailed> {
        self.inner.done.wait();
        self.inner
            .slot
            .lock()
            .take()
            .expect("completion latched without an outcome")
    }

    /// Block until the task finishes or `deadline` passes.
    ///
    /// # Errors
    ///
    /// Returns `Err(self)` on deadline so the caller can keep waiting.
    #[expect(
        clippy::missing_panics_doc,
        reason = "the slot is filled before the condition latches"
    )]
    pub fn join_until(self, deadline: Instant) -> Result<Result<T, TaskFailed>, (Self, TimedOut)> {
        if !self.inner.done.wait_until(deadline) {
            return Err((self, TimedOut(())));
        }
        Ok(self
            .inner
            .slot
            .lock()
            .take()
            .expect("completion latched without an outcome"))
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn join_after_fulfil_returns_the_value() {
        let completion = Completion::new();
        completion.fulfil(Ok(7));

        let handle = JoinHandle::new(completion);
        assert!(handle.is_finished());
        assert_eq!(handle.join().unwrap(), 7);
    }

    #[test]
    fn join_until_times_out_on_an_unfinished_task() {
        let completion: Arc<Completion<()>> = Completion::new();
        let handle = JoinHandle::new(completion);

        let Err((handle, _)) = handle.join_until(Instant::now() + Duration::from_millis(20)) else {
            panic!("join must time out");
        };
        assert!(!handle.is_finished());
    }
}
