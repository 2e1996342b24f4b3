// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::{Rejected, TimedOut};
use crate::executor::pool::PoolCore;
use crate::executor::task::{Completion, JoinHandle, Task};
use crate::fatal;
use crate::loom::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use crate::metrics::{self, MetricId, MetricKind};
use crate::sync::{OneShotCondition, Signal, WaitQueue};
use core::fmt;
use crossbeam_queue::SegQueue;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// How long a blocked submitter waits per bounded offer before re-checking
/// for space (or shutdown).
const OFFER_INTERVAL: Duration = Duration::from_secs(1);

/// Per-stage state shared between the public handle, the pool's workers, and
/// the metric readers.
pub(crate) struct StageCore {
    name: String,
    pool_name: String,
    pool: Weak<PoolCore>,
    max_workers: usize,
    max_queued: usize,
    queue: SegQueue<Task>,
    /// Tasks currently executing; never exceeds `max_workers`.
    active: AtomicUsize,
    completed: AtomicU64,
    /// Cumulative count of submissions that had to block.
    blocked_total: AtomicU64,
    /// Submissions blocked right now.
    blocked_now: AtomicU64,
    shut_down: AtomicBool,
    /// Submitters blocked on a full queue.
    permit_waiters: WaitQueue,
    /// Latched once shut down, drained, and idle.
    terminated: OneShotCondition,
}

impl StageCore {
    pub(crate) fn new(
        pool: &Arc<PoolCore>,
        max_workers: usize,
        max_queued: usize,
        name: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            pool_name: pool.name().to_string(),
            pool: Arc::downgrade(pool),
            max_workers,
            max_queued,
            queue: SegQueue::new(),
            active: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            blocked_total: AtomicU64::new(0),
            blocked_now: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
            permit_waiters: WaitQueue::new(),
            terminated: OneShotCondition::new(),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub(crate) fn pending_tasks(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn completed_count(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    pub(crate) fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Reserve one execution slot, keeping `active <= max_workers`.
    pub(crate) fn try_acquire_permit(&self) -> bool {
        loop {
            let active = self.active.load(Ordering::SeqCst);
            if active >= self.max_workers {
                return false;
            }
            if self
                .active
                .compare_exchange(active, active + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub(crate) fn release_permit(&self) {
        let prev = self.active.fetch_sub(1, Ordering::SeqCst);
        debug_assert_ne!(prev, 0);
    }

    /// Dequeue the next task; a successful dequeue frees queue space, so a
    /// blocked submitter (if any) is woken.
    ///
    /// The caller must hold a permit. Returns `None` if the queue raced
    /// empty, in which case the caller releases the permit again.
    pub(crate) fn take_task(&self) -> Option<Task> {
        let task = self.queue.pop()?;
        self.permit_waiters.signal();
        Some(task)
    }

    /// Whether a submission may enqueue right now.
    ///
    /// Below the soft cap there is always room. At `max_queued = 0` the
    /// stage degrades to a rendezvous: a submission is only accepted while
    /// the queue is empty and an execution slot is free, so every submit
    /// waits for a worker to be able to pick the task up.
    fn has_room(&self) -> bool {
        self.queue.len() < self.max_queued
            || (self.queue.is_empty() && self.active.load(Ordering::SeqCst) < self.max_workers)
    }

    pub(crate) fn nudge(&self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.maybe_schedule();
        }
    }

    /// Enqueue `task`, blocking while the stage is over its queue bound.
    ///
    /// The blocked path loops over bounded offers: wait for a space signal
    /// (or the offer interval), then re-check room and shutdown. A submission
    /// is never silently dropped; it either enqueues or fails `Rejected`.
    pub(crate) fn enqueue(self: &Arc<Self>, task: Task) -> Result<(), Rejected> {
        if self.is_shut_down() {
            return Err(Rejected(()));
        }

        if self.has_room() {
            self.queue.push(task);
            self.nudge();
            return Ok(());
        }

        self.on_initial_rejection();
        loop {
            let signal = self.permit_waiters.register();

            if self.is_shut_down() {
                signal.cancel();
                self.on_final_rejection();
                return Err(Rejected(()));
            }
            if self.has_room() {
                signal.cancel();
                break;
            }

            if !signal.wait_until(Instant::now() + OFFER_INTERVAL) {
                // timed out: retire the entry (consuming a late wake if one
                // landed) and try another bounded offer
                signal.check_and_clear();
            }
        }

        self.queue.push(task);
        self.on_final_accept();
        self.nudge();
        Ok(())
    }

    /// Run one task on the calling thread, under the uncaught-failure
    /// wrapper. The caller must hold a permit; it is released here.
    pub(crate) fn run_task(self: &Arc<Self>, task: Task) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| task.run()));

        self.completed.fetch_add(1, Ordering::SeqCst);
        self.release_permit();
        // a permit (and possibly queue space) just freed up
        self.permit_waiters.signal();

        if let Err(payload) = result {
            fatal::handle_uncaught(&self.name, payload);
        }

        self.maybe_terminate();
    }

    /// Latch termination once the stage is shut down with nothing queued and
    /// nothing running, and retire it from the pool's scan list.
    pub(crate) fn maybe_terminate(self: &Arc<Self>) {
        if self.is_shut_down()
            && self.queue.is_empty()
            && self.active.load(Ordering::SeqCst) == 0
            && !self.terminated.is_signalled()
        {
            tracing::debug!(stage = %self.name, "stage terminated");
            self.terminated.signal_all();
            if let Some(pool) = self.pool.upgrade() {
                pool.remove_stage(self);
            }
        }
    }

    /// Stop accepting work. Queued tasks keep draining.
    pub(crate) fn begin_shutdown(self: &Arc<Self>) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::debug!(stage = %self.name, "stage shutting down");
        metrics::registry().deregister_scope(&self.pool_name, &self.name);
        // unblock submitters so they can observe the shutdown
        self.permit_waiters.signal_all();
        // wake workers to drain the backlog
        self.nudge();
        self.maybe_terminate();
    }

    fn on_initial_rejection(&self) {
        self.blocked_total.fetch_add(1, Ordering::SeqCst);
        self.blocked_now.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(stage = %self.name, "submission blocked on full queue");
    }

    fn on_final_accept(&self) {
        self.blocked_now.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(stage = %self.name, "blocked submission accepted");
    }

    fn on_final_rejection(&self) {
        self.blocked_now.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(stage = %self.name, "blocked submission rejected");
    }

    fn metric_id(&self, name: &'static str) -> MetricId {
        MetricId {
            group: metrics::GROUP,
            ty: metrics::TYPE,
            path: metrics::PATH,
            pool: self.pool_name.clone(),
            scope: self.name.clone(),
            name,
        }
    }
}

impl fmt::Debug for StageCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageCore")
            .field("name", &self.name)
            .field("max_workers", &self.max_workers)
            .field("max_queued", &self.max_queued)
            .field("active", &self.active_count())
            .field("pending", &self.pending_tasks())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

pub(crate) fn register_metrics(core: &Arc<StageCore>) {
    let registry = metrics::registry();

    let c = Arc::clone(core);
    registry.register(
        core.metric_id(metrics::ACTIVE_TASKS),
        MetricKind::Gauge,
        Box::new(move || c.active.load(Ordering::SeqCst) as u64),
    );
    let c = Arc::clone(core);
    registry.register(
        core.metric_id(metrics::PENDING_TASKS),
        MetricKind::Gauge,
        Box::new(move || c.queue.len() as u64),
    );
    let c = Arc::clone(core);
    registry.register(
        core.metric_id(metrics::COMPLETED_TASKS),
        MetricKind::Gauge,
        Box::new(move || c.completed.load(Ordering::SeqCst)),
    );
    let c = Arc::clone(core);
    registry.register(
        core.metric_id(metrics::TOTAL_BLOCKED_TASKS),
        MetricKind::Counter,
        Box::new(move || c.blocked_total.load(Ordering::SeqCst)),
    );
    let c = Arc::clone(core);
    registry.register(
        core.metric_id(metrics::CURRENTLY_BLOCKED_TASKS),
        MetricKind::Counter,
        Box::new(move || c.blocked_now.load(Ordering::SeqCst)),
    );
    let max = core.max_workers;
    registry.register(
        core.metric_id(metrics::MAX_POOL_SIZE),
        MetricKind::Gauge,
        Box::new(move || max as u64),
    );
}

/// A named submission endpoint backed by a [`SharedPool`].
///
/// Cheap to clone; all clones share the same stage.
///
/// [`SharedPool`]: crate::SharedPool
#[derive(Clone)]
pub struct StageExecutor {
    core: Arc<StageCore>,
}

impl StageExecutor {
    pub(crate) fn from_core(core: Arc<StageCore>) -> Self {
        Self { core }
    }

    /// The stage name this executor submits to.
    #[must_use]
    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Enqueue a task for execution, blocking while the stage's queue is at
    /// its bound.
    ///
    /// Tasks submitted to one stage are dispatched in submission order.
    ///
    /// # Errors
    ///
    /// Returns [`Rejected`] if the stage is shut down (immediately, or while
    /// the submission was blocked).
    pub fn submit<F>(&self, f: F) -> Result<(), Rejected>
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.enqueue(Task::new(f))
    }

    /// Alias for [`submit`](StageExecutor::submit).
    ///
    /// # Errors
    ///
    /// Returns [`Rejected`] if the stage is shut down.
    pub fn execute<F>(&self, f: F) -> Result<(), Rejected>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(f)
    }

    /// Submit a task and obtain a [`JoinHandle`] for its outcome.
    ///
    /// A panic inside `f` is captured into the handle (and still screened
    /// for fatal conditions) instead of going to the failure handler.
    ///
    /// # Errors
    ///
    /// Returns [`Rejected`] if the stage is shut down.
    pub fn spawn<T, F>(&self, f: F) -> Result<JoinHandle<T>, Rejected>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let completion = Completion::new();
        let outcome = Arc::clone(&completion);

        self.submit(move || match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => outcome.fulfil(Ok(value)),
            Err(payload) => {
                let failure = crate::error::TaskFailed::from_payload(payload);
                fatal::inspect(&failure);
                outcome.fulfil(Err(failure));
            }
        })?;

        Ok(JoinHandle::new(completion))
    }

    /// Run the task inline on the calling thread when the stage is idle
    /// enough, otherwise submit it normally.
    ///
    /// An inline run takes a regular execution slot and is counted in
    /// `active`/`completed` like any worker-run task. Inline execution only
    /// happens while the queue is empty, so queued tasks never get overtaken.
    ///
    /// # Errors
    ///
    /// Returns [`Rejected`] if the stage is shut down.
    pub fn maybe_execute_immediately<F>(&self, f: F) -> Result<(), Rejected>
    where
        F: FnOnce() + Send + 'static,
    {
        let core = &self.core;
        if core.is_shut_down() {
            return Err(Rejected(()));
        }

        if core.queue.is_empty() && core.try_acquire_permit() {
            if core.queue.is_empty() {
                core.run_task(Task::new(f));
                if core.pending_tasks() > 0 {
                    core.nudge();
                }
                return Ok(());
            }
            // queued work slipped in; line up behind it
            core.release_permit();
            // the freed slot is room on a rendezvous stage
            core.permit_waiters.signal();
            core.maybe_terminate();
        }

        core.enqueue(Task::new(f))
    }

    /// Stop accepting new work. Already-queued tasks continue to drain.
    ///
    /// Idempotent. The stage's metrics are released here.
    pub fn shutdown(&self) {
        self.core.begin_shutdown();
    }

    /// Block until the stage has shut down and drained, or `deadline`
    /// passes.
    ///
    /// # Errors
    ///
    /// Returns [`TimedOut`] if the deadline passed first.
    pub fn await_termination(&self, deadline: Instant) -> Result<(), TimedOut> {
        if self.core.terminated.wait_until(deadline) {
            Ok(())
        } else {
            Err(TimedOut(()))
        }
    }

    /// Tasks currently executing.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.core.active_count()
    }

    /// Tasks that have finished executing (successfully or not).
    #[must_use]
    pub fn completed_count(&self) -> u64 {
        self.core.completed_count()
    }

    /// Tasks queued but not yet dispatched.
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.core.pending_tasks()
    }

    /// The stage's concurrency cap.
    #[must_use]
    pub fn max_pool_size(&self) -> usize {
        self.core.max_workers()
    }
}

impl fmt::Debug for StageExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageExecutor")
            .field("core", &self.core)
            .finish()
    }
}

static_assertions::assert_impl_all!(StageExecutor: Send, Sync);
