// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::TimedOut;
use crate::executor::stage::{StageCore, StageExecutor, register_metrics};
use crate::executor::task::Task;
use crate::loom::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use crate::loom::thread;
use crate::sync::{OneShotCondition, Signal, WaitQueue};
use core::fmt;
use crossbeam_utils::Backoff;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long an idle worker stays parked before retiring its thread. A
/// retired worker is respawned on demand by the submission nudge.
const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(10);

pub(crate) struct PoolCore {
    name: String,
    /// Live (non-terminated) stages. Locked only on membership change;
    /// workers scan over a snapshot.
    stages: Mutex<Vec<Arc<StageCore>>>,
    /// Parked workers, woken by the submission nudge.
    descheduled: WaitQueue,
    shut_down: AtomicBool,
    /// Live worker threads.
    workers: AtomicUsize,
    /// Pool-wide worker ceiling.
    max_workers: usize,
    next_worker_id: AtomicUsize,
    keep_alive: Duration,
    /// Latched once shut down and every worker has exited.
    terminated: OneShotCondition,
}

impl PoolCore {
    fn new(name: String, max_workers: usize, keep_alive: Duration) -> Arc<Self> {
        Arc::new(Self {
            name,
            stages: Mutex::new(Vec::new()),
            descheduled: WaitQueue::new(),
            shut_down: AtomicBool::new(false),
            workers: AtomicUsize::new(0),
            max_workers,
            next_worker_id: AtomicUsize::new(0),
            keep_alive,
            terminated: OneShotCondition::new(),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn snapshot_stages(&self) -> Vec<Arc<StageCore>> {
        self.stages.lock().clone()
    }

    pub(crate) fn remove_stage(&self, stage: &Arc<StageCore>) {
        self.stages.lock().retain(|s| !Arc::ptr_eq(s, stage));
    }

    fn has_pending(&self) -> bool {
        self.snapshot_stages()
            .iter()
            .any(|stage| stage.pending_tasks() > 0)
    }

    /// React to new work: wake a parked worker if there is one, else grow
    /// the worker set while below the ceiling, else do nothing (a spinning
    /// or working worker will pick the task up on its next scan).
    pub(crate) fn maybe_schedule(self: &Arc<Self>) {
        if self.descheduled.signal() {
            return;
        }

        loop {
            let workers = self.workers.load(Ordering::SeqCst);
            if workers >= self.max_workers {
                return;
            }
            if self
                .workers
                .compare_exchange(workers, workers + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.spawn_worker();
                return;
            }
        }
    }

    /// Spawn a worker thread. The caller has already counted it in
    /// `workers`.
    fn spawn_worker(self: &Arc<Self>) {
        let id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);
        let core = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("{}-worker-{id}", self.name))
            .spawn(move || worker_main(&core, id));

        if let Err(error) = spawned {
            self.workers.fetch_sub(1, Ordering::SeqCst);
            tracing::error!(pool = %self.name, %error, "failed to spawn pool worker");
        }
    }

    /// Find an eligible stage (backlog and a free execution slot), reserve a
    /// permit, and dequeue. Stages are scanned round-robin from `cursor` so
    /// no stage with work is starved.
    fn acquire_task(&self, cursor: &mut usize) -> Option<(Arc<StageCore>, Task)> {
        let stages = self.snapshot_stages();
        let len = stages.len();
        if len == 0 {
            return None;
        }

        let start = *cursor % len;
        for i in 0..len {
            let idx = (start + i) % len;
            let stage = &stages[idx];

            if stage.pending_tasks() == 0 || !stage.try_acquire_permit() {
                continue;
            }
            if let Some(task) = stage.take_task() {
                *cursor = idx + 1;
                return Some((Arc::clone(stage), task));
            }
            // the queue raced empty after we reserved; hand the slot back.
            // our transient permit may have kept a concurrent drain from
            // latching termination, so re-check it
            stage.release_permit();
            stage.maybe_terminate();
        }

        None
    }
}

impl fmt::Debug for PoolCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolCore")
            .field("name", &self.name)
            .field("workers", &self.workers.load(Ordering::SeqCst))
            .field("max_workers", &self.max_workers)
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

/// Run tasks until there is nothing left to do, then park; exit on shutdown
/// (after the drain) or after a full keep-alive of idleness.
fn worker_main(core: &Arc<PoolCore>, id: usize) {
    let _span = tracing::debug_span!("worker", pool = %core.name, worker = id).entered();
    let mut cursor = fastrand::usize(..);

    loop {
        if let Some((stage, task)) = core.acquire_task(&mut cursor) {
            run_stage_tasks(core, &stage, task);
            continue;
        }

        // short bounded busy-check: cheap latency insurance for bursts
        let backoff = Backoff::new();
        let spun = loop {
            if backoff.is_completed() {
                break None;
            }
            backoff.snooze();
            if let Some(work) = core.acquire_task(&mut cursor) {
                break Some(work);
            }
        };
        if let Some((stage, task)) = spun {
            run_stage_tasks(core, &stage, task);
            continue;
        }

        if core.is_shut_down() && !core.has_pending() {
            break;
        }

        let signal = core.descheduled.register();
        // the queue entry must exist before this final scan, otherwise a
        // submission racing with the park could go unnoticed
        if let Some((stage, task)) = core.acquire_task(&mut cursor) {
            signal.cancel();
            run_stage_tasks(core, &stage, task);
            continue;
        }
        if core.is_shut_down() && !core.has_pending() {
            signal.cancel();
            break;
        }

        if signal.wait_until(Instant::now() + core.keep_alive) {
            continue;
        }
        if signal.check_and_clear() {
            // nudged at the last instant; the wake is ours to act on
            continue;
        }

        tracing::trace!(worker = id, "idle timeout, retiring");
        break;
    }

    exit_worker(core);
}

fn run_stage_tasks(core: &Arc<PoolCore>, stage: &Arc<StageCore>, task: Task) {
    let mut task = task;
    loop {
        stage.run_task(task);

        if stage.pending_tasks() == 0 {
            break;
        }
        // backlog remains: make sure someone else looks at it too, then try
        // to keep working this stage while it has both work and permits
        core.maybe_schedule();
        if stage.try_acquire_permit() {
            if let Some(next) = stage.take_task() {
                task = next;
                continue;
            }
            stage.release_permit();
            stage.maybe_terminate();
        }
        break;
    }
}

fn exit_worker(core: &Arc<PoolCore>) {
    let remaining = core.workers.fetch_sub(1, Ordering::SeqCst) - 1;

    if core.has_pending() {
        // work appeared while we were on the way out; since we no longer
        // count towards the ceiling this can wake or spawn a replacement
        core.maybe_schedule();
    } else if remaining == 0 && core.is_shut_down() {
        core.terminated.signal_all();
    }
}

/// A pool of worker threads shared by any number of [`StageExecutor`]s.
///
/// Workers are spawned lazily as submissions arrive, up to the pool ceiling,
/// and retire after a keep-alive of idleness. Cheap to clone.
#[derive(Clone)]
pub struct SharedPool {
    core: Arc<PoolCore>,
}

impl SharedPool {
    /// A pool whose worker ceiling is the machine's available parallelism.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_workers(name, default_parallelism())
    }

    /// A pool with an explicit worker ceiling.
    pub fn with_workers(name: impl Into<String>, max_workers: usize) -> Self {
        Self {
            core: PoolCore::new(name.into(), max_workers, DEFAULT_KEEP_ALIVE),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_keep_alive(
        name: impl Into<String>,
        max_workers: usize,
        keep_alive: Duration,
    ) -> Self {
        Self {
            core: PoolCore::new(name.into(), max_workers, keep_alive),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Live worker threads right now.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.core.workers.load(Ordering::SeqCst)
    }

    /// Create a new stage served by this pool's workers.
    ///
    /// `max_workers` caps the stage's concurrent executions, `max_queued`
    /// bounds its queue (submitters block past the bound; `0` makes the
    /// stage a rendezvous). The stage's metrics are registered here and
    /// released again on stage shutdown.
    pub fn new_executor(
        &self,
        max_workers: usize,
        max_queued: usize,
        stage_name: impl Into<String>,
    ) -> StageExecutor {
        let core = StageCore::new(&self.core, max_workers, max_queued, stage_name.into());
        register_metrics(&core);
        self.core.stages.lock().push(Arc::clone(&core));

        if self.core.is_shut_down() {
            // the pool can no longer run anything for this stage
            core.begin_shutdown();
        }

        tracing::debug!(pool = %self.core.name, stage = %core.name(), "stage registered");
        StageExecutor::from_core(core)
    }

    /// Shut the pool down.
    ///
    /// Marks every stage as shut down (new submissions fail `Rejected`),
    /// wakes all parked workers, and lets the workers drain everything that
    /// was enqueued before this call. Idempotent.
    pub fn shutdown(&self) {
        let core = &self.core;
        if core.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::debug!(pool = %core.name, "pool shutting down");
        for stage in core.snapshot_stages() {
            stage.begin_shutdown();
        }
        core.descheduled.signal_all();

        if core.workers.load(Ordering::SeqCst) == 0 && !core.has_pending() {
            core.terminated.signal_all();
        }
    }

    /// Block until the pool has shut down and every worker has exited, or
    /// `deadline` passes.
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
}

impl fmt::Debug for SharedPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedPool")
            .field("core", &self.core)
            .finish()
    }
}

static_assertions::assert_impl_all!(SharedPool: Send, Sync);

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(4)
}
