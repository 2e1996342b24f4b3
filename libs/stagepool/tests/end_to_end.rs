// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end scenarios driving a shared pool and its stages together
//! through the public API.

#![cfg(not(loom))]

use stagepool::metrics::{self, MetricId};
use stagepool::{SharedPool, StageExecutor};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

fn far_deadline() -> Instant {
    Instant::now() + Duration::from_secs(30)
}

#[test]
fn backpressure_blocks_the_submitter_and_counts_it() {
    let pool = SharedPool::with_workers("backpressure", 2);
    let stage = pool.new_executor(1, 1, "bp-stage");

    let sleep = Duration::from_millis(100);
    for _ in 0..2 {
        stage.submit(move || std::thread::sleep(sleep)).unwrap();
    }

    // queue holds one task and one is (about to be) running; the third
    // submission has to wait for the first to finish
    let blocked_for = {
        let start = Instant::now();
        stage.submit(move || std::thread::sleep(sleep)).unwrap();
        start.elapsed()
    };
    assert!(blocked_for >= Duration::from_millis(20), "{blocked_for:?}");

    let blocked_id = MetricId {
        group: metrics::GROUP,
        ty: metrics::TYPE,
        path: metrics::PATH,
        pool: "backpressure".to_string(),
        scope: "bp-stage".to_string(),
        name: metrics::TOTAL_BLOCKED_TASKS,
    };
    assert!(metrics::registry().value(&blocked_id).unwrap() >= 1);

    stage.shutdown();
    stage.await_termination(far_deadline()).unwrap();
    assert_eq!(stage.completed_count(), 3);

    // metrics are released with the stage
    assert_eq!(metrics::registry().value(&blocked_id), None);
    pool.shutdown();
}

#[test]
fn per_stage_caps_hold_while_both_stages_progress() {
    const TASKS: usize = 1000;

    let pool = SharedPool::with_workers("conservation", 4);
    let x = pool.new_executor(2, TASKS, "stage-x");
    let y = pool.new_executor(2, TASKS, "stage-y");

    let x_active = Arc::new(AtomicUsize::new(0));
    let x_high = Arc::new(AtomicUsize::new(0));
    let y_active = Arc::new(AtomicUsize::new(0));
    let y_high = Arc::new(AtomicUsize::new(0));

    let flood = |stage: &StageExecutor,
                 active: &Arc<AtomicUsize>,
                 high: &Arc<AtomicUsize>| {
        for _ in 0..TASKS {
            let active = active.clone();
            let high = high.clone();
            stage
                .submit(move || {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    high.fetch_max(now, Ordering::SeqCst);
                    active.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap();
        }
    };
    flood(&x, &x_active, &x_high);
    flood(&y, &y_active, &y_high);

    x.shutdown();
    y.shutdown();
    x.await_termination(far_deadline()).unwrap();
    y.await_termination(far_deadline()).unwrap();

    assert_eq!(x.completed_count(), TASKS as u64);
    assert_eq!(y.completed_count(), TASKS as u64);
    assert!(x_high.load(Ordering::SeqCst) <= 2);
    assert!(y_high.load(Ordering::SeqCst) <= 2);

    pool.shutdown();
    pool.await_termination(far_deadline()).unwrap();
}

#[test]
fn tasks_enqueued_before_shutdown_still_run() {
    let pool = SharedPool::with_workers("drain", 2);
    let stage = pool.new_executor(1, 1024, "drain-stage");

    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..64 {
        let ran = ran.clone();
        stage
            .submit(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    pool.shutdown();
    pool.await_termination(far_deadline()).unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 64);

    // and nothing is accepted afterwards
    assert!(stage.submit(|| {}).is_err());
}
