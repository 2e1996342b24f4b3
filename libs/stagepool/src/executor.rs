// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The shared worker pool and its per-stage submission endpoints.
//!
//! A [`SharedPool`] owns a set of worker threads that service every stage
//! registered with it. Each [`StageExecutor`] enforces its own concurrency
//! cap and queue bound; the pool keeps the workers busy wherever eligible
//! work exists, respecting FIFO order within each stage.

mod pool;
mod stage;
mod task;

pub use pool::SharedPool;
pub use stage::StageExecutor;
pub use task::JoinHandle;
