// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Uncaught-failure routing and fatal-condition escalation.
//!
//! Every task runs under a wrapper that catches unwinds so a panicking task
//! never takes its worker down. Ordinary failures are forwarded to the
//! installed [`FailureHandler`] (or logged). Failures that indicate the
//! process itself is doomed — memory or file-handle exhaustion — bypass
//! recovery entirely: diagnostics are triggered and the process exits with
//! [`FATAL_EXIT_CODE`] through the installed [`FatalHooks`].

use crate::error::TaskFailed;
use core::any::Any;
use parking_lot::RwLock;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

/// Exit code used when a fatal condition terminates the process.
pub const FATAL_EXIT_CODE: i32 = 100;

/// Process-level collaborators invoked on a fatal condition.
///
/// The default implementation terminates the process; tests install a
/// recording stub instead.
pub trait FatalHooks: Send + Sync {
    /// Capture heap diagnostics. Invoked for out-of-memory conditions only;
    /// may be a no-op.
    fn trigger_heap_diagnostic(&self) {}

    /// Drop any registered shutdown hooks so the exit is immediate.
    fn remove_all_shutdown_hooks(&self) {}

    /// Terminate the process with `code`.
    fn exit_process(&self, code: i32);
}

struct ProcessExit;

impl FatalHooks for ProcessExit {
    fn exit_process(&self, code: i32) {
        std::process::exit(code);
    }
}

/// Handler invoked with the stage name and the captured failure for every
/// uncaught task failure that is not routed to a join handle.
pub type FailureHandler = Arc<dyn Fn(&str, &TaskFailed) + Send + Sync>;

static HOOKS: RwLock<Option<Arc<dyn FatalHooks>>> = RwLock::new(None);
static FAILURE_HANDLER: RwLock<Option<FailureHandler>> = RwLock::new(None);

/// Install the process-level fatal collaborators.
pub fn set_fatal_hooks(hooks: Arc<dyn FatalHooks>) {
    *HOOKS.write() = Some(hooks);
}

/// Install the process-wide uncaught-failure handler.
pub fn set_failure_handler(handler: FailureHandler) {
    *FAILURE_HANDLER.write() = Some(handler);
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum FatalKind {
    OutOfMemory,
    FileHandleExhaustion,
}

const OOM_MARKERS: &[&str] = &["out of memory", "OutOfMemory", "allocation failed"];
const FILE_MARKERS: &[&str] = &["Too many open files", "No space left on device"];

pub(crate) fn classify(message: &str) -> Option<FatalKind> {
    if OOM_MARKERS.iter().any(|marker| message.contains(marker)) {
        return Some(FatalKind::OutOfMemory);
    }
    if FILE_MARKERS.iter().any(|marker| message.contains(marker)) {
        return Some(FatalKind::FileHandleExhaustion);
    }
    None
}

/// Screen a captured failure for fatal conditions.
///
/// Non-fatal failures return normally. A fatal condition triggers the hooks
/// and, under the default hooks, does not return.
pub(crate) fn inspect(failure: &TaskFailed) {
    let Some(kind) = classify(failure.message()) else {
        return;
    };

    tracing::error!(error = %failure, ?kind, "fatal condition, terminating process");

    let hooks = HOOKS
        .read()
        .clone()
        .unwrap_or_else(|| Arc::new(ProcessExit));
    if kind == FatalKind::OutOfMemory {
        hooks.trigger_heap_diagnostic();
    }
    hooks.remove_all_shutdown_hooks();
    hooks.exit_process(FATAL_EXIT_CODE);
}

/// Route an uncaught task failure: fatal conditions escalate, everything
/// else goes to the installed handler or the log. The worker carries on.
pub(crate) fn handle_uncaught(stage: &str, payload: Box<dyn Any + Send>) {
    let failure = TaskFailed::from_payload(payload);
    inspect(&failure);

    if let Some(handler) = FAILURE_HANDLER.read().clone() {
        handler(stage, &failure);
    } else {
        tracing::error!(stage, error = %failure, "uncaught task failure");
    }
}

/// Wrap a recurring closure so failures are logged and swallowed instead of
/// cancelling the recurrence.
pub fn swallow_failures<F>(mut f: F) -> impl FnMut() + Send
where
    F: FnMut() + Send,
{
    move || {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(&mut f)) {
            let failure = TaskFailed::from_payload(payload);
            tracing::warn!(error = %failure, "recurring task failed, continuing");
        }
    }
}
