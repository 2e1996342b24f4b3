// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::any::Any;
use core::fmt;

/// A submission was refused because the stage (or its pool) is shut down.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Rejected(pub(crate) ());

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("stage is shut down")
    }
}

impl core::error::Error for Rejected {}

/// A deadline elapsed before the awaited event occurred.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TimedOut(pub(crate) ());

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("deadline elapsed")
    }
}

impl core::error::Error for TimedOut {}

/// A task panicked while executing.
///
/// The panic payload is captured as a message where possible so it can be
/// routed to the failure handler or surfaced through a
/// [`JoinHandle`](crate::JoinHandle).
#[derive(Clone, Debug)]
pub struct TaskFailed {
    message: String,
}

impl TaskFailed {
    pub(crate) fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&'static str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "task panicked".to_string()
        };

        Self { message }
    }

    /// The captured panic message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for TaskFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task failed: {}", self.message)
    }
}

impl core::error::Error for TaskFailed {}
