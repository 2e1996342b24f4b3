// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Thread suspension seam.
//!
//! The per-thread contract is the platform's: a pending unpark permits the
//! next park to return immediately, and parks may return spuriously, so every
//! caller re-checks its wakeup condition in a loop.

use crate::loom::thread::{self, Thread};
use core::time::Duration;
use std::sync::atomic::{AtomicU64, Ordering};

/// Handle used to wake a parked thread.
///
/// Besides the thread handle itself this carries a small process-unique token
/// so that wake walks can recognize a thread they have already woken once
/// (threads re-register with fresh queue entries, so the entries themselves
/// carry no identity).
#[derive(Clone, Debug)]
pub(crate) struct Unpark {
    thread: Thread,
    token: u64,
}

impl Unpark {
    pub(crate) fn unpark(&self) {
        tracing::trace!(thread = ?self.thread, "unparking");
        self.thread.unpark();
    }

    pub(crate) fn token(&self) -> u64 {
        self.token
    }
}

/// An [`Unpark`] handle for the calling thread.
pub(crate) fn current() -> Unpark {
    static NEXT_TOKEN: AtomicU64 = AtomicU64::new(0);

    std::thread_local! {
        static TOKEN: u64 = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
    }

    Unpark {
        thread: thread::current(),
        token: TOKEN.with(|token| *token),
    }
}

#[inline]
pub(crate) fn park() {
    thread::park();
}

#[inline]
pub(crate) fn park_timeout(timeout: Duration) {
    cfg_if::cfg_if! {
        if #[cfg(loom)] {
            // loom has no timed park; models must not depend on timeouts firing
            let _ = timeout;
            thread::park();
        } else {
            thread::park_timeout(timeout);
        }
    }
}
