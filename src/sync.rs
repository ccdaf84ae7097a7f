// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Poison-tolerant lock helpers.
//!
//! A worker that panics while holding the job table, a job's state or the
//! subscriber set must not take the whole queue down with it. These helpers
//! log the poisoning and hand back the guard so the rest of the process keeps
//! serving. The panicking worker itself is turned into a `failed` job by the
//! manager's supervisor.

use std::sync::{Mutex, MutexGuard};

/// Acquire a mutex, recovering from poisoning if necessary.
#[inline]
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!(
                target: "fetchq::sync",
                event = "LOCK_POISONED",
                "Mutex was poisoned by a panicking task. Recovering data."
            );
            poisoned.into_inner()
        }
    }
}
