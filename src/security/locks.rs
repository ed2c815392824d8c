// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Poison-tolerant lock helpers.
//!
//! Command handlers run under `catch_unwind`, so a handler that panics while
//! holding the session table or the scope table poisons it without taking
//! the process down. Every later acquisition goes through these helpers,
//! which log the poisoning once per acquisition and hand back the guard.
//!
//! ```no_run
//! use std::sync::Mutex;
//! use fladmin::security::locks::resilient_lock;
//!
//! let tokens = Mutex::new(Vec::<String>::new());
//! resilient_lock(&tokens).push("sess_0011".to_string());
//! ```

use std::sync::{LockResult, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

fn recover<G>(result: LockResult<G>, kind: &'static str) -> G {
    result.unwrap_or_else(|poisoned| {
        tracing::error!(
            target: "security::locks",
            lock = kind,
            "lock poisoned by a panicking command handler; continuing with recovered state"
        );
        poisoned.into_inner()
    })
}

#[inline]
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    recover(lock.lock(), "mutex")
}

#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    recover(lock.read(), "rwlock-read")
}

#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    recover(lock.write(), "rwlock-write")
}
