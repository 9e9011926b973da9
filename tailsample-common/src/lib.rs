// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Shared plumbing for the tail-sampling processor crates: the background
//! worker contract, mutex helpers and environment lookups.

use std::sync::{Mutex, MutexGuard};

pub mod worker;

/// Environment variable holding the cluster-local node identity.
pub const HOSTNAME_ENV: &str = "HOSTNAME";

/// Fallback node identity when `HOSTNAME` is unset or empty.
pub const DEFAULT_NODE_NAME: &str = "localhost";

/// Extension trait for `Mutex` to provide a method that acquires a lock,
/// panicking if the lock is poisoned.
///
/// Used to avoid sprinkling `#[allow(clippy::unwrap_used)]` over every mutex
/// acquisition; a poisoned lock means another thread panicked while holding
/// component state, and there is nothing sensible to recover.
///
/// # Panics
///
/// `lock_or_panic` panics if the `Mutex` is poisoned.
///
/// # Examples
///
/// ```
/// use std::sync::{Arc, Mutex};
/// use tailsample_common::MutexExt;
///
/// let data = Arc::new(Mutex::new(5));
/// let data_clone = Arc::clone(&data);
///
/// std::thread::spawn(move || {
///     let mut num = data_clone.lock_or_panic();
///     *num += 1;
/// })
/// .join()
/// .expect("Thread panicked");
///
/// assert_eq!(*data.lock_or_panic(), 6);
/// ```
pub trait MutexExt<T> {
    fn lock_or_panic(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    #[inline(always)]
    #[track_caller]
    fn lock_or_panic(&self) -> MutexGuard<'_, T> {
        #[allow(clippy::unwrap_used)]
        self.lock().unwrap()
    }
}

/// Resolve the cluster-local node identity from the environment.
///
/// Reads `HOSTNAME` and falls back to `localhost` when the variable is unset
/// or empty.
pub fn node_name() -> String {
    parse_env::str_not_empty(HOSTNAME_ENV).unwrap_or_else(|| DEFAULT_NODE_NAME.to_owned())
}

pub mod parse_env {
    use std::env;

    pub fn str_not_empty(name: &str) -> Option<String> {
        env::var(name).ok().filter(|s| !s.is_empty())
    }
}
