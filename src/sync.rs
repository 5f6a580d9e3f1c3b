//! A module which decides which synchronization primitives to use throughout the rest of the crate
//! depending on features and configuration options

use core::time::Duration;

cfg_if::cfg_if! {
    if #[cfg(feature = "shuttle")] {
        pub(crate) use shuttle::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
        pub(crate) use shuttle::sync::{Arc, Mutex};
    } else {
        pub(crate) use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
        pub(crate) use std::sync::{Arc, Mutex};
    }
}

/// Wait before retrying a contended step. The first `spin_retries` attempts only spin; later
/// attempts give up the CPU for `backoff`.
#[cfg(not(feature = "shuttle"))]
pub(crate) fn spin_wait(attempt: usize, spin_retries: usize, backoff: Duration) {
    if attempt < spin_retries {
        core::hint::spin_loop();
    } else if backoff.is_zero() {
        std::thread::yield_now();
    } else {
        std::thread::sleep(backoff);
    }
}

/// Under shuttle every wait has to be a scheduling point, otherwise a spinning thread would never
/// let the thread it waits on make progress.
#[cfg(feature = "shuttle")]
pub(crate) fn spin_wait(_attempt: usize, _spin_retries: usize, _backoff: Duration) {
    shuttle::thread::yield_now();
}
