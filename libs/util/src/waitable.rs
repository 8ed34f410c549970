// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A bundled mutex/condvar wait point.
//!
//! The waitable owns no state of its own: the waited-on condition lives in
//! the caller's atomics. To publish a state change race-free, take
//! [`Waitable::guard`] around the store and notify while holding it.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub struct Waitable {
    lock: Mutex<()>,
    condvar: Condvar,
}

// === impl Waitable ===

impl Waitable {
    pub const fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    /// Locks the waitable around a state change so a concurrent waiter cannot
    /// miss the following notify.
    pub fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until `condition` is true. Re-evaluates on every wakeup;
    /// spurious wakeups are harmless.
    pub fn wait(&self, mut condition: impl FnMut() -> bool) {
        let mut guard = self.guard();
        while !condition() {
            guard = self
                .condvar
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Blocks until `condition` is true or `timeout` elapsed. Returns the
    /// final verdict of `condition`.
    pub fn wait_for(&self, timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.guard();
        loop {
            if condition() {
                return true;
            }
            let Some(remaining) = deadline
                .checked_duration_since(Instant::now())
                .filter(|d| !d.is_zero())
            else {
                return condition();
            };
            let (next, _timed_out) = self
                .condvar
                .wait_timeout(guard, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            guard = next;
        }
    }

    pub fn notify_one(&self) {
        self.condvar.notify_one();
    }

    pub fn notify_all(&self) {
        self.condvar.notify_all();
    }
}

impl Default for Waitable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn wait_sees_a_published_change() {
        let waitable = Arc::new(Waitable::new());
        let flag = Arc::new(AtomicBool::new(false));

        let publisher = {
            let waitable = waitable.clone();
            let flag = flag.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(1));
                let _guard = waitable.guard();
                flag.store(true, Ordering::SeqCst);
                waitable.notify_all();
            })
        };

        waitable.wait(|| flag.load(Ordering::SeqCst));
        assert!(flag.load(Ordering::SeqCst));
        publisher.join().unwrap();
    }

    #[test]
    fn wait_for_reports_the_condition_verdict() {
        let waitable = Waitable::new();
        assert!(!waitable.wait_for(Duration::from_millis(5), || false));
        assert!(waitable.wait_for(Duration::from_millis(5), || true));
    }

    #[test]
    fn wait_for_wakes_before_the_timeout() {
        let waitable = Arc::new(Waitable::new());
        let flag = Arc::new(AtomicBool::new(false));

        let publisher = {
            let waitable = waitable.clone();
            let flag = flag.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(5));
                let _guard = waitable.guard();
                flag.store(true, Ordering::SeqCst);
                waitable.notify_all();
            })
        };

        let start = Instant::now();
        assert!(waitable.wait_for(Duration::from_secs(5), || flag.load(Ordering::SeqCst)));
        assert!(start.elapsed() < Duration::from_secs(5));
        publisher.join().unwrap();
    }
}
