// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Time sources.
//!
//! Everything that stamps or schedules goes through the [`Clock`] capability
//! so tests can inject a deterministic source. The default is
//! [`MonotonicClock`]: nanoseconds since the first observation in this
//! process, immune to wall-clock adjustments.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::time::Timestamp;

pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Monotonic nanoseconds since the process-wide epoch (the first time any
/// monotonic clock was read).
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

/// Wall-clock nanoseconds since the Unix epoch.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

/// A clock that only moves when told to. Test aid.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

/// The shared default clock: monotonic.
pub fn default_clock() -> Arc<dyn Clock> {
    static DEFAULT: OnceLock<Arc<MonotonicClock>> = OnceLock::new();
    DEFAULT.get_or_init(|| Arc::new(MonotonicClock)).clone()
}

fn process_epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

// === impl MonotonicClock ===

impl Clock for MonotonicClock {
    fn now(&self) -> Timestamp {
        Timestamp::new(i64::try_from(process_epoch().elapsed().as_nanos()).unwrap_or(i64::MAX))
    }
}

// === impl SystemClock ===

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp::new(i64::try_from(since_epoch.as_nanos()).unwrap_or(i64::MAX))
    }
}

// === impl ManualClock ===

impl ManualClock {
    pub fn new(now: Timestamp) -> Self {
        Self {
            now: AtomicI64::new(now.nanoseconds()),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now.nanoseconds(), Ordering::Release);
    }

    pub fn advance(&self, nanoseconds: i64) {
        self.now.fetch_add(nanoseconds, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.now.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn monotonic_never_goes_backwards() {
        let clock = MonotonicClock;
        let a = clock.now();
        std::thread::sleep(Duration::from_millis(1));
        let b = clock.now();
        assert!(b > a);
    }

    #[test]
    fn manual_clock_moves_on_demand() {
        let clock = ManualClock::new(Timestamp::new(10));
        assert_eq!(clock.now(), Timestamp::new(10));
        clock.advance(5);
        assert_eq!(clock.now(), Timestamp::new(15));
        clock.set(Timestamp::new(1));
        assert_eq!(clock.now(), Timestamp::new(1));
    }
}
