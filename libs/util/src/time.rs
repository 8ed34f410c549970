// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Nanosecond timestamps.

use core::fmt;
use core::ops::{Add, Sub};
use core::time::Duration;

/// A point in time expressed as signed nanoseconds since some clock's epoch.
///
/// Which epoch depends on the clock that produced the value; timestamps from
/// different clocks do not compare meaningfully.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

// === impl Timestamp ===

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub const fn new(nanoseconds: i64) -> Self {
        Timestamp(nanoseconds)
    }

    pub const fn nanoseconds(self) -> i64 {
        self.0
    }

    pub const fn microseconds(self) -> i64 {
        self.0 / 1_000
    }

    pub const fn milliseconds(self) -> i64 {
        self.0 / 1_000_000
    }

    pub const fn seconds(self) -> i64 {
        self.0 / 1_000_000_000
    }

    /// Nanoseconds elapsed since `earlier`, saturating to zero if `earlier`
    /// is in fact later.
    pub fn saturating_since(self, earlier: Timestamp) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0).max(0).cast_unsigned())
    }
}

impl From<Duration> for Timestamp {
    fn from(value: Duration) -> Self {
        Timestamp(i64::try_from(value.as_nanos()).unwrap_or(i64::MAX))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(
            self.0
                .saturating_add(i64::try_from(rhs.as_nanos()).unwrap_or(i64::MAX)),
        )
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Duration) -> Timestamp {
        Timestamp(
            self.0
                .saturating_sub(i64::try_from(rhs.as_nanos()).unwrap_or(i64::MAX)),
        )
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

/// The period of one cycle at `hz`, or `None` for frequencies at or below
/// zero (including non-finite values).
pub fn period_from_hz(hz: f64) -> Option<Duration> {
    if hz.is_finite() && hz > 0.0 {
        Some(Duration::from_secs_f64(1.0 / hz))
    } else {
        None
    }
}

/// The frequency corresponding to `period`, zero for the zero period.
pub fn hz_from_period(period: Duration) -> f64 {
    let secs = period.as_secs_f64();
    if secs > 0.0 { 1.0 / secs } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_accessors() {
        let ts = Timestamp::new(1_500_000_000);
        assert_eq!(ts.nanoseconds(), 1_500_000_000);
        assert_eq!(ts.microseconds(), 1_500_000);
        assert_eq!(ts.milliseconds(), 1_500);
        assert_eq!(ts.seconds(), 1);
    }

    #[test]
    fn saturating_since_is_never_negative() {
        let early = Timestamp::new(100);
        let late = Timestamp::new(400);
        assert_eq!(late.saturating_since(early), Duration::from_nanos(300));
        assert_eq!(early.saturating_since(late), Duration::ZERO);
    }

    #[test]
    fn period_conversions() {
        assert_eq!(period_from_hz(1000.0), Some(Duration::from_millis(1)));
        assert_eq!(period_from_hz(0.0), None);
        assert_eq!(period_from_hz(-5.0), None);
        let period = period_from_hz(100.0).unwrap();
        assert!((hz_from_period(period) - 100.0).abs() < 1e-9);
    }
}
