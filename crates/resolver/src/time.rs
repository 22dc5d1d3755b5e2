//! Monotonic time handling (component C1).
//!
//! All deadlines inside the engine are expressed in [`Timeval`], a
//! `(seconds, microseconds)` pair measured against an arbitrary monotonic
//! epoch. Wall-clock skew must never affect dispatch/timeout behavior, so
//! `now()` is derived from [`std::time::Instant`] rather than
//! [`std::time::SystemTime`].

use once_cell::sync::Lazy;
use std::time::Instant;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// A monotonic timestamp, lexicographically ordered `(sec, usec)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Timeval {
    pub sec: u64,
    pub usec: u32,
}

impl Timeval {
    pub const ZERO: Timeval = Timeval { sec: 0, usec: 0 };

    pub fn new(sec: u64, usec: u32) -> Self {
        let mut t = Timeval { sec, usec: 0 };
        t.add_usec(usec as u64);
        t
    }

    fn add_usec(&mut self, usec: u64) {
        self.sec += usec / 1_000_000;
        self.usec += (usec % 1_000_000) as u32;
        if self.usec >= 1_000_000 {
            self.sec += 1;
            self.usec -= 1_000_000;
        }
    }

    /// Returns `t + millis`, normalized.
    pub fn plus_millis(&self, millis: u64) -> Timeval {
        let mut t = *self;
        t.sec += millis / 1000;
        t.add_usec((millis % 1000) * 1000);
        t
    }

    pub fn as_millis(&self) -> u64 {
        self.sec * 1000 + (self.usec / 1000) as u64
    }
}

/// Current monotonic time relative to process start.
pub fn now() -> Timeval {
    let elapsed = Instant::now().duration_since(*EPOCH);
    Timeval::new(elapsed.as_secs(), elapsed.subsec_micros())
}

/// `now >= deadline` by lexicographic `(sec, usec)` compare.
pub fn timedout(now: Timeval, deadline: Timeval) -> bool {
    now >= deadline
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plus_millis_normalizes() {
        let t = Timeval::new(0, 900_000);
        let t2 = t.plus_millis(200);
        assert_eq!(t2, Timeval::new(1, 100_000));
    }

    #[test]
    fn timedout_is_inclusive() {
        let t = Timeval::new(5, 0);
        assert!(timedout(t, t));
        assert!(timedout(t.plus_millis(1), t));
        assert!(!timedout(t, t.plus_millis(1)));
    }

    #[test]
    fn ordering_is_lexicographic() {
        assert!(Timeval::new(1, 999_999) < Timeval::new(2, 0));
        assert!(Timeval::new(1, 5) < Timeval::new(1, 6));
    }
}
