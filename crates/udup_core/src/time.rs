//! Logical time for udup.
//!
//! Queries are ordered by Lamport time rather than wall clock, so every node
//! can tell whether a query was issued before or after it joined the cluster.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Logical time - monotonically increasing counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalTime(u64);

impl LogicalTime {
    /// Create a new logical time at zero
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Create from raw value
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Get raw value
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Create incremented time
    #[must_use]
    pub fn incremented(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl Default for LogicalTime {
    fn default() -> Self {
        Self::zero()
    }
}

impl std::fmt::Display for LogicalTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "T{}", self.0)
    }
}

impl From<u64> for LogicalTime {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Thread-safe Lamport clock.
///
/// `increment` is used when issuing a query, `witness` when receiving one.
/// After `witness(t)` the clock is always strictly greater than `t`.
#[derive(Debug, Default)]
pub struct LamportClock {
    counter: AtomicU64,
}

impl LamportClock {
    /// Create a clock at zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of the clock
    #[must_use]
    pub fn time(&self) -> LogicalTime {
        LogicalTime(self.counter.load(Ordering::SeqCst))
    }

    /// Advance the clock and return the new time
    pub fn increment(&self) -> LogicalTime {
        LogicalTime(self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Observe a time from another node
    pub fn witness(&self, observed: LogicalTime) {
        let target = observed.as_u64().saturating_add(1);
        let mut current = self.counter.load(Ordering::SeqCst);
        while current < target {
            match self.counter.compare_exchange_weak(
                current,
                target,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logical_time() {
        let t = LogicalTime::zero();
        assert_eq!(t.as_u64(), 0);

        let t2 = t.incremented();
        assert_eq!(t2.as_u64(), 1);
        assert_eq!(t.as_u64(), 0);
    }

    #[test]
    fn test_logical_time_ord() {
        let t1 = LogicalTime::from_raw(1);
        let t2 = LogicalTime::from_raw(2);
        let t3 = LogicalTime::from_raw(2);

        assert!(t1 < t2);
        assert_eq!(t2, t3);
    }

    #[test]
    fn test_logical_time_serializes_as_number() {
        let json = serde_json::to_string(&LogicalTime::from_raw(7)).unwrap();
        assert_eq!(json, "7");
    }

    #[test]
    fn test_clock_increment() {
        let clock = LamportClock::new();
        assert_eq!(clock.increment(), LogicalTime::from_raw(1));
        assert_eq!(clock.increment(), LogicalTime::from_raw(2));
        assert_eq!(clock.time(), LogicalTime::from_raw(2));
    }

    #[test]
    fn test_clock_witness_moves_forward_only() {
        let clock = LamportClock::new();
        clock.witness(LogicalTime::from_raw(10));
        assert_eq!(clock.time(), LogicalTime::from_raw(11));

        clock.witness(LogicalTime::from_raw(3));
        assert_eq!(clock.time(), LogicalTime::from_raw(11));
    }

    proptest::proptest! {
        #[test]
        fn prop_witness_exceeds_observed(observed in 0u64..u64::MAX - 1, local in 0u64..1000) {
            let clock = LamportClock::new();
            for _ in 0..local {
                clock.increment();
            }
            clock.witness(LogicalTime::from_raw(observed));
            proptest::prop_assert!(clock.time().as_u64() > observed);
        }
    }
}
