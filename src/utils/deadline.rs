//! Wall-clock deadline tracking for the blocking protocol waits:
//! completion collection, barrier rounds, waiting out the shard leader's
//! ragged-edge publication, and view-installation waits. All of these
//! follow the same shape (re-check a condition, sleep or park for the
//! time left, give up at the deadline), so the arithmetic lives here.

use std::time::{Duration, Instant};

/// A point in time by which a blocking wait must have succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    end: Instant,
}

impl Deadline {
    /// A deadline the given duration from now.
    pub fn after(timeout: Duration) -> Deadline {
        Deadline {
            end: Instant::now() + timeout,
        }
    }

    /// Has the deadline passed?
    #[inline]
    pub fn expired(&self) -> bool {
        Instant::now() >= self.end
    }

    /// Time left until the deadline; zero once it has passed. Suitable
    /// as the timeout argument of a condvar park or a bounded sleep.
    #[inline]
    pub fn remaining(&self) -> Duration {
        self.end.saturating_duration_since(Instant::now())
    }
}

#[cfg(test)]
mod deadline_tests {
    use super::*;
    use std::thread;

    #[test]
    fn fresh_deadline_not_expired() {
        let deadline = Deadline::after(Duration::from_secs(60));
        assert!(!deadline.expired());
        assert!(deadline.remaining() > Duration::from_secs(59));
    }

    #[test]
    fn expires_after_waiting() {
        let deadline = Deadline::after(Duration::from_millis(20));
        thread::sleep(Duration::from_millis(40));
        assert!(deadline.expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }

    #[test]
    fn remaining_shrinks() {
        let deadline = Deadline::after(Duration::from_secs(5));
        let first = deadline.remaining();
        thread::sleep(Duration::from_millis(10));
        assert!(deadline.remaining() < first);
    }
}
