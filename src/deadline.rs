//! Caller-controlled deadlines for blocking operations.

use std::time::Duration;
use tokio::time::Instant;

/// Point in time after which an operation should give up.
///
/// Every blocking exchange operation takes a `Deadline`. Gets wait for the
/// shorter of their configured wait interval and the time left; the connect
/// retry loop refuses to sleep past it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// No deadline; operations are bounded only by their own wait intervals.
    pub fn none() -> Self {
        Self(None)
    }

    pub fn after(timeout: Duration) -> Self {
        Self(Some(Instant::now() + timeout))
    }

    pub fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    /// Time left, or `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.0
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.remaining() == Some(Duration::ZERO)
    }

    /// Shorten `wait` so it does not run past the deadline.
    pub fn clamp(&self, wait: Duration) -> Duration {
        match self.remaining() {
            Some(left) => wait.min(left),
            None => wait,
        }
    }

    /// Whether sleeping for `delay` would still leave time to act.
    pub fn allows(&self, delay: Duration) -> bool {
        match self.remaining() {
            Some(left) => delay < left,
            None => true,
        }
    }
}
