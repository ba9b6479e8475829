//! Monotonic time sources.

use std::{fmt::Debug, time::Instant};
#[cfg(any(test, feature = "dev-context-only-utils"))]
use std::{sync::Mutex, time::Duration};

/// Source of monotonic timestamps.
pub trait Clock: Debug + Send + Sync {
    fn now(&self) -> Instant;
}

/// The real monotonic clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[cfg(any(test, feature = "dev-context-only-utils"))]
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

#[cfg(any(test, feature = "dev-context-only-utils"))]
impl Default for ManualClock {
    fn default() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }
}

#[cfg(any(test, feature = "dev-context-only-utils"))]
impl ManualClock {
    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap();
        *offset = offset.saturating_add(by);
    }
}

#[cfg(any(test, feature = "dev-context-only-utils"))]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = *self.offset.lock().unwrap();
        self.base.checked_add(offset).unwrap()
    }
}
