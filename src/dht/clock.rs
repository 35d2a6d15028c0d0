//! Injectable monotonic clock.
//!
//! Every timestamp-consuming component (`PeerManager`, `DataStore`,
//! `KBucket.last_accessed`, token issuance) reads time through this trait
//! rather than calling `Instant::now()` directly, so tests can advance time
//! in discrete steps instead of sleeping for real.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> Instant;
}

/// Production clock backed by `std::time::Instant`.
#[derive(Debug, Clone, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Test clock that only advances when told to. `now()` is a fixed base
/// instant plus an atomically-tracked offset.
#[derive(Debug, Clone)]
pub struct VirtualClock {
    base: Instant,
    offset_millis: Arc<AtomicU64>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset_millis: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Move the clock forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        self.offset_millis
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Instant {
        self.base + Duration::from_millis(self.offset_millis.load(Ordering::SeqCst))
    }
}

/// Shared handle to a clock, cheap to clone into every long-lived component.
pub type SharedClock = Arc<dyn Clock>;

pub fn monotonic() -> SharedClock {
    Arc::new(MonotonicClock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_clock_only_advances_when_told() {
        let clock = VirtualClock::new();
        let t0 = clock.now();
        assert_eq!(clock.now(), t0);

        clock.advance(Duration::from_secs(60));
        assert_eq!(clock.now(), t0 + Duration::from_secs(60));
    }

    #[test]
    fn virtual_clock_clones_share_state() {
        let clock = VirtualClock::new();
        let clone = clock.clone();
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now(), clone.now());
    }

    #[test]
    fn monotonic_clock_moves_forward() {
        let clock = MonotonicClock;
        let t0 = clock.now();
        std::thread::sleep(Duration::from_millis(1));
        assert!(clock.now() >= t0);
    }
}
