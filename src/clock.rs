//! Time source for visibility timeouts
//!
//! Queue timestamps are Unix milliseconds so they can be persisted as-is.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A clock that provides the current time in Unix milliseconds
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// Real system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        now_millis()
    }
}

/// Manually driven clock for tests
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<AtomicU64>,
}

impl ManualClock {
    /// Start the clock at the given Unix millisecond timestamp
    pub fn new(start_millis: u64) -> Self {
        Self {
            current: Arc::new(AtomicU64::new(start_millis)),
        }
    }

    /// Advance the clock by the given duration
    pub fn advance(&self, duration: Duration) {
        self.current
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(1_700_000_000_000)
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }
}

/// Current time in Unix milliseconds
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new(1_000);
        clock.advance(Duration::from_secs(30));
        assert_eq!(clock.now_millis(), 31_000);

        let shared = clock.clone();
        shared.advance(Duration::from_millis(5));
        assert_eq!(clock.now_millis(), 31_005);
    }

    #[test]
    fn test_system_clock_is_recent() {
        assert!(SystemClock.now_millis() > 1_700_000_000_000);
    }
}
