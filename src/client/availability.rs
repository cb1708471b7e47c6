//! Server availability and compatibility tracking on the client.
//!
//! After a stream failure the server is considered unavailable for a back-off
//! window that doubles with every consecutive failure, bounded by
//! [`RetryConfig`]. A success resets the window. A protocol version mismatch
//! marks the server address incompatible for the rest of the process and is
//! counted separately; incompatible servers are never retried.

use crate::core::config::RetryConfig;
use hashbrown::HashSet;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Window {
    unavailable_until: Option<Instant>,
    backoff: Duration,
    consecutive_failures: u32,
}

#[derive(Debug)]
pub struct ServerAvailability {
    retry: RetryConfig,
    window: Mutex<Window>,
    incompatible: Mutex<HashSet<String>>,
    incompatibilities: AtomicU32,
}

impl ServerAvailability {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            retry,
            window: Mutex::new(Window::default()),
            incompatible: Mutex::new(HashSet::new()),
            incompatibilities: AtomicU32::new(0),
        }
    }

    /// Whether a connection attempt is allowed at `now`.
    pub fn is_available(&self, now: Instant) -> bool {
        self.window
            .lock()
            .unavailable_until
            .map_or(true, |until| now >= until)
    }

    /// Record a stream failure; returns the back-off window now in force.
    pub fn record_failure(&self, now: Instant) -> Duration {
        let mut window = self.window.lock();
        window.consecutive_failures += 1;
        window.backoff = if window.backoff.is_zero() {
            self.retry.min_backoff
        } else {
            (window.backoff * 2).min(self.retry.max_backoff)
        };
        window.unavailable_until = Some(now + window.backoff);
        log::warn!(
            "server unavailable for {:?} after {} consecutive failures",
            window.backoff,
            window.consecutive_failures
        );
        window.backoff
    }

    pub fn record_success(&self) {
        let mut window = self.window.lock();
        if window.consecutive_failures > 0 {
            log::info!("server available again");
        }
        *window = Window::default();
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.window.lock().consecutive_failures
    }

    /// Mark `address` incompatible and count the mismatch; returns the new count.
    pub fn record_incompatibility(&self, address: &str) -> u32 {
        self.incompatible.lock().insert(address.to_string());
        let count = self.incompatibilities.fetch_add(1, Ordering::AcqRel) + 1;
        log::warn!("server {} speaks an incompatible protocol ({} mismatches)", address, count);
        count
    }

    pub fn is_compatible(&self, address: &str) -> bool {
        !self.incompatible.lock().contains(address)
    }

    pub fn incompatibility_count(&self) -> u32 {
        self.incompatibilities.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn availability() -> ServerAvailability {
        ServerAvailability::new(
            RetryConfig::default().with_backoff(Duration::from_millis(100), Duration::from_millis(350)),
        )
    }

    #[test]
    fn test_backoff_doubles_and_is_bounded() {
        let a = availability();
        let now = Instant::now();
        assert!(a.is_available(now));
        assert_eq!(a.record_failure(now), Duration::from_millis(100));
        assert!(!a.is_available(now + Duration::from_millis(50)));
        assert!(a.is_available(now + Duration::from_millis(100)));
        assert_eq!(a.record_failure(now), Duration::from_millis(200));
        assert_eq!(a.record_failure(now), Duration::from_millis(350));
        assert_eq!(a.consecutive_failures(), 3);

        a.record_success();
        assert!(a.is_available(now));
        assert_eq!(a.record_failure(now), Duration::from_millis(100));
    }

    #[test]
    fn test_incompatibility_is_sticky() {
        let a = availability();
        assert!(a.is_compatible("host:1"));
        assert_eq!(a.record_incompatibility("host:1"), 1);
        assert!(!a.is_compatible("host:1"));
        assert!(a.is_compatible("host:2"));
        a.record_success();
        assert!(!a.is_compatible("host:1"));
        assert_eq!(a.incompatibility_count(), 1);
    }
}
