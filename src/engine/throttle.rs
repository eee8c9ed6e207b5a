//! Rate throttles for objects and bytes
//!
//! A throttle hands out permits at a fixed rate. Callers reserve permits
//! against the next free instant and sleep until their reservation starts,
//! so a large request delays whoever comes after it rather than itself.

use parking_lot::Mutex;
use std::thread;
use std::time::{Duration, Instant};
use tracing::trace;

/// Longest single reservation, whatever the permit count
const MAX_RESERVATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Waits are sliced so a cancelled run is noticed promptly
const WAIT_SLICE: Duration = Duration::from_millis(100);

pub struct Throttle {
    name: &'static str,
    /// Permits per second
    rate: f64,
    next_free: Mutex<Instant>,
}

impl Throttle {
    /// A throttle releasing `rate` permits per second
    pub fn new(name: &'static str, rate: f64) -> Self {
        Self {
            name,
            rate: rate.max(f64::MIN_POSITIVE),
            next_free: Mutex::new(Instant::now()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Reserve `permits` and return how long the caller must wait for them
    pub fn reserve(&self, permits: u64) -> Duration {
        let cost = Duration::try_from_secs_f64(permits as f64 / self.rate)
            .unwrap_or(MAX_RESERVATION)
            .min(MAX_RESERVATION);

        let mut next_free = self.next_free.lock();
        let now = Instant::now();
        let start = (*next_free).max(now);
        *next_free = start + cost;
        start - now
    }

    /// Block until `permits` are available
    ///
    /// Gives up early, returning false, once `keep_waiting` says so.
    pub fn acquire_while(&self, permits: u64, keep_waiting: impl Fn() -> bool) -> bool {
        let wait = self.reserve(permits);
        if wait.is_zero() {
            return true;
        }

        trace!(throttle = self.name, permits, wait_ms = wait.as_millis() as u64, "Throttled");
        let deadline = Instant::now() + wait;
        loop {
            if !keep_waiting() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(WAIT_SLICE));
        }
    }
}

impl std::fmt::Debug for Throttle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttle")
            .field("name", &self.name)
            .field("rate", &self.rate)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_request_is_free() {
        let throttle = Throttle::new("objects", 100.0);
        assert_eq!(throttle.reserve(10), Duration::ZERO);

        // The next caller pays for the 10 permits taken before it
        let wait = throttle.reserve(1);
        assert!(wait > Duration::from_millis(80), "waited {:?}", wait);
        assert!(wait <= Duration::from_millis(100), "waited {:?}", wait);
    }

    #[test]
    fn test_reservations_accumulate() {
        let throttle = Throttle::new("objects", 20.0);
        let expected_ms = [0, 50, 100, 200, 400, 800, 850];
        let permits = [1, 1, 2, 4, 8, 1, 100];

        for (permits, expected) in permits.into_iter().zip(expected_ms) {
            let wait = throttle.reserve(permits).as_millis() as i64;
            assert!((wait - expected).abs() <= 5, "expected ~{}ms, got {}ms", expected, wait);
        }
    }

    #[test]
    fn test_acquire_paces_callers() {
        let throttle = Throttle::new("objects", 20.0);
        let start = Instant::now();
        for _ in 0..5 {
            assert!(throttle.acquire_while(1, || true));
        }
        // Four gaps of 50ms after the free first permit
        assert!(start.elapsed() >= Duration::from_millis(180));
    }

    #[test]
    fn test_acquire_gives_up_when_cancelled() {
        let throttle = Throttle::new("bytes", 1.0);
        throttle.reserve(60);

        let start = Instant::now();
        assert!(!throttle.acquire_while(1, || false));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_huge_request_is_capped() {
        let throttle = Throttle::new("bytes", 1.0);
        throttle.reserve(u64::MAX);
        assert!(throttle.reserve(0) <= MAX_RESERVATION);
    }

    #[test]
    fn test_non_positive_rate_is_clamped() {
        let throttle = Throttle::new("bytes", 0.0);
        assert!(throttle.rate() > 0.0);
        assert_eq!(throttle.reserve(1), Duration::ZERO);
    }
}
