//! Per-key spam suppression.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Minimum gap between two notifications with the same key.
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(30);

/// Keys idle for this many intervals are evicted by [`RateLimiter::prune`].
const STALE_FACTOR: u32 = 10;

/// Remembers when each key last fired.
pub struct RateLimiter {
    min_interval: Duration,
    last_fired: Mutex<HashMap<String, Instant>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_INTERVAL)
    }
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_fired: Mutex::new(HashMap::new()),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.last_fired.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true and records the fire time if `key` may fire now.
    pub fn should_notify(&self, key: &str) -> bool {
        self.should_notify_at(key, Instant::now())
    }

    pub fn should_notify_at(&self, key: &str, now: Instant) -> bool {
        let mut entries = self.entries();
        match entries.get(key) {
            Some(last) if now.saturating_duration_since(*last) < self.min_interval => false,
            _ => {
                entries.insert(key.to_string(), now);
                true
            }
        }
    }

    /// Evict keys that have not fired for several intervals.
    /// Returns the number of keys removed.
    pub fn prune(&self) -> usize {
        self.prune_at(Instant::now())
    }

    pub fn prune_at(&self, now: Instant) -> usize {
        let horizon = self.min_interval.saturating_mul(STALE_FACTOR);
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, last| now.saturating_duration_since(*last) < horizon);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
