//! Ingress duplicate suppression.
//!
//! The upstream EA can post the same lifecycle event twice in quick
//! succession (trade-transaction hook plus polling, or plain retries). Events
//! whose (kind, ticket, symbol) key was seen inside the window are dropped;
//! the HTTP layer still answers success so the EA does not retry.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::events::EventKind;

pub const DEDUP_WINDOW: Duration = Duration::from_millis(1500);

/// Prune lazily once the table grows past this many keys.
const PRUNE_THRESHOLD: usize = 2000;

pub struct DedupFilter {
    window: Duration,
    seen: Mutex<HashMap<(EventKind, i64, String), Instant>>,
}

impl DedupFilter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true when the event is a duplicate inside the window.
    /// First sightings (and re-sightings outside the window) are recorded.
    pub fn should_drop(&self, kind: EventKind, ticket: i64, symbol: &str) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock().unwrap();

        if seen.len() > PRUNE_THRESHOLD {
            let cutoff = self.window * 4;
            seen.retain(|_, last| now.duration_since(*last) < cutoff);
        }

        let key = (kind, ticket, symbol.to_string());
        if let Some(last) = seen.get(&key) {
            if now.duration_since(*last) < self.window {
                return true;
            }
        }
        seen.insert(key, now);
        false
    }
}

impl Default for DedupFilter {
    fn default() -> Self {
        Self::new(DEDUP_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_event_passes() {
        let filter = DedupFilter::default();
        assert!(!filter.should_drop(EventKind::Open, 1001, "EURUSD"));
    }

    #[test]
    fn test_duplicate_inside_window_dropped() {
        let filter = DedupFilter::default();
        assert!(!filter.should_drop(EventKind::Open, 1001, "EURUSD"));
        assert!(filter.should_drop(EventKind::Open, 1001, "EURUSD"));
    }

    #[test]
    fn test_different_keys_are_independent() {
        let filter = DedupFilter::default();
        assert!(!filter.should_drop(EventKind::Open, 1001, "EURUSD"));
        assert!(!filter.should_drop(EventKind::Close, 1001, "EURUSD"));
        assert!(!filter.should_drop(EventKind::Open, 1002, "EURUSD"));
        assert!(!filter.should_drop(EventKind::Open, 1001, "GBPUSD"));
    }

    #[test]
    fn test_event_outside_window_passes() {
        let filter = DedupFilter::new(Duration::from_millis(10));
        assert!(!filter.should_drop(EventKind::Open, 1001, "EURUSD"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!filter.should_drop(EventKind::Open, 1001, "EURUSD"));
    }
}
