//! Per-correlation-id outbound throughput.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::lock;

/// Width of the sliding rate window.
const WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct Entry {
    connections: usize,
    total_bytes: u64,
    /// (time, bytes) per write inside the window
    samples: VecDeque<(Instant, u64)>,
}

impl Entry {
    fn trim(&mut self, now: Instant) {
        while self
            .samples
            .front()
            .is_some_and(|(t, _)| now.saturating_duration_since(*t) > WINDOW)
        {
            self.samples.pop_front();
        }
    }

    fn rate(&self, now: Instant) -> f64 {
        let bytes: u64 = self
            .samples
            .iter()
            .filter(|(t, _)| now.saturating_duration_since(*t) <= WINDOW)
            .map(|(_, b)| b)
            .sum();
        bytes as f64 / WINDOW.as_secs_f64()
    }
}

/// Tracks bytes sent per correlation id. An id's entry lives as long as it
/// has at least one connection.
#[derive(Debug, Default)]
pub struct ThroughputTracker {
    entries: Mutex<HashMap<String, Entry>>,
}

impl ThroughputTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connection with this id appeared.
    pub fn attach(&self, id: &str) {
        lock(&self.entries)
            .entry(id.to_string())
            .or_default()
            .connections += 1;
    }

    /// A connection with this id went away.
    pub fn detach(&self, id: &str) {
        let mut entries = lock(&self.entries);
        if let Some(entry) = entries.get_mut(id) {
            entry.connections = entry.connections.saturating_sub(1);
            if entry.connections == 0 {
                entries.remove(id);
            }
        }
    }

    /// Count `bytes` sent to `id`.
    pub fn record(&self, id: &str, bytes: usize) {
        self.record_at(id, bytes, Instant::now());
    }

    fn record_at(&self, id: &str, bytes: usize, now: Instant) {
        if let Some(entry) = lock(&self.entries).get_mut(id) {
            entry.total_bytes += bytes as u64;
            entry.samples.push_back((now, bytes as u64));
            entry.trim(now);
        }
    }

    /// Bytes/sec over the last second for every tracked id.
    pub fn rates(&self) -> HashMap<String, f64> {
        self.rates_at(Instant::now())
    }

    fn rates_at(&self, now: Instant) -> HashMap<String, f64> {
        lock(&self.entries)
            .iter()
            .map(|(id, e)| (id.clone(), e.rate(now)))
            .collect()
    }

    /// Total bytes sent to `id` since its first connection.
    pub fn total_bytes(&self, id: &str) -> Option<u64> {
        lock(&self.entries).get(id).map(|e| e.total_bytes)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_lives_while_connected() {
        let tracker = ThroughputTracker::new();
        tracker.attach("tab-1");
        tracker.attach("tab-1");
        tracker.record("tab-1", 100);
        tracker.detach("tab-1");
        assert_eq!(tracker.total_bytes("tab-1"), Some(100));
        tracker.detach("tab-1");
        assert!(tracker.is_empty());

        // Unknown ids are ignored.
        tracker.record("ghost", 10);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_rate_over_window() {
        let tracker = ThroughputTracker::new();
        tracker.attach("a");
        let t0 = Instant::now();
        tracker.record_at("a", 1000, t0);
        tracker.record_at("a", 1000, t0 + Duration::from_millis(500));
        let rate = tracker.rates_at(t0 + Duration::from_millis(500))["a"];
        assert!((rate - 2000.0).abs() < 1e-6, "rate {}", rate);

        // Writes older than the window fall out.
        tracker.record_at("a", 500, t0 + Duration::from_millis(2000));
        let rate = tracker.rates_at(t0 + Duration::from_millis(2000))["a"];
        assert!((rate - 500.0).abs() < 1e-6, "rate {}", rate);
        assert_eq!(tracker.total_bytes("a"), Some(2500));

        let idle = tracker.rates_at(t0 + Duration::from_millis(5000))["a"];
        assert_eq!(idle, 0.0);
    }

    #[test]
    fn test_keeps_counting_after_poisoned_lock() {
        let tracker = std::sync::Arc::new(ThroughputTracker::new());
        tracker.attach("a");

        let poisoner = std::sync::Arc::clone(&tracker);
        let result = std::thread::spawn(move || {
            let _guard = poisoner.entries.lock().unwrap();
            panic!("holder panicked");
        })
        .join();
        assert!(result.is_err());
        assert!(tracker.entries.is_poisoned());

        tracker.attach("b");
        tracker.record("a", 100);
        tracker.record("b", 50);
        assert_eq!(tracker.len(), 2);
        assert_eq!(tracker.total_bytes("a"), Some(100));
        assert_eq!(tracker.rates()["b"], 50.0);
        tracker.detach("b");
        assert_eq!(tracker.total_bytes("b"), None);
    }
}
