//! Duplicate suppression for broadcast spots.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::spot::{Spot, SpotKind};

/// Key identifying logically identical spots.
///
/// Digital spots are keyed on callsign, band and mode. CW and cluster spots
/// are keyed on callsign, band and frequency (kHz), so a station moving
/// within a band is reported again.
pub fn dedup_key(kind: SpotKind, spot: &Spot) -> String {
    match kind {
        SpotKind::DigitalSpot => format!("{}|{}|{}", spot.callsign, spot.band, spot.mode),
        SpotKind::CwSpot | SpotKind::DxSpot => format!(
            "{}|{}|{}",
            spot.callsign,
            spot.band,
            (spot.frequency_hz + 500) / 1000
        ),
    }
}

/// Last-broadcast times per key.
#[derive(Debug)]
pub struct DedupCache {
    window: Duration,
    entries: HashMap<String, Instant>,
}

impl DedupCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: HashMap::new(),
        }
    }

    /// Record `key` as broadcast at `now` unless it is still fresh.
    ///
    /// Returns `true` when the event should be broadcast.
    pub fn check_and_insert(&mut self, key: String, now: Instant) -> bool {
        match self.entries.get(&key) {
            Some(&last) if now.saturating_duration_since(last) < self.window => false,
            _ => {
                self.entries.insert(key, now);
                true
            }
        }
    }

    /// Drop entries older than `max_age`. Returns how many were removed.
    pub fn sweep(&mut self, now: Instant, max_age: Duration) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, last| now.saturating_duration_since(*last) <= max_age);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spot::Mode;
    use chrono::Utc;

    #[test]
    fn test_keys() {
        let ft8 = Spot::new(Mode::Ft8, "K1ABC", 14_075_234, -3, Utc::now());
        let moved = Spot::new(Mode::Ft8, "K1ABC", 14_073_900, -8, Utc::now());
        assert_eq!(
            dedup_key(SpotKind::DigitalSpot, &ft8),
            dedup_key(SpotKind::DigitalSpot, &moved)
        );
        assert_ne!(
            dedup_key(SpotKind::CwSpot, &ft8),
            dedup_key(SpotKind::CwSpot, &moved)
        );
        assert_eq!(dedup_key(SpotKind::CwSpot, &ft8), "K1ABC|20m|14075");
    }

    #[test]
    fn test_window() {
        let mut cache = DedupCache::new(Duration::from_secs(120));
        let t0 = Instant::now();
        assert!(cache.check_and_insert("a".into(), t0));
        assert!(!cache.check_and_insert("a".into(), t0 + Duration::from_secs(119)));
        assert!(cache.check_and_insert("b".into(), t0 + Duration::from_secs(1)));
        // Suppressed events do not extend the window.
        assert!(cache.check_and_insert("a".into(), t0 + Duration::from_secs(120)));
    }

    #[test]
    fn test_sweep() {
        let mut cache = DedupCache::new(Duration::from_secs(120));
        let t0 = Instant::now();
        cache.check_and_insert("old".into(), t0);
        cache.check_and_insert("new".into(), t0 + Duration::from_secs(100));
        let removed = cache.sweep(t0 + Duration::from_secs(151), Duration::from_secs(150));
        assert_eq!(removed, 1);
        assert_eq!(cache.len(), 1);
    }
}
