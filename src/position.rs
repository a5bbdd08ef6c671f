//! Per-origin GPS position cache.
//!
//! Holds the latest known position for each radio origin, with receive time
//! and an update counter. Report acceptance consults this cache for
//! freshness; the cache is intentionally lost on restart (a stale persisted
//! fix is worse than none). Single writer (the radio dispatch path), many
//! readers.

use log::debug;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Latest position fix for one origin.
#[derive(Debug, Clone, Copy)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
    pub received_at: Instant,
    pub seen_count: u64,
}

#[derive(Default)]
pub struct PositionCache {
    positions: RwLock<HashMap<String, Position>>,
}

impl PositionCache {
    pub fn new() -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
        }
    }

    /// Record a fresh fix for an origin, replacing any previous record and
    /// bumping its counter.
    pub fn update(&self, origin: &str, lat: f64, lon: f64) {
        let mut map = self.positions.write().unwrap_or_else(|e| e.into_inner());
        let seen_count = map.get(origin).map(|p| p.seen_count + 1).unwrap_or(1);
        map.insert(
            origin.to_string(),
            Position {
                lat,
                lon,
                received_at: Instant::now(),
                seen_count,
            },
        );
        debug!("position: {} -> ({:.5}, {:.5})", origin, lat, lon);
    }

    /// Replace the cached record for an origin wholesale.
    pub fn put(&self, origin: &str, position: Position) {
        let mut map = self.positions.write().unwrap_or_else(|e| e.into_inner());
        map.insert(origin.to_string(), position);
    }

    pub fn get(&self, origin: &str) -> Option<Position> {
        let map = self.positions.read().unwrap_or_else(|e| e.into_inner());
        map.get(origin).copied()
    }

    /// Age of the latest fix for an origin, if any.
    pub fn age(&self, origin: &str) -> Option<Duration> {
        self.get(origin).map(|p| p.received_at.elapsed())
    }

    pub fn len(&self) -> usize {
        let map = self.positions.read().unwrap_or_else(|e| e.into_inner());
        map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All cached positions, most recently heard first.
    pub fn snapshot(&self) -> Vec<(String, Position)> {
        let map = self.positions.read().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<(String, Position)> =
            map.iter().map(|(k, v)| (k.clone(), *v)).collect();
        entries.sort_by(|a, b| b.1.received_at.cmp(&a.1.received_at));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_replaces_and_counts() {
        let cache = PositionCache::new();
        assert!(cache.get("!a1").is_none());
        cache.update("!a1", 4.6097, -74.0817);
        cache.update("!a1", 4.6100, -74.0820);
        let p = cache.get("!a1").unwrap();
        assert_eq!(p.seen_count, 2);
        assert!((p.lat - 4.6100).abs() < 1e-9);
    }

    #[test]
    fn age_reflects_receive_time() {
        let cache = PositionCache::new();
        cache.update("!a1", 1.0, 2.0);
        assert!(cache.age("!a1").unwrap() < Duration::from_secs(1));
        assert!(cache.age("!missing").is_none());
    }

    #[test]
    fn snapshot_orders_newest_first() {
        let cache = PositionCache::new();
        cache.update("!old", 1.0, 1.0);
        cache.update("!new", 2.0, 2.0);
        let snap = cache.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].0, "!new");
    }
}
