//! Stats cache keyed by exact period

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::usage::models::{Period, Stats};

/// Default lifetime of a cached entry
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

const DEFAULT_MAX_ENTRIES: usize = 256;

/// Advisory cache for computed stats.
///
/// Implementations must be safe to share between concurrent queries and
/// must report failures as a miss.
pub trait StatsCache: Send + Sync {
    fn get(&self, period: &Period) -> Option<Stats>;
    fn set(&self, period: Period, stats: Stats);
}

/// Cache that never hits
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpStatsCache;

impl StatsCache for NoOpStatsCache {
    fn get(&self, _period: &Period) -> Option<Stats> {
        None
    }

    fn set(&self, _period: Period, _stats: Stats) {}
}

#[derive(Debug, Clone)]
struct CacheEntry {
    stats: Stats,
    stored_at: Instant,
}

/// In-memory cache with a per-entry TTL and a bounded entry count
#[derive(Debug)]
pub struct MemoryStatsCache {
    entries: Mutex<HashMap<Period, CacheEntry>>,
    ttl: Duration,
    max_entries: usize,
}

impl MemoryStatsCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_capacity(ttl, DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .map(|entries| entries.values().filter(|e| e.stored_at.elapsed() < self.ttl).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStatsCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

impl StatsCache for MemoryStatsCache {
    fn get(&self, period: &Period) -> Option<Stats> {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(_) => {
                log::warn!("Stats cache lock poisoned, treating as miss");
                return None;
            }
        };

        match entries.get(period) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(entry.stats.clone()),
            Some(_) => {
                entries.remove(period);
                None
            }
            None => None,
        }
    }

    fn set(&self, period: Period, stats: Stats) {
        let Ok(mut entries) = self.entries.lock() else {
            log::warn!("Stats cache lock poisoned, skipping store");
            return;
        };

        let ttl = self.ttl;
        entries.retain(|_, entry| entry.stored_at.elapsed() < ttl);

        if entries.len() >= self.max_entries && !entries.contains_key(&period) {
            // Drop the oldest entry to make room
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.stored_at)
                .map(|(key, _)| *key)
            {
                entries.remove(&oldest);
            }
        }

        entries.insert(
            period,
            CacheEntry {
                stats,
                stored_at: Instant::now(),
            },
        );
    }
}
