use super::DimensionEntry;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::{Duration, SystemTime},
};
use tracing::debug;

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }

    pub fn set(&self, to: SystemTime) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Natural image sizes keyed by source URL, shared by every cell and packer of a
/// gallery. Entries expire lazily: an expired entry is dropped the next time it is read.
///
/// Each writer only ever touches its own `src` key, so a plain lock around the map is
/// all the coordination needed.
#[derive(Clone)]
pub struct DimensionCache {
    entries: Arc<RwLock<HashMap<String, DimensionEntry>>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl DimensionCache {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
            clock,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, src: &str) -> Option<DimensionEntry> {
        let now = self.clock.now();

        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            match entries.get(src) {
                None => return None,
                Some(entry) if !self.is_expired(entry, now) => return Some(*entry),
                Some(_) => {}
            }
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        // Another writer may have refreshed the key between the two locks
        if let Some(entry) = entries.get(src)
            && !self.is_expired(entry, now)
        {
            return Some(*entry);
        }
        if entries.remove(src).is_some() {
            debug!("Evicted expired dimensions for {}", src);
        }
        None
    }

    /// Records the natural size of `src`, replacing whatever was there. Zero-sized
    /// results carry no aspect ratio and are ignored.
    pub fn put(&self, src: &str, width: u32, height: u32) -> Option<DimensionEntry> {
        if width == 0 || height == 0 {
            debug!("Ignoring zero-sized dimensions for {}", src);
            return None;
        }

        let entry = DimensionEntry {
            width,
            height,
            aspect_ratio: height as f64 / width as f64,
            timestamp: self.clock.now(),
        };

        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(src.to_string(), entry);

        Some(entry)
    }

    pub fn contains(&self, src: &str) -> bool {
        self.get(src).is_some()
    }

    /// Number of stored entries, expired ones included until they are read.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live entries only; does not evict.
    pub fn snapshot(&self) -> HashMap<String, DimensionEntry> {
        let now = self.clock.now();
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, entry)| !self.is_expired(entry, now))
            .map(|(src, entry)| (src.clone(), *entry))
            .collect()
    }

    fn is_expired(&self, entry: &DimensionEntry, now: SystemTime) -> bool {
        // A clock that moved backwards leaves the entry fresh
        now.duration_since(entry.timestamp)
            .map(|age| age >= self.ttl)
            .unwrap_or(false)
    }
}

impl Default for DimensionCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manual_cache(ttl: Duration) -> (DimensionCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (DimensionCache::with_clock(ttl, clock.clone()), clock)
    }

    #[test]
    fn test_put_computes_aspect_ratio() {
        let (cache, _clock) = manual_cache(Duration::from_secs(60));
        let entry = cache.put("a.jpg", 1600, 1200).unwrap();

        assert_eq!(entry.aspect_ratio, 0.75);
        assert_eq!(cache.get("a.jpg"), Some(entry));
        assert!(cache.get("b.jpg").is_none());
    }

    #[test]
    fn test_entry_expires_at_ttl() {
        let ttl = Duration::from_secs(24 * 60 * 60);
        let (cache, clock) = manual_cache(ttl);
        cache.put("a.jpg", 100, 200);

        clock.advance(ttl - Duration::from_millis(1));
        assert!(cache.get("a.jpg").is_some(), "still fresh just before TTL");

        clock.advance(Duration::from_millis(1));
        assert!(cache.get("a.jpg").is_none(), "expired exactly at TTL");
        assert_eq!(cache.len(), 0, "expired entry evicted on read");
    }

    #[test]
    fn test_put_overwrites_and_refreshes() {
        let ttl = Duration::from_secs(10);
        let (cache, clock) = manual_cache(ttl);
        cache.put("a.jpg", 100, 100);

        clock.advance(Duration::from_secs(8));
        cache.put("a.jpg", 100, 150);

        clock.advance(Duration::from_secs(8));
        let entry = cache.get("a.jpg").expect("rewritten entry should be fresh");
        assert_eq!(entry.height, 150);
        assert_eq!(entry.aspect_ratio, 1.5);
    }

    #[test]
    fn test_zero_dimensions_ignored() {
        let (cache, _clock) = manual_cache(Duration::from_secs(10));
        assert!(cache.put("a.jpg", 0, 100).is_none());
        assert!(cache.put("a.jpg", 100, 0).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_snapshot_skips_expired_without_evicting() {
        let (cache, clock) = manual_cache(Duration::from_secs(10));
        cache.put("old.jpg", 10, 10);
        clock.advance(Duration::from_secs(20));
        cache.put("new.jpg", 10, 20);

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key("new.jpg"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_clones_share_entries() {
        let (cache, _clock) = manual_cache(Duration::from_secs(10));
        let other = cache.clone();
        other.put("a.jpg", 300, 200);
        assert!(cache.contains("a.jpg"));
    }
}
