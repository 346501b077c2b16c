//! Expiring map with tag invalidation.
//!
//! Entries live until their TTL elapses on a [`Clock`] or until a tag they
//! carry is invalidated. A `tag → keys` index keeps tag invalidation
//! proportional to the number of entries carrying the tag.
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

/// Cleared whenever a project file is saved or re-indexed.
pub const TAG_PROJECT: &str = "project";
/// Cleared when the language-server connection is re-established.
pub const TAG_LSP: &str = "lsp";

/// Monotonic time source, measured from an arbitrary origin.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Entry<V> {
    value: V,
    expires_at: Duration,
    tags: Vec<String>,
}

const MIN_PURGE_AT: usize = 64;

struct Inner<K, V> {
    entries: HashMap<K, Entry<V>>,
    by_tag: HashMap<String, HashSet<K>>,
    /// Bumped by every invalidation of the tag.
    generations: HashMap<String, u64>,
    /// Bumped by `clear`.
    epoch: u64,
    /// Entry count at which the next insert purges expired entries.
    purge_at: usize,
}

impl<K: Eq + Hash + Clone, V> Inner<K, V> {
    fn unlink(&mut self, key: &K, tags: &[String]) {
        for tag in tags {
            if let Some(keys) = self.by_tag.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
    }

    fn take(&mut self, key: &K) -> Option<Entry<V>> {
        let entry = self.entries.remove(key)?;
        self.unlink(key, &entry.tags);
        Some(entry)
    }

    fn snapshot(&self, tags: &[&str]) -> (u64, Vec<u64>) {
        let generations = tags
            .iter()
            .map(|t| self.generations.get(*t).copied().unwrap_or(0))
            .collect();
        (self.epoch, generations)
    }

    fn purge_expired(&mut self, now: Duration) -> usize {
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, e)| now >= e.expires_at)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.take(key);
        }
        self.purge_at = (self.entries.len() * 2).max(MIN_PURGE_AT);
        expired.len()
    }

    fn store(&mut self, key: K, value: V, expires_at: Duration, tags: Vec<String>, now: Duration) {
        self.take(&key);
        if self.entries.len() >= self.purge_at {
            self.purge_expired(now);
        }
        for tag in &tags {
            self.by_tag.entry(tag.clone()).or_default().insert(key.clone());
        }
        self.entries.insert(
            key,
            Entry {
                value,
                expires_at,
                tags,
            },
        );
    }
}

pub struct TtlCache<K, V, C: Clock = MonotonicClock> {
    inner: Mutex<Inner<K, V>>,
    clock: C,
}

impl<K, V> TtlCache<K, V, MonotonicClock>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::with_clock(MonotonicClock::new())
    }
}

impl<K, V> Default for TtlCache<K, V, MonotonicClock>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, C> TtlCache<K, V, C>
where
    K: Eq + Hash + Clone,
    V: Clone,
    C: Clock,
{
    pub fn with_clock(clock: C) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                by_tag: HashMap::new(),
                generations: HashMap::new(),
                epoch: 0,
                purge_at: MIN_PURGE_AT,
            }),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K, V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The value, if present and not yet expired.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let mut inner = self.lock();
        match inner.entries.get(key) {
            Some(entry) if now < entry.expires_at => Some(entry.value.clone()),
            Some(_) => {
                inner.take(key);
                None
            }
            None => None,
        }
    }

    /// Insert or replace. A zero TTL stores nothing visible.
    pub fn insert(&self, key: K, value: V, ttl: Duration, tags: &[&str]) {
        let now = self.clock.now();
        let owned: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
        self.lock().store(key, value, now.saturating_add(ttl), owned, now);
    }

    /// Insert unless one of `tags` was invalidated, or the cache cleared,
    /// since `snapshot` was taken. Returns whether the value was stored.
    fn insert_if_current(
        &self,
        key: K,
        value: V,
        ttl: Duration,
        tags: &[&str],
        snapshot: &(u64, Vec<u64>),
    ) -> bool {
        let now = self.clock.now();
        let mut inner = self.lock();
        if inner.snapshot(tags) != *snapshot {
            debug!("cache: dropped a value loaded before an invalidation");
            return false;
        }
        let owned: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
        inner.store(key, value, now.saturating_add(ttl), owned, now);
        true
    }

    pub fn get_or_insert_with(
        &self,
        key: K,
        ttl: Duration,
        tags: &[&str],
        f: impl FnOnce() -> V,
    ) -> V {
        if let Some(value) = self.get(&key) {
            return value;
        }
        let snapshot = self.lock().snapshot(tags);
        let value = f();
        self.insert_if_current(key, value.clone(), ttl, tags, &snapshot);
        value
    }

    /// Like [`get_or_insert_with`](Self::get_or_insert_with) for fallible
    /// loaders. Errors are returned and nothing is cached. The loader runs
    /// without holding the cache lock; its value is returned but not cached
    /// when one of `tags` is invalidated while it runs.
    pub fn get_or_try_insert_with<E>(
        &self,
        key: K,
        ttl: Duration,
        tags: &[&str],
        f: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let snapshot = self.lock().snapshot(tags);
        let value = f()?;
        self.insert_if_current(key, value.clone(), ttl, tags, &snapshot);
        Ok(value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let entry = self.lock().take(key)?;
        (now < entry.expires_at).then_some(entry.value)
    }

    /// Drop every entry carrying `tag`. Returns how many were dropped.
    pub fn invalidate_tag(&self, tag: &str) -> usize {
        let mut inner = self.lock();
        *inner.generations.entry(tag.to_string()).or_default() += 1;
        let Some(keys) = inner.by_tag.remove(tag) else {
            return 0;
        };
        let mut dropped = 0;
        for key in keys {
            if inner.take(&key).is_some() {
                dropped += 1;
            }
        }
        debug!("cache: invalidated {dropped} entries tagged {tag}");
        dropped
    }

    /// Drop expired entries. Returns how many were dropped.
    /// Inserts also purge once the map has doubled since the last purge.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        self.lock().purge_expired(now)
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.lock()
            .entries
            .values()
            .filter(|e| now < e.expires_at)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.by_tag.clear();
        inner.epoch += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: Duration = Duration::from_secs(60);

    fn cache() -> (TtlCache<String, i32, ManualClock>, ManualClock) {
        let clock = ManualClock::new();
        (TtlCache::with_clock(clock.clone()), clock)
    }

    #[test]
    fn test_entries_expire() {
        let (cache, clock) = cache();
        cache.insert("a".into(), 1, MIN, &[]);
        assert_eq!(cache.get(&"a".to_string()), Some(1));

        clock.advance(Duration::from_secs(59));
        assert_eq!(cache.get(&"a".to_string()), Some(1));

        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.get(&"a".to_string()), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_zero_ttl_is_never_visible() {
        let (cache, _) = cache();
        cache.insert("a".into(), 1, Duration::ZERO, &[TAG_PROJECT]);
        assert_eq!(cache.get(&"a".to_string()), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_invalidate_tag() {
        let (cache, _) = cache();
        cache.insert("p1".into(), 1, MIN, &[TAG_PROJECT]);
        cache.insert("p2".into(), 2, MIN, &[TAG_PROJECT, TAG_LSP]);
        cache.insert("l1".into(), 3, MIN, &[TAG_LSP]);
        cache.insert("free".into(), 4, MIN, &[]);

        assert_eq!(cache.invalidate_tag(TAG_PROJECT), 2);
        assert_eq!(cache.get(&"p1".to_string()), None);
        assert_eq!(cache.get(&"p2".to_string()), None);
        assert_eq!(cache.get(&"l1".to_string()), Some(3));
        assert_eq!(cache.get(&"free".to_string()), Some(4));

        // p2 was unlinked from the lsp tag as well
        assert_eq!(cache.invalidate_tag(TAG_LSP), 1);
        assert_eq!(cache.invalidate_tag("unknown"), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_replacing_entry_resets_tags() {
        let (cache, _) = cache();
        cache.insert("k".into(), 1, MIN, &[TAG_PROJECT]);
        cache.insert("k".into(), 2, MIN, &[TAG_LSP]);
        assert_eq!(cache.invalidate_tag(TAG_PROJECT), 0);
        assert_eq!(cache.get(&"k".to_string()), Some(2));
    }

    #[test]
    fn test_get_or_insert_with() {
        let (cache, clock) = cache();
        let mut calls = 0;
        let v = cache.get_or_insert_with("k".into(), MIN, &[], || {
            calls += 1;
            7
        });
        assert_eq!(v, 7);
        let v = cache.get_or_insert_with("k".into(), MIN, &[], || {
            calls += 1;
            8
        });
        assert_eq!(v, 7);
        assert_eq!(calls, 1);

        clock.advance(MIN);
        let v = cache.get_or_insert_with("k".into(), MIN, &[], || 9);
        assert_eq!(v, 9);
    }

    #[test]
    fn test_failed_loader_is_not_cached() {
        let (cache, _) = cache();
        let err: Result<i32, &str> = cache.get_or_try_insert_with("k".into(), MIN, &[], || Err("down"));
        assert_eq!(err, Err("down"));
        assert!(cache.is_empty());
        let ok: Result<i32, &str> = cache.get_or_try_insert_with("k".into(), MIN, &[], || Ok(5));
        assert_eq!(ok, Ok(5));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_value_loaded_across_invalidation_is_not_cached() {
        let (cache, _) = cache();
        let loaded: Result<i32, &str> = cache.get_or_try_insert_with("k".into(), MIN, &[TAG_PROJECT], || {
            cache.invalidate_tag(TAG_PROJECT);
            Ok(1)
        });
        assert_eq!(loaded, Ok(1));
        assert_eq!(cache.get(&"k".to_string()), None);

        let v = cache.get_or_insert_with("k".into(), MIN, &[TAG_PROJECT], || {
            cache.clear();
            2
        });
        assert_eq!(v, 2);
        assert_eq!(cache.get(&"k".to_string()), None);

        // Invalidating an unrelated tag does not matter.
        let v = cache.get_or_insert_with("k".into(), MIN, &[TAG_PROJECT], || {
            cache.invalidate_tag(TAG_LSP);
            3
        });
        assert_eq!(v, 3);
        assert_eq!(cache.get(&"k".to_string()), Some(3));
    }

    #[test]
    fn test_inserts_purge_expired_entries() {
        let (cache, clock) = cache();
        for i in 0..MIN_PURGE_AT {
            cache.insert(format!("old{i}"), 0, Duration::from_secs(1), &[TAG_LSP]);
        }
        clock.advance(Duration::from_secs(2));
        cache.insert("fresh".into(), 1, MIN, &[]);

        let inner = cache.lock();
        assert_eq!(inner.entries.len(), 1);
        assert!(inner.by_tag.get(TAG_LSP).is_none());
    }

    #[test]
    fn test_remove_and_purge() {
        let (cache, clock) = cache();
        cache.insert("short".into(), 1, Duration::from_secs(1), &[TAG_PROJECT]);
        cache.insert("long".into(), 2, MIN, &[TAG_PROJECT]);
        cache.insert("gone".into(), 3, MIN, &[]);

        assert_eq!(cache.remove(&"gone".to_string()), Some(3));
        assert_eq!(cache.remove(&"gone".to_string()), None);

        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.invalidate_tag(TAG_PROJECT), 1);

        cache.insert("x".into(), 1, MIN, &[]);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_monotonic_clock_moves_forward() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
        let cache: TtlCache<u32, u32> = TtlCache::new();
        cache.insert(1, 1, MIN, &[]);
        assert_eq!(cache.get(&1), Some(1));
    }
}
