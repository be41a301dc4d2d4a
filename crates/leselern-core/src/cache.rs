//! Kleiner TTL-Cache mit injizierter Uhr, ohne globalen Zustand.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use time::{Duration, OffsetDateTime};

use crate::clock::Clock;

/// Schlüssel-Wert-Cache, dessen Einträge nach `ttl` verfallen.
///
/// Eine TTL von null deaktiviert den Cache vollständig. Abgelaufene Einträge
/// werden beim Einfügen höchstens einmal pro TTL weggeräumt, der Cache hält
/// also nur Schlüssel der letzten zwei TTL-Perioden.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner<K, V>>,
}

#[derive(Debug)]
struct Inner<K, V> {
    entries: HashMap<K, (V, OffsetDateTime)>,
    next_sweep: Option<OffsetDateTime>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                next_sweep: None,
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner<K, V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_enabled(&self) -> bool {
        self.ttl.is_positive()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        if !self.is_enabled() {
            return None;
        }
        let now = self.clock.now();
        let mut inner = self.inner();
        match inner.entries.get(key) {
            Some((value, expires)) if *expires > now => Some(value.clone()),
            Some(_) => {
                inner.entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: K, value: V) {
        if !self.is_enabled() {
            return;
        }
        let now = self.clock.now();
        let mut inner = self.inner();
        if inner.next_sweep.map_or(true, |at| now >= at) {
            inner.entries.retain(|_, (_, expires)| *expires > now);
            inner.next_sweep = Some(now + self.ttl);
        }
        inner.entries.insert(key, (value, now + self.ttl));
    }

    pub fn invalidate(&self, key: &K) {
        self.inner().entries.remove(key);
    }

    pub fn invalidate_where(&self, mut pred: impl FnMut(&K) -> bool) {
        self.inner().entries.retain(|k, _| !pred(k));
    }

    pub fn clear(&self) {
        self.inner().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use time::macros::datetime;

    fn cache(ttl: Duration) -> (Arc<FixedClock>, TtlCache<String, u32>) {
        let clock = Arc::new(FixedClock::new(datetime!(2024-01-01 12:00 UTC)));
        let cache = TtlCache::new(ttl, clock.clone());
        (clock, cache)
    }

    #[test]
    fn entries_expire_after_ttl() {
        let (clock, cache) = cache(Duration::seconds(30));
        cache.insert("a".into(), 1);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        clock.advance(Duration::seconds(31));
        assert_eq!(cache.get(&"a".to_string()), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn zero_ttl_disables_cache() {
        let (_clock, cache) = cache(Duration::ZERO);
        cache.insert("a".into(), 1);
        assert_eq!(cache.get(&"a".to_string()), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn insert_sweeps_expired_keys() {
        let (clock, cache) = cache(Duration::seconds(30));
        for i in 0..1_000 {
            cache.insert(format!("reader-{i}"), i);
        }
        assert_eq!(cache.len(), 1_000);

        clock.advance(Duration::hours(24));
        cache.insert("late".into(), 7);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"late".to_string()), Some(7));
    }

    #[test]
    fn sweep_keeps_live_entries() {
        let (clock, cache) = cache(Duration::seconds(30));
        cache.insert("old".into(), 1);
        clock.advance(Duration::seconds(20));
        cache.insert("fresh".into(), 2);
        clock.advance(Duration::seconds(15));
        // "old" is expired, "fresh" still has 15 s left.
        cache.insert("newest".into(), 3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"fresh".to_string()), Some(2));
        assert_eq!(cache.get(&"old".to_string()), None);
    }

    #[test]
    fn invalidate_where_drops_matching_keys() {
        let (_clock, cache) = cache(Duration::minutes(1));
        cache.insert("anon:a".into(), 1);
        cache.insert("anon:b".into(), 2);
        cache.insert("user:a".into(), 3);
        cache.invalidate_where(|k| k.starts_with("anon:"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"user:a".to_string()), Some(3));
    }
}
