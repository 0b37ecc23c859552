use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use crate::pending::{BatchResult, PendingResult};

/// Derives the cache key used for deduplication from a load key.
pub type CacheKeyFn<K, C> = Arc<dyn Fn(&K) -> C + Send + Sync>;

/// `(new_cache_key, existing_cache_key) -> bool`: whether a new request can be served by an
/// existing entry.
pub type CacheKeyMatchFn<C> = Arc<dyn Fn(&C, &C) -> bool + Send + Sync>;

/// Outcome of [`EntryCache::get_or_create`].
pub enum Lookup<V> {
    /// An existing entry satisfies the request.
    Hit(PendingResult<V>),
    /// A new entry was inserted; the caller owns its write side and must dispatch it.
    Miss(PendingResult<V>, BatchResult<V>),
}

/// The cache / in-flight map of a loader.
///
/// Entries are kept in insertion order so that match-function scans are deterministic. The
/// cache itself is not synchronized; the loader guards it with a single lock so that
/// `get_or_create` is atomic.
pub struct EntryCache<C, V> {
    entries: HashMap<C, PendingResult<V>>,
    order: Vec<C>,
}

impl<C, V> Default for EntryCache<C, V> {
    fn default() -> Self {
        Self { entries: HashMap::new(), order: Vec::new() }
    }
}

impl<C, V> EntryCache<C, V>
where
    C: Clone + Eq + Hash,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry matching `cache_key`, creating one if none does.
    ///
    /// With a match function, existing entries are scanned in insertion order and the first one
    /// that matches wins. Without one, entries match by equality.
    pub fn get_or_create(
        &mut self,
        cache_key: C,
        matcher: Option<&CacheKeyMatchFn<C>>,
    ) -> Lookup<V> {
        if let Some(pending) = self.find(&cache_key, matcher) {
            return Lookup::Hit(pending.clone());
        }
        let (result, pending) = BatchResult::channel();
        self.insert(cache_key, pending.clone());
        Lookup::Miss(pending, result)
    }

    fn find(
        &self,
        cache_key: &C,
        matcher: Option<&CacheKeyMatchFn<C>>,
    ) -> Option<&PendingResult<V>> {
        if let Some(matches) = matcher {
            let found = self.order.iter().find(|existing| matches(cache_key, *existing));
            if let Some(existing) = found {
                return self.entries.get(existing);
            }
        }
        self.entries.get(cache_key)
    }

    /// Inserts or replaces the entry stored under `cache_key`.
    pub fn insert(&mut self, cache_key: C, pending: PendingResult<V>) {
        if self.entries.insert(cache_key.clone(), pending).is_none() {
            self.order.push(cache_key);
        }
    }

    pub fn remove(&mut self, cache_key: &C) -> Option<PendingResult<V>> {
        let removed = self.entries.remove(cache_key)?;
        self.order.retain(|existing| existing != cache_key);
        Some(removed)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
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
    use std::sync::Arc;

    use super::*;

    #[test]
    fn match_fn_scans_in_insertion_order() {
        type Key = (u32, &'static str);
        let mut cache: EntryCache<Key, u32> = EntryCache::new();
        let same_id: CacheKeyMatchFn<Key> =
            Arc::new(|new: &Key, existing: &Key| new.0 == existing.0);

        assert!(matches!(cache.get_or_create((1, "a"), Some(&same_id)), Lookup::Miss(..)));
        assert!(matches!(cache.get_or_create((2, "a"), Some(&same_id)), Lookup::Miss(..)));
        assert!(matches!(cache.get_or_create((1, "b"), Some(&same_id)), Lookup::Hit(..)));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn insert_replaces_without_reordering() {
        let mut cache: EntryCache<u32, u32> = EntryCache::new();
        assert!(matches!(cache.get_or_create(1, None), Lookup::Miss(..)));
        cache.insert(1, PendingResult::resolved(10));
        cache.insert(2, PendingResult::resolved(20));
        assert_eq!(cache.order, vec![1, 2]);

        assert!(cache.remove(&1).is_some());
        assert!(cache.remove(&1).is_none());
        assert_eq!(cache.order, vec![2]);
        assert!(matches!(cache.get_or_create(1, None), Lookup::Miss(..)));
    }
}
