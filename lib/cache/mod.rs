use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::types::{Entry, ObjectId};

/// Best-effort object → hosting-server hint map.
///
/// A hit is returned without re-validating against the store, so a cached
/// owner can be stale after a migration this server did not observe. That is
/// a deliberate trade-off: callers tolerate eventually-consistent answers and
/// re-resolve on failure, and `OwnershipUpdate` pushes are applied here
/// directly as the explicit invalidation path. Never treat a cached entry as
/// authoritative.
pub struct LookupCache {
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    map: HashMap<ObjectId, Entry>,
    // Insertion order; each id appears at most once since updates don't re-push.
    order: VecDeque<ObjectId>,
    capacity: usize,
}

impl LookupCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                order: VecDeque::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    pub fn get(&self, id: ObjectId) -> Option<Entry> {
        let inner = self.inner.lock().expect("cache mutex poisoned");
        inner.map.get(&id).copied()
    }

    pub fn insert(&self, id: ObjectId, entry: Entry) {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        if inner.map.insert(id, entry).is_none() {
            inner.order.push_back(id);
        }
        while inner.map.len() > inner.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.map.remove(&oldest);
                }
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache mutex poisoned").map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u128) -> ObjectId {
        ObjectId::from_u128(n)
    }

    #[test]
    fn insert_then_get() {
        let cache = LookupCache::new(4);
        cache.insert(id(1), Entry::new(3, 2.5));
        assert_eq!(cache.get(id(1)), Some(Entry::new(3, 2.5)));
        assert_eq!(cache.get(id(2)), None);
    }

    #[test]
    fn update_replaces_without_growing() {
        let cache = LookupCache::new(4);
        cache.insert(id(1), Entry::new(3, 2.5));
        cache.insert(id(1), Entry::new(4, 2.5));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(id(1)), Some(Entry::new(4, 2.5)));
    }

    #[test]
    fn evicts_oldest_insertion_first() {
        let cache = LookupCache::new(2);
        cache.insert(id(1), Entry::new(1, 1.0));
        cache.insert(id(2), Entry::new(2, 1.0));
        cache.insert(id(3), Entry::new(3, 1.0));
        assert_eq!(cache.get(id(1)), None);
        assert_eq!(cache.get(id(2)), Some(Entry::new(2, 1.0)));
        assert_eq!(cache.get(id(3)), Some(Entry::new(3, 1.0)));
    }
}
