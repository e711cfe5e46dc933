use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Shared source-id -> destination-id table.
///
/// Clones share storage, so worker tasks can record results into the same
/// table the stage returns. Every access is a point update; the lock is never
/// held across an await.
#[derive(Debug)]
pub struct IdTable<K, V> {
    inner: Arc<RwLock<BTreeMap<K, V>>>,
}

impl<K, V> Clone for IdTable<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Ord, V> Default for IdTable<K, V> {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }
}

impl<K: Ord + Clone, V: Clone> IdTable<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<K, V>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<K, V>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.read().get(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.read().contains_key(key)
    }

    /// Insert `value` unless `key` is already mapped.
    ///
    /// Returns `true` if the entry was added. Existing entries are never
    /// overwritten.
    pub fn insert_new(&self, key: K, value: V) -> bool {
        let mut map = self.write();
        if map.contains_key(&key) {
            return false;
        }
        map.insert(key, value);
        true
    }

    /// Store `value` if `allow` accepts the current entry.
    ///
    /// Returns `true` if the entry was written.
    pub fn replace_if(&self, key: K, value: V, allow: impl FnOnce(Option<&V>) -> bool) -> bool {
        let mut map = self.write();
        if !allow(map.get(&key)) {
            return false;
        }
        map.insert(key, value);
        true
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> BTreeMap<K, V> {
        self.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_new_never_overwrites() {
        let table: IdTable<u64, u64> = IdTable::new();
        assert!(table.insert_new(1, 100));
        assert!(!table.insert_new(1, 200));
        assert_eq!(table.get(&1), Some(100));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn clones_share_storage() {
        let table: IdTable<(String, u64), u64> = IdTable::new();
        let clone = table.clone();
        clone.insert_new(("DEMO".to_string(), 3), 30);
        assert!(table.contains(&("DEMO".to_string(), 3)));
        assert!(!table.contains(&("OTHER".to_string(), 3)));
    }

    #[test]
    fn replace_if_consults_current_entry() {
        let table: IdTable<u64, &str> = IdTable::new();
        assert!(table.replace_if(1, "first", |current| current.is_none()));
        assert!(!table.replace_if(1, "second", |current| current.is_none()));
        assert!(table.replace_if(1, "third", |current| current == Some(&"first")));
        assert_eq!(table.get(&1), Some("third"));
    }

    #[test]
    fn snapshot_is_detached() {
        let table: IdTable<u64, u64> = IdTable::new();
        table.insert_new(1, 1);
        let snapshot = table.snapshot();
        table.insert_new(2, 2);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn concurrent_inserts_are_all_kept() {
        let table: IdTable<u64, u64> = IdTable::new();
        std::thread::scope(|s| {
            for t in 0..8u64 {
                let table = table.clone();
                s.spawn(move || {
                    for i in 0..100 {
                        table.insert_new(t * 100 + i, i);
                    }
                });
            }
        });
        assert_eq!(table.len(), 800);
    }
}
