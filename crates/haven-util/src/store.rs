use dashmap::DashMap;

/// String-keyed record store shared by the guards.
///
/// Every closure-taking method runs with the key held exclusively, so a
/// read-modify-write through [`KeyStore::upsert`] or [`KeyStore::modify`] is
/// never interleaved with another writer on the same key. Closures must not
/// call back into the same store.
pub trait KeyStore<V>: Send + Sync {
    fn get(&self, key: &str) -> Option<V>;

    fn set(&self, key: &str, value: V);

    fn delete(&self, key: &str) -> Option<V>;

    /// Snapshot of the keys present at call time.
    fn keys(&self) -> Vec<String>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mutate the record for `key`, creating it with `init` first if absent.
    fn upsert<R>(&self, key: &str, init: impl FnOnce() -> V, f: impl FnOnce(&mut V) -> R) -> R;

    /// Mutate the record for `key` if it exists.
    fn modify<R>(&self, key: &str, f: impl FnOnce(&mut V) -> R) -> Option<R>;

    /// Delete the record only if `predicate` holds for its current value.
    fn remove_if(&self, key: &str, predicate: impl FnOnce(&V) -> bool) -> Option<V>;
}

/// In-process store backed by a sharded concurrent map.
pub struct MemoryStore<V> {
    entries: DashMap<String, V>,
}

impl<V> MemoryStore<V> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<V> Default for MemoryStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + Sync> KeyStore<V> for MemoryStore<V> {
    fn get(&self, key: &str) -> Option<V> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    fn set(&self, key: &str, value: V) {
        self.entries.insert(key.to_owned(), value);
    }

    fn delete(&self, key: &str) -> Option<V> {
        self.entries.remove(key).map(|(_, value)| value)
    }

    fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn upsert<R>(&self, key: &str, init: impl FnOnce() -> V, f: impl FnOnce(&mut V) -> R) -> R {
        let mut entry = self.entries.entry(key.to_owned()).or_insert_with(init);
        f(entry.value_mut())
    }

    fn modify<R>(&self, key: &str, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        self.entries
            .get_mut(key)
            .map(|mut entry| f(entry.value_mut()))
    }

    fn remove_if(&self, key: &str, predicate: impl FnOnce(&V) -> bool) -> Option<V> {
        self.entries
            .remove_if(key, |_, value| predicate(value))
            .map(|(_, value)| value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn set_get_delete() {
        let store = MemoryStore::new();
        store.set("a", 1u32);
        assert_eq!(store.get("a"), Some(1));
        assert_eq!(store.len(), 1);
        assert_eq!(store.delete("a"), Some(1));
        assert!(store.get("a").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn modify_skips_missing_keys() {
        let store: MemoryStore<u32> = MemoryStore::new();
        assert!(store.modify("missing", |v| *v += 1).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn remove_if_rechecks_current_value() {
        let store = MemoryStore::new();
        store.set("k", 5u32);
        assert!(store.remove_if("k", |v| *v > 10).is_none());
        assert_eq!(store.get("k"), Some(5));
        assert_eq!(store.remove_if("k", |v| *v == 5), Some(5));
        assert!(store.get("k").is_none());
    }

    #[test]
    fn concurrent_upserts_are_not_lost() {
        let store = Arc::new(MemoryStore::<u64>::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        store.upsert("shared", || 0, |v| *v += 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker thread");
        }
        assert_eq!(store.get("shared"), Some(8000));
    }
}
