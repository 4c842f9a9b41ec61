//! Keyed state store used by the rate limiter and circuit breaker.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

/// Shared keyed state with compare-and-swap updates.
///
/// Callers read a value, compute the next one, and publish it with
/// `compare_and_swap`; a `false` return means another task got there first
/// and the caller re-reads and tries again.
pub trait StateStore<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Option<V>;

    fn set(&self, key: K, value: V);

    /// Replace the value for `key` with `new` only if it currently equals
    /// `expected` (`None` meaning "absent"). Returns whether the swap happened.
    fn compare_and_swap(&self, key: &K, expected: Option<&V>, new: V) -> bool;

    /// Drop every entry.
    fn clear(&self);
}

/// Process-wide in-memory store.
pub struct InMemoryStateStore<K, V> {
    entries: Mutex<HashMap<K, V>>,
}

impl<K, V> InMemoryStateStore<K, V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> Default for InMemoryStateStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> StateStore<K, V> for InMemoryStateStore<K, V>
where
    K: Eq + Hash + Clone + Send,
    V: Clone + PartialEq + Send,
{
    fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(key).cloned()
    }

    fn set(&self, key: K, value: V) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key, value);
    }

    fn compare_and_swap(&self, key: &K, expected: Option<&V>, new: V) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.get(key) != expected {
            return false;
        }
        entries.insert(key.clone(), new);
        true
    }

    fn clear(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_on_absent_key() {
        let store: InMemoryStateStore<String, u32> = InMemoryStateStore::new();
        assert!(store.compare_and_swap(&"a".to_string(), None, 1));
        assert!(!store.compare_and_swap(&"a".to_string(), None, 2));
        assert_eq!(store.get(&"a".to_string()), Some(1));
    }

    #[test]
    fn cas_rejects_stale_expectation() {
        let store: InMemoryStateStore<&'static str, u32> = InMemoryStateStore::new();
        store.set("k", 5);
        assert!(!store.compare_and_swap(&"k", Some(&4), 6));
        assert!(store.compare_and_swap(&"k", Some(&5), 6));
        assert_eq!(store.get(&"k"), Some(6));
    }

    #[test]
    fn clear_drops_everything() {
        let store: InMemoryStateStore<&'static str, u32> = InMemoryStateStore::new();
        store.set("a", 1);
        store.set("b", 2);
        store.clear();
        assert_eq!(store.get(&"a"), None);
        assert_eq!(store.get(&"b"), None);
    }
}
