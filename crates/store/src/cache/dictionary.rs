//! Append-only dictionary cache.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::RwLock;

/// A process-local map from dictionary value to surrogate id.
///
/// Entries are only ever added. A published id is never changed or removed,
/// because the dictionary row it mirrors is immutable once visible.
pub struct DictionaryCache<K, V> {
    name: &'static str,
    entries: RwLock<HashMap<K, V>>,
    warn_at: usize,
}

impl<K, V> DictionaryCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates an empty cache. `warn_at` is the size at which growth is
    /// reported as a capacity concern.
    pub fn new(name: &'static str, warn_at: usize) -> Self {
        Self {
            name,
            entries: RwLock::new(HashMap::new()),
            warn_at,
        }
    }

    /// Looks up a single value.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.entries.read().get(key).cloned()
    }

    /// Splits `keys` into those already cached and those that are not.
    pub fn partition<'a, I>(&self, keys: I) -> (HashMap<K, V>, Vec<K>)
    where
        I: IntoIterator<Item = &'a K>,
        K: 'a,
    {
        let entries = self.entries.read();
        let mut found = HashMap::new();
        let mut missing = Vec::new();
        for key in keys {
            match entries.get(key) {
                Some(v) => {
                    found.insert(key.clone(), v.clone());
                }
                None => missing.push(key.clone()),
            }
        }
        (found, missing)
    }

    /// Publishes resolved entries. An existing entry is never replaced.
    pub fn publish<I>(&self, resolved: I)
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let mut entries = self.entries.write();
        let before = entries.len();
        for (k, v) in resolved {
            entries.entry(k).or_insert(v);
        }
        let after = entries.len();
        if before < self.warn_at && after >= self.warn_at {
            tracing::warn!(
                cache = self.name,
                entries = after,
                "Dictionary cache has grown past its warning threshold; entries are never evicted"
            );
        }
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// The name used in log output.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<K, V> std::fmt::Debug for DictionaryCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DictionaryCache")
            .field("name", &self.name)
            .field("len", &self.entries.read().len())
            .finish()
    }
}
