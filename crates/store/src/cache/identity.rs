//! The set of dictionary caches used by one store instance.

use std::collections::HashMap;
use std::sync::Arc;

use super::DictionaryCache;

/// Key of a common token value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenKey {
    /// Shard the value lives in; always 0 in the plain schema.
    pub shard_key: i16,
    /// Id of the code system.
    pub code_system_id: i32,
    /// The code.
    pub token_value: String,
}

impl TokenKey {
    /// Creates a token key.
    pub fn new(shard_key: i16, code_system_id: i32, token_value: impl Into<String>) -> Self {
        Self {
            shard_key,
            code_system_id,
            token_value: token_value.into(),
        }
    }
}

/// Key of a logical resource identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentKey {
    /// Id of the resource type.
    pub resource_type_id: i32,
    /// The business id.
    pub logical_id: String,
}

impl IdentKey {
    /// Creates an identity key.
    pub fn new(resource_type_id: i32, logical_id: impl Into<String>) -> Self {
        Self {
            resource_type_id,
            logical_id: logical_id.into(),
        }
    }
}

/// Shared, append-only caches for one store instance.
#[derive(Debug)]
pub struct IdentityCache {
    resource_types: DictionaryCache<String, i32>,
    resource_type_names: DictionaryCache<i32, Arc<str>>,
    parameter_names: DictionaryCache<String, i32>,
    code_systems: DictionaryCache<String, i32>,
    common_token_values: DictionaryCache<TokenKey, i64>,
    common_canonical_values: DictionaryCache<String, i64>,
    logical_resource_idents: DictionaryCache<IdentKey, i64>,
}

impl IdentityCache {
    /// Creates empty caches. `warn_at` applies to the unbounded caches.
    pub fn new(warn_at: usize) -> Self {
        Self {
            resource_types: DictionaryCache::new("resource_types", warn_at),
            resource_type_names: DictionaryCache::new("resource_type_names", warn_at),
            parameter_names: DictionaryCache::new("parameter_names", warn_at),
            code_systems: DictionaryCache::new("code_systems", warn_at),
            common_token_values: DictionaryCache::new("common_token_values", warn_at),
            common_canonical_values: DictionaryCache::new("common_canonical_values", warn_at),
            logical_resource_idents: DictionaryCache::new("logical_resource_idents", warn_at),
        }
    }

    /// Loads the resource type dictionary. Called once at startup.
    pub fn prefill_resource_types<I>(&self, types: I)
    where
        I: IntoIterator<Item = (String, i32)>,
    {
        let types: Vec<_> = types.into_iter().collect();
        self.resource_type_names
            .publish(types.iter().map(|(name, id)| (*id, Arc::from(name.as_str()))));
        self.resource_types.publish(types);
    }

    /// Id of a configured resource type.
    pub fn resource_type_id(&self, resource_type: &str) -> Option<i32> {
        self.resource_types.get(resource_type)
    }

    /// Name of a resource type id.
    pub fn resource_type_name(&self, resource_type_id: i32) -> Option<Arc<str>> {
        self.resource_type_names.get(&resource_type_id)
    }

    /// Parameter name dictionary.
    pub fn parameter_names(&self) -> &DictionaryCache<String, i32> {
        &self.parameter_names
    }

    /// Code system dictionary.
    pub fn code_systems(&self) -> &DictionaryCache<String, i32> {
        &self.code_systems
    }

    /// Common token value dictionary.
    pub fn common_token_values(&self) -> &DictionaryCache<TokenKey, i64> {
        &self.common_token_values
    }

    /// Common canonical value dictionary.
    pub fn common_canonical_values(&self) -> &DictionaryCache<String, i64> {
        &self.common_canonical_values
    }

    /// Logical resource identities.
    pub fn logical_resource_idents(&self) -> &DictionaryCache<IdentKey, i64> {
        &self.logical_resource_idents
    }

    /// Publishes everything a committed transaction resolved.
    pub fn publish(&self, stage: CacheStage) {
        if stage.is_empty() {
            return;
        }
        tracing::debug!(
            parameter_names = stage.parameter_names.len(),
            code_systems = stage.code_systems.len(),
            token_values = stage.common_token_values.len(),
            canonical_values = stage.common_canonical_values.len(),
            idents = stage.logical_resource_idents.len(),
            "Publishing committed dictionary ids"
        );
        self.parameter_names.publish(stage.parameter_names);
        self.code_systems.publish(stage.code_systems);
        self.common_token_values.publish(stage.common_token_values);
        self.common_canonical_values
            .publish(stage.common_canonical_values);
        self.logical_resource_idents
            .publish(stage.logical_resource_idents);
    }
}

/// Ids resolved by an open transaction, not yet visible to other threads.
#[derive(Debug, Default)]
pub struct CacheStage {
    pub(crate) parameter_names: HashMap<String, i32>,
    pub(crate) code_systems: HashMap<String, i32>,
    pub(crate) common_token_values: HashMap<TokenKey, i64>,
    pub(crate) common_canonical_values: HashMap<String, i64>,
    pub(crate) logical_resource_idents: HashMap<IdentKey, i64>,
}

impl CacheStage {
    /// Creates an empty stage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if nothing was staged.
    pub fn is_empty(&self) -> bool {
        self.parameter_names.is_empty()
            && self.code_systems.is_empty()
            && self.common_token_values.is_empty()
            && self.common_canonical_values.is_empty()
            && self.logical_resource_idents.is_empty()
    }

    /// Drops everything staged, after a rollback.
    pub fn clear(&mut self) {
        self.parameter_names.clear();
        self.code_systems.clear();
        self.common_token_values.clear();
        self.common_canonical_values.clear();
        self.logical_resource_idents.clear();
    }

    /// Parameter name id from the stage or the shared cache.
    pub fn parameter_name_id(&self, cache: &IdentityCache, name: &str) -> Option<i32> {
        self.parameter_names
            .get(name)
            .copied()
            .or_else(|| cache.parameter_names.get(name))
    }

    /// Code system id from the stage or the shared cache.
    pub fn code_system_id(&self, cache: &IdentityCache, system: &str) -> Option<i32> {
        self.code_systems
            .get(system)
            .copied()
            .or_else(|| cache.code_systems.get(system))
    }

    /// Splits token keys into known ids and misses, checking the stage
    /// first and then the shared cache. Misses keep their input order.
    pub fn partition_token_values<'a, I>(
        &self,
        cache: &IdentityCache,
        keys: I,
    ) -> (HashMap<TokenKey, i64>, Vec<TokenKey>)
    where
        I: IntoIterator<Item = &'a TokenKey>,
    {
        partition_staged(&self.common_token_values, &cache.common_token_values, keys)
    }

    /// Splits canonical URLs into known ids and misses, like
    /// [`partition_token_values`](Self::partition_token_values).
    pub fn partition_canonicals<'a, I>(
        &self,
        cache: &IdentityCache,
        urls: I,
    ) -> (HashMap<String, i64>, Vec<String>)
    where
        I: IntoIterator<Item = &'a String>,
    {
        partition_staged(&self.common_canonical_values, &cache.common_canonical_values, urls)
    }

    /// Logical resource id from the stage or the shared cache.
    pub fn logical_resource_id(&self, cache: &IdentityCache, key: &IdentKey) -> Option<i64> {
        self.logical_resource_idents
            .get(key)
            .copied()
            .or_else(|| cache.logical_resource_idents.get(key))
    }
}

fn partition_staged<'a, K, I>(
    staged: &HashMap<K, i64>,
    shared: &DictionaryCache<K, i64>,
    keys: I,
) -> (HashMap<K, i64>, Vec<K>)
where
    K: Eq + std::hash::Hash + Clone + 'a,
    I: IntoIterator<Item = &'a K>,
{
    let mut found = HashMap::new();
    let mut unstaged = Vec::new();
    for key in keys {
        match staged.get(key) {
            Some(id) => {
                found.insert(key.clone(), *id);
            }
            None => unstaged.push(key),
        }
    }
    let (cached, missing) = shared.partition(unstaged);
    found.extend(cached);
    (found, missing)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_is_invisible_until_published() {
        let cache = IdentityCache::new(1000);
        let mut stage = CacheStage::new();
        let key = TokenKey::new(0, 7, "female");
        stage.common_token_values.insert(key.clone(), 42);

        let (found, missing) = stage.partition_token_values(&cache, [&key]);
        assert_eq!(found.get(&key), Some(&42));
        assert!(missing.is_empty());
        assert_eq!(cache.common_token_values().get(&key), None);

        cache.publish(stage);
        assert_eq!(cache.common_token_values().get(&key), Some(42));
    }

    #[test]
    fn test_partition_checks_stage_then_cache() {
        let cache = IdentityCache::new(100);
        cache
            .common_canonical_values
            .publish([("http://example.org/shared".to_string(), 1)]);

        let mut stage = CacheStage::new();
        stage
            .common_canonical_values
            .insert("http://example.org/staged".to_string(), 2);

        let urls = [
            "http://example.org/new-a".to_string(),
            "http://example.org/shared".to_string(),
            "http://example.org/staged".to_string(),
            "http://example.org/new-b".to_string(),
        ];
        let (found, missing) = stage.partition_canonicals(&cache, &urls);
        assert_eq!(found.len(), 2);
        assert_eq!(found["http://example.org/shared"], 1);
        assert_eq!(found["http://example.org/staged"], 2);
        assert_eq!(missing, vec![urls[0].clone(), urls[3].clone()]);
    }

    #[test]
    fn test_cleared_stage_publishes_nothing() {
        let cache = IdentityCache::new(1000);
        let mut stage = CacheStage::new();
        stage.code_systems.insert("http://loinc.org".to_string(), 3);
        stage.clear();
        assert!(stage.is_empty());
        cache.publish(stage);
        assert!(cache.code_systems().is_empty());
    }

    #[test]
    fn test_resource_type_lookup_both_ways() {
        let cache = IdentityCache::new(1000);
        cache.prefill_resource_types([("Patient".to_string(), 1), ("Observation".to_string(), 2)]);
        assert_eq!(cache.resource_type_id("Observation"), Some(2));
        assert_eq!(cache.resource_type_name(1).as_deref(), Some("Patient"));
        assert_eq!(cache.resource_type_id("Basic"), None);
    }
}
