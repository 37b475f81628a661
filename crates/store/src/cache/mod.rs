//! Process-local caches over the shared dictionaries.
//!
//! The store keeps compact surrogate ids for values that recur across many
//! records: resource types, parameter names, code systems, token values,
//! canonical URLs and logical resource identities. The rows behind these ids
//! are never updated or deleted, so a cached id can't go stale and the caches
//! need no invalidation or eviction.
//!
//! Ids resolved inside a transaction are first collected in a [`CacheStage`]
//! and only published to the shared [`IdentityCache`] after the transaction
//! commits. A rollback discards the stage, so ids of rows that never became
//! visible can't leak into the cache.

mod dictionary;
mod identity;

pub use dictionary::DictionaryCache;
pub use identity::{CacheStage, IdentityCache, IdentKey, TokenKey};
