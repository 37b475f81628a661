//! Distributed index message processing.
//!
//! In a distributed deployment the instance that writes a resource version
//! does not write its parameter rows. It publishes an [`IndexMessage`] with
//! the extracted values instead, and a consumer applies batches of these
//! messages through [`IndexMessageConsumer::process_batch`].
//!
//! A batch is one transaction. Problems with a single message (bad JSON, an
//! old format version, the wrong tenant, an unconfigured resource type) drop
//! that message and are reported in the [`BatchReport`]; anything else rolls
//! back the whole batch. Messages for versions that are not committed yet
//! come back in [`BatchReport::deferred`] so the caller can redeliver them.

mod message;
mod processor;
mod shard;

use async_trait::async_trait;

pub use message::{
    DateValue, IndexMessage, LocationValue, NumberValue, ProfileValue, QuantityValue,
    ReferenceValue, ResourceIndexData, StringValue, TagValue, TokenValue,
};
pub use processor::{BatchReport, MessageProcessor};
pub use shard::ShardKey;

use crate::error::StorageResult;

/// Index message format version produced by this crate.
pub const MESSAGE_VERSION: u32 = 1;

/// Applies batches of index messages.
#[async_trait]
pub trait IndexMessageConsumer: Send + Sync {
    /// Applies a batch in one transaction. The report is only returned
    /// after commit; an error means nothing was applied.
    async fn process_batch(&self, messages: Vec<String>) -> StorageResult<BatchReport>;
}
