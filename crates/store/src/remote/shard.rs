//! Shard keys.

use std::fmt;

use sha2::{Digest, Sha256};

/// The 16-bit shard a logical resource and its token values live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardKey(i16);

impl ShardKey {
    /// Derives the shard of a logical resource from its type and id.
    pub fn derive(resource_type: &str, logical_id: &str) -> Self {
        Self::hash(format!("{}/{}", resource_type, logical_id).as_bytes())
    }

    /// Encodes an explicit request shard, which overrides the derived key.
    pub fn from_request(request_shard: &str) -> Self {
        Self::hash(request_shard.as_bytes())
    }

    /// Shard for a message: the request shard if given, else derived.
    pub fn for_message(resource_type: &str, logical_id: &str, request_shard: Option<&str>) -> Self {
        match request_shard {
            Some(shard) => Self::from_request(shard),
            None => Self::derive(resource_type, logical_id),
        }
    }

    fn hash(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self(i16::from_be_bytes([digest[0], digest[1]]))
    }

    /// The stored value.
    pub fn value(&self) -> i16 {
        self.0
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
