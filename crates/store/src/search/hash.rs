//! Parameter hashing.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};

use crate::types::ExtractedParameterValue;

/// Hash of an extracted parameter set.
///
/// Entries are serialized individually, sorted and de-duplicated before
/// hashing, so the hash doesn't depend on extraction order.
pub fn parameter_hash(parameters: &[ExtractedParameterValue]) -> String {
    let mut entries: Vec<String> = parameters
        .iter()
        .filter_map(|p| serde_json::to_string(p).ok())
        .collect();
    entries.sort();
    entries.dedup();

    let mut hasher = Sha256::new();
    for entry in &entries {
        hasher.update(entry.as_bytes());
        hasher.update(b"\n");
    }
    STANDARD.encode(hasher.finalize())
}
