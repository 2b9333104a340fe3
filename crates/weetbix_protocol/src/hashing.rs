//! Stable hashes used in storage keys.
//!
//! Re-extracting the same build must produce the same keys, so every hash
//! here is a pure function of its inputs.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Number of digest bytes kept in a key (16 hex characters).
const KEY_BYTES: usize = 8;

fn truncated_hex(digest: &[u8]) -> String {
    hex::encode(&digest[..KEY_BYTES])
}

/// Hash of a variant definition: sha256 over sorted `key:value\n` pairs.
pub fn variant_hash(def: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in def {
        hasher.update(key.as_bytes());
        hasher.update(b":");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    truncated_hex(&hasher.finalize())
}

/// Identity of a git reference, from (hostname, repository, ref name).
pub fn git_reference_hash(hostname: &str, repository: &str, reference: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(hostname.as_bytes());
    hasher.update(b"\n");
    hasher.update(repository.as_bytes());
    hasher.update(b"\n");
    hasher.update(reference.as_bytes());
    truncated_hex(&hasher.finalize())
}
