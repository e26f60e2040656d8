// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Stable hashes used in cache keys and row images.

use sha2::{Digest, Sha256};

use crate::codec::BindValue;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a 64-bit over raw bytes.
#[must_use]
pub const fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
        i += 1;
    }
    hash
}

/// Attribute hash of an index tuple.
///
/// The tuple is rendered as a JSON array of bind literals (`null` for NULL)
/// so that flush, lookup and warm-up all agree on the key no matter which
/// side produced the values.
#[must_use]
pub fn attribute_hash(attrs: &[BindValue]) -> u64 {
    let canonical: Vec<serde_json::Value> = attrs
        .iter()
        .map(|attr| match attr {
            BindValue::Null => serde_json::Value::Null,
            other => serde_json::Value::String(other.literal()),
        })
        .collect();
    let encoded = serde_json::Value::Array(canonical).to_string();
    fnv1a_64(encoded.as_bytes())
}

/// Key prefix for an entity: leading hex characters of `sha256(name ‖ dsn)`.
#[must_use]
pub fn cache_prefix(entity: &str, dsn: &str, len: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entity.as_bytes());
    hasher.update(dsn.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..len.clamp(1, digest.len())].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv_known_vectors() {
        assert_eq!(fnv1a_64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a_64(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn test_attribute_hash_distinguishes_null_from_text() {
        let null = attribute_hash(&[BindValue::Null]);
        let text = attribute_hash(&[BindValue::Text("null".into())]);
        assert_ne!(null, text);
    }

    #[test]
    fn test_attribute_hash_is_type_agnostic_for_numbers() {
        // A lookup bound from user input and a warm-up bound from a scanned
        // row must land on the same field.
        assert_eq!(
            attribute_hash(&[BindValue::Int(20)]),
            attribute_hash(&[BindValue::UInt(20)])
        );
    }

    #[test]
    fn test_cache_prefix_is_stable_and_short() {
        let a = cache_prefix("User", "mysql://db/app", 5);
        let b = cache_prefix("User", "mysql://db/app", 5);
        let c = cache_prefix("Post", "mysql://db/app", 5);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 5);
    }
}
