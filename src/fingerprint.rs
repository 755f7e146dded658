//! Stable hashing for deterministic derived-collection names (§4.4) and instance
//! parameter deduplication (§4.6).
//!
//! The original Python hashes `str(sorted(params.items()))` with `hashlib.sha256`.
//! This crate uses `xxhash-rust` (already in the estuary-flow workspace for the same
//! kind of stable fingerprinting) over the parameters' canonical JSON encoding.
//! `serde_json::Value`'s object map is a `BTreeMap` by default (this crate doesn't
//! enable the `preserve_order` feature), so serializing a `Value` already emits
//! object keys in lexical order — no separate canonicalization pass is needed to
//! satisfy "keys sorted lexically".

use serde::Serialize;
use xxhash_rust::xxh3::xxh3_64;

pub fn fingerprint(value: &impl Serialize) -> u64 {
    let canonical =
        serde_json::to_vec(value).expect("fingerprinted value must serialize to JSON");
    xxh3_64(&canonical)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_affect_fingerprint() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn different_values_hash_differently() {
        let a = json!({"a": 1});
        let b = json!({"a": 2});
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }
}
