//! Canonical JSON and canonical SHA-256 hashing.
//!
//! `serde_json::Value`'s `Object` variant is a `BTreeMap` whenever the
//! `preserve_order` feature is off (it is, in this workspace), so
//! `serde_json::to_string` on a parsed `Value` already emits sorted keys
//! and, by default, compact separators. The one thing it does *not* do is
//! reject non-finite numbers — `serde_json` silently serializes NaN and
//! Infinity as JSON `null` rather than erroring, which would silently
//! corrupt a hash input. `to_canonical_string` walks the value up front to
//! catch that case explicitly: no standard encoder guarantees sorted keys,
//! compact separators, and NaN rejection all at once.

use crate::error::CoreError;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

fn reject_non_finite(value: &Value) -> Result<(), CoreError> {
    match value {
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                if !f.is_finite() {
                    return Err(CoreError::NonFiniteNumber);
                }
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                reject_non_finite(item)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for v in map.values() {
                reject_non_finite(v)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Serializes `value` to canonical JSON: sorted object keys, compact
/// separators, list order preserved, non-finite numbers rejected.
pub fn to_canonical_string<T: Serialize>(value: &T) -> Result<String, CoreError> {
    let parsed: Value = serde_json::to_value(value)?;
    reject_non_finite(&parsed)?;
    // serde_json's default Display for a Value already uses compact
    // separators and (with preserve_order off) sorted object keys.
    Ok(serde_json::to_string(&parsed)?)
}

pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CoreError> {
    Ok(to_canonical_string(value)?.into_bytes())
}

/// SHA-256 of the UTF-8 canonical-JSON encoding of `value`, as a lowercase
/// hex string.
pub fn canonical_sha256<T: Serialize>(value: &T) -> Result<String, CoreError> {
    let bytes = to_canonical_bytes(value)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex_lower(&hasher.finalize()))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_lower(&hasher.finalize())
}

fn hex_lower(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(&mut s, "{:02x}", b).expect("writing to a String cannot fail");
    }
    s
}

/// Hashes raw text after normalizing line endings to `\n` (matches the
/// `.sas`/`.txt`/config-file canonicalization rule used by artifact
/// hashing).
pub fn sha256_text_normalized(text: &str) -> String {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    sha256_hex(normalized.as_bytes())
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        // Law 1/2 of §8: permuting the insertion order of a JSON object's
        // entries never changes its canonical hash.
        #[test]
        fn canonical_hash_is_insertion_order_independent(
            mut entries in prop::collection::vec(("[a-z]{1,6}", any::<i64>()), 1..8)
        ) {
            entries.dedup_by(|a, b| a.0 == b.0);
            let forward: serde_json::Map<String, Value> = entries
                .iter()
                .cloned()
                .map(|(k, v)| (k, Value::from(v)))
                .collect();
            let mut reversed_entries = entries.clone();
            reversed_entries.reverse();
            let reversed: serde_json::Map<String, Value> = reversed_entries
                .into_iter()
                .map(|(k, v)| (k, Value::from(v)))
                .collect();
            prop_assert_eq!(
                canonical_sha256(&Value::Object(forward)).unwrap(),
                canonical_sha256(&Value::Object(reversed)).unwrap()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_string_sorts_keys() {
        let v = json!({"b": 1, "a": 2});
        assert_eq!(to_canonical_string(&v).unwrap(), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn canonical_string_uses_compact_separators() {
        let v = json!({"a": [1, 2, 3]});
        assert_eq!(to_canonical_string(&v).unwrap(), r#"{"a":[1,2,3]}"#);
    }

    #[test]
    fn canonical_string_preserves_list_order() {
        let v = json!(["z", "a", "m"]);
        assert_eq!(to_canonical_string(&v).unwrap(), r#"["z","a","m"]"#);
    }

    #[test]
    fn reordered_keys_hash_identically() {
        let a = json!({"op": "filter", "params": {"x": 1, "y": 2}});
        let b = json!({"params": {"y": 2, "x": 1}, "op": "filter"});
        assert_eq!(canonical_sha256(&a).unwrap(), canonical_sha256(&b).unwrap());
    }

    #[test]
    fn finite_number_is_accepted() {
        let v = serde_json::Value::Number(serde_json::Number::from_f64(1.0).unwrap());
        assert!(reject_non_finite(&v).is_ok());
    }

    #[test]
    fn overflowing_exponent_is_rejected() {
        // `Number::from_f64` (the public constructor) refuses NaN/infinity,
        // but the parser builds `Number`s directly and doesn't run that
        // check — a JSON literal whose exponent overflows `f64` (as schema
        // lock files and amendment payloads read from disk could contain)
        // parses straight to an infinite `Value::Number`. This is the one
        // way a non-finite number reaches `reject_non_finite` in practice,
        // and it's exactly the case `to_canonical_string` must catch before
        // serde_json silently re-encodes it as JSON `null`.
        let v: serde_json::Value = serde_json::from_str("1e400").unwrap();
        assert!(matches!(v, serde_json::Value::Number(_)));
        let err = reject_non_finite(&v).unwrap_err();
        assert!(matches!(err, CoreError::NonFiniteNumber));
    }

    #[test]
    fn to_canonical_string_refuses_overflowing_exponent() {
        let v: serde_json::Value = serde_json::from_str(r#"{"x": 1e400}"#).unwrap();
        let err = to_canonical_string(&v).unwrap_err();
        assert!(matches!(err, CoreError::NonFiniteNumber));
    }

    #[test]
    fn sha256_text_normalizes_crlf() {
        assert_eq!(
            sha256_text_normalized("a\r\nb\r\n"),
            sha256_text_normalized("a\nb\n")
        );
    }

    #[test]
    fn sha256_hex_matches_known_vector() {
        // SHA-256("") is a well known constant.
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
