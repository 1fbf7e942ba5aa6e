//! NF-014: BLAKE3 hashing for resource inputs and idempotency tokens.

use crate::core::descriptor::ResourceDescriptor;
use crate::core::types::Fields;
use std::collections::{BTreeMap, BTreeSet};

const SECRET_PLACEHOLDER: &str = "<secret>";

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    format!("blake3:{}", blake3::hash(s.as_bytes()).to_hex())
}

/// Compute a composite hash from multiple component hashes.
pub fn composite_hash(components: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for c in components {
        hasher.update(c.as_bytes());
        hasher.update(b"\0");
    }
    format!("blake3:{}", hasher.finalize().to_hex())
}

/// Hash the descriptor-declared inputs in `fields`.
///
/// Keys are sorted and null values skipped, so an absent field and an
/// explicit null hash the same. Secret inputs (descriptor-flagged or named
/// in `secret`) contribute only their presence: the hash lands in the
/// lock file and the event log unsealed.
pub fn hash_inputs(descriptor: &ResourceDescriptor, fields: &Fields, secret: &BTreeSet<String>) -> String {
    let canonical: BTreeMap<&str, String> = descriptor
        .inputs
        .iter()
        .filter_map(|f| {
            let value = fields.get(f.name).filter(|v| !v.is_null())?;
            let rendered = if f.secret || secret.contains(f.name) {
                SECRET_PLACEHOLDER.to_string()
            } else {
                value.to_string()
            };
            Some((f.name, rendered))
        })
        .collect();
    let mut hasher = blake3::Hasher::new();
    for (name, value) in canonical {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    format!("blake3:{}", hasher.finalize().to_hex())
}

/// Client-supplied idempotency token for a create.
///
/// Stable across retries and reruns of the same logical resource; a new
/// `generation` (after a replacement) yields a new token.
pub fn idempotency_token(stack: &str, name: &str, type_token: &str, generation: u32) -> String {
    let generation = generation.to_string();
    let digest = composite_hash(&[stack, name, type_token, &generation]);
    digest.trim_start_matches("blake3:").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::descriptor;
    use serde_json::json;

    #[test]
    fn test_nf014_hash_string() {
        let h1 = hash_string("hello");
        let h2 = hash_string("hello");
        let h3 = hash_string("world");
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
        assert!(h1.starts_with("blake3:"));
        assert_eq!(h1.len(), 7 + 64);
    }

    #[test]
    fn test_nf014_composite_hash() {
        let h = composite_hash(&["blake3:aaa", "blake3:bbb"]);
        assert!(h.starts_with("blake3:"));
        let h2 = composite_hash(&["blake3:bbb", "blake3:aaa"]);
        assert_ne!(h, h2);
    }

    #[test]
    fn test_nf014_hash_inputs_ignores_order_nulls_and_outputs() {
        let d = descriptor::lookup("database").unwrap();
        let a = Fields::from([
            ("projectId".to_string(), json!("p-1")),
            ("branchId".to_string(), json!("br-1")),
            ("name".to_string(), json!("app")),
        ]);
        let mut b = Fields::from([
            ("name".to_string(), json!("app")),
            ("branchId".to_string(), json!("br-1")),
            ("projectId".to_string(), json!("p-1")),
            ("ownerName".to_string(), serde_json::Value::Null),
            ("createdAt".to_string(), json!("2026-01-01")),
        ]);
        let none = BTreeSet::new();
        assert_eq!(hash_inputs(d, &a, &none), hash_inputs(d, &b, &none));
        b.insert("name".to_string(), json!("other"));
        assert_ne!(hash_inputs(d, &a, &none), hash_inputs(d, &b, &none));
    }

    #[test]
    fn test_nf014_secret_inputs_do_not_reach_hash() {
        let d = descriptor::lookup("branch").unwrap();
        let fields = |name: &str| {
            Fields::from([
                ("projectId".to_string(), json!("p-1")),
                ("name".to_string(), json!(name)),
            ])
        };
        let secret = BTreeSet::from(["name".to_string()]);
        let sealed = hash_inputs(d, &fields("hunter2"), &secret);
        assert_eq!(sealed, hash_inputs(d, &fields("letmein"), &secret));
        assert_ne!(sealed, hash_inputs(d, &fields("hunter2"), &BTreeSet::new()));

        let mut without = fields("hunter2");
        without.remove("name");
        assert_ne!(sealed, hash_inputs(d, &without, &secret));
    }

    #[test]
    fn test_nf014_idempotency_token() {
        let t = idempotency_token("demo", "main", "neon:index:Branch", 0);
        assert_eq!(t, idempotency_token("demo", "main", "neon:index:Branch", 0));
        assert_eq!(t.len(), 64);
        assert_ne!(t, idempotency_token("demo", "main", "neon:index:Branch", 1));
        assert_ne!(t, idempotency_token("prod", "main", "neon:index:Branch", 0));
        assert_ne!(t, idempotency_token("demo", "dev", "neon:index:Branch", 0));
    }
}
