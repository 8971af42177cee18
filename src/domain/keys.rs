//! Store key layout and key derivation.
//!
//! All record categories share one store, so each category owns a key prefix.

use sha2::{Digest, Sha256};

/// Maximum length of a sanitized key (before the category prefix)
pub const MAX_KEY_LEN: usize = 100;

/// Record categories and their key prefixes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySpace {
    /// Settled idempotency records (completed or failed)
    Operation,

    /// In-progress start markers
    StartMarker,

    /// Lock leases
    Lock,

    /// Circuit breaker records
    Circuit,
}

impl KeySpace {
    pub const ALL: [KeySpace; 4] = [
        KeySpace::Operation,
        KeySpace::StartMarker,
        KeySpace::Lock,
        KeySpace::Circuit,
    ];

    pub fn prefix(self) -> &'static str {
        match self {
            Self::Operation => "op:",
            Self::StartMarker => "op-start:",
            Self::Lock => "lock:",
            Self::Circuit => "circuit:",
        }
    }

    /// Full store key for an already-sanitized name
    pub fn key(self, name: &str) -> String {
        format!("{}{}", self.prefix(), name)
    }

    /// Split a raw store key into its category and name
    pub fn classify(raw: &str) -> Option<(KeySpace, &str)> {
        Self::ALL
            .iter()
            .find_map(|space| raw.strip_prefix(space.prefix()).map(|name| (*space, name)))
    }
}

/// Replace anything outside `[A-Za-z0-9_-]` with `_` and cap the length.
pub fn sanitize_key(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_KEY_LEN)
        .collect()
}

/// Hash content (first 32 hex chars of SHA256)
pub fn hash_input(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..16])
}

/// Serialize JSON with object keys sorted at every depth.
pub fn canonical_json(value: &serde_json::Value) -> String {
    fn sorted(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                serde_json::Value::Object(
                    entries
                        .into_iter()
                        .map(|(k, v)| (k.clone(), sorted(v)))
                        .collect(),
                )
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(sorted).collect())
            }
            other => other.clone(),
        }
    }

    sorted(value).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sanitize_replaces_and_truncates() {
        assert_eq!(sanitize_key("send:https://x/hook"), "send_https___x_hook");
        assert_eq!(sanitize_key("ok_key-1"), "ok_key-1");

        let long = "a".repeat(250);
        assert_eq!(sanitize_key(&long).len(), MAX_KEY_LEN);
    }

    #[test]
    fn test_classify_prefixes() {
        assert_eq!(KeySpace::classify("op:abc"), Some((KeySpace::Operation, "abc")));
        assert_eq!(
            KeySpace::classify("op-start:abc"),
            Some((KeySpace::StartMarker, "abc"))
        );
        assert_eq!(KeySpace::classify("lock:x"), Some((KeySpace::Lock, "x")));
        assert_eq!(KeySpace::classify("circuit:svc"), Some((KeySpace::Circuit, "svc")));
        assert_eq!(KeySpace::classify("unrelated"), None);
    }

    #[test]
    fn test_canonical_json_ignores_key_order() {
        let a = json!({"b": 1, "a": {"y": [1, 2], "x": null}});
        let b = json!({"a": {"x": null, "y": [1, 2]}, "b": 1});

        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":{"x":null,"y":[1,2]},"b":1}"#);
    }

    #[test]
    fn test_input_hash_consistency() {
        let hash1 = hash_input("test input");
        let hash2 = hash_input("test input");
        let hash3 = hash_input("different input");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        assert_eq!(hash1.len(), 32);
    }
}
