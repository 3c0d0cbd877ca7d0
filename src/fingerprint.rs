//! Content-addressed cache key (`spec.md` §4.4).
//!
//! A SHA-256 digest over a canonical serialisation: the trimmed prompt, a
//! `0x1E` separator, each file's content, a `0x1D` separator, and a stable
//! key-sorted serialisation of the fingerprint-relevant option subset.
//! Collisions are treated as impossible — there is no secondary content
//! check on a cache hit.

use serde_json::Value;
use sha2::{Digest, Sha256};

const RECORD_SEPARATOR: u8 = 0x1E;
const GROUP_SEPARATOR: u8 = 0x1D;

/// Compute the fingerprint for a (prompt, file contents, relevant options) triple.
///
/// `file_contents` must be in the same order as the request's `files` list;
/// the dispatcher reads file contents before calling this (adapters never see
/// file paths).
pub fn fingerprint(prompt: &str, file_contents: &[String], relevant_options: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.trim().as_bytes());
    hasher.update([RECORD_SEPARATOR]);
    for content in file_contents {
        hasher.update(content.as_bytes());
    }
    hasher.update([GROUP_SEPARATOR]);
    hasher.update(canonical_json(relevant_options).as_bytes());
    hex::encode(hasher.finalize())
}

/// Serialise a JSON value with object keys sorted, so that fingerprint-
/// irrelevant key ordering in the caller's option record never changes the digest.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = String::from("{");
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap());
                out.push(':');
                out.push_str(&canonical_json(&map[*key]));
            }
            out.push('}');
            out
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deterministic_across_repeated_calls() {
        let opts = json!({"model": "gpt-4o", "maxTokens": 100});
        let a = fingerprint("hello", &[], &opts);
        let b = fingerprint("hello", &[], &opts);
        assert_eq!(a, b);
    }

    #[test]
    fn insensitive_to_option_key_order() {
        let a = fingerprint("hello", &[], &json!({"model": "m", "maxTokens": 1}));
        let b = fingerprint("hello", &[], &json!({"maxTokens": 1, "model": "m"}));
        assert_eq!(a, b);
    }

    #[test]
    fn trims_prompt_before_hashing() {
        let a = fingerprint("hello", &[], &json!({}));
        let b = fingerprint("  hello  ", &[], &json!({}));
        assert_eq!(a, b);
    }

    #[test]
    fn different_prompts_yield_different_digests() {
        let a = fingerprint("hello", &[], &json!({}));
        let b = fingerprint("goodbye", &[], &json!({}));
        assert_ne!(a, b);
    }

    #[test]
    fn file_contents_affect_the_digest() {
        let a = fingerprint("hello", &[], &json!({}));
        let b = fingerprint("hello", &["file contents".to_string()], &json!({}));
        assert_ne!(a, b);
    }

    #[test]
    fn is_a_64_char_hex_string() {
        let digest = fingerprint("hello", &[], &json!({}));
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
