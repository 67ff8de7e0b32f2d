//! Content fingerprints for change detection.
//!
//! A unit's content hash covers the settings that shape its output plus the
//! stable identity of its upstream input. It never covers whether the source
//! is present in the current run, so a processed unit stays processed when a
//! later run simply lacks its file.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Full SHA-256 hex digest of raw bytes
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash of a value's canonical JSON form.
///
/// Going through `serde_json::Value` sorts object keys, so two values that
/// differ only in map ordering hash the same.
pub fn content_hash<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let canonical = serde_json::to_value(value)?;
    Ok(hash_bytes(canonical.to_string().as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_is_hex_sha256() {
        let hash = hash_bytes(b"abc");
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_content_hash_ignores_key_order() {
        let a = json!({"model": "large-v3", "lang": "cs"});
        let b = json!({"lang": "cs", "model": "large-v3"});
        assert_eq!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
    }

    #[test]
    fn test_content_hash_changes_with_settings() {
        let a = json!({"model": "large-v3"});
        let b = json!({"model": "medium"});
        assert_ne!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
    }
}
