//! Hashing Utilities

use sha2::{Digest, Sha256};

/// Compute SHA-256 hash of content and return as hex string
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hash several fields joined with `|` so field boundaries stay unambiguous
pub fn hash_parts(parts: &[&str]) -> String {
    content_hash(&parts.join("|"))
}

/// Hash fields prefixed with a secret key
pub fn keyed_hash(key: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update(b"|");
    hasher.update(parts.join("|").as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash() {
        let hash = content_hash("hello world");
        assert_eq!(hash.len(), 64); // SHA-256 produces 64 hex chars

        assert_eq!(content_hash("hello world"), content_hash("hello world"));
        assert_ne!(content_hash("hello world"), content_hash("hello world!"));
    }

    #[test]
    fn test_known_hash() {
        let hash = content_hash("hello");
        assert_eq!(
            hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_hash_parts_boundaries() {
        assert_ne!(hash_parts(&["ab", "c"]), hash_parts(&["a", "bc"]));
        assert_eq!(hash_parts(&["a", "b"]), content_hash("a|b"));
    }

    #[test]
    fn test_keyed_hash_depends_on_key() {
        let a = keyed_hash("key-1", &["payload"]);
        let b = keyed_hash("key-2", &["payload"]);
        assert_ne!(a, b);
        assert_eq!(a, keyed_hash("key-1", &["payload"]));
    }
}
