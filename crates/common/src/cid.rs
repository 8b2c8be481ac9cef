//! Content id helpers based on SHA-256.
//! A cid is the lowercase hex digest of the content bytes.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Compute the content id for a byte slice.
pub fn calculate_cid(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Short prefix form for logging (first 12 hex chars).
pub fn short_cid(cid: &str) -> &str {
    cid.get(0..12).unwrap_or(cid)
}

/// Data ids are uuids; aliases and tags are anything else.
pub fn is_data_id(keyword: &str) -> bool {
    Uuid::parse_str(keyword).is_ok()
}

/// Generate a fresh data id.
pub fn new_data_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cid_deterministic() {
        let a = b"some payload bytes";
        assert_eq!(calculate_cid(a), calculate_cid(a));
        assert_eq!(calculate_cid(a).len(), 64);
        assert_ne!(calculate_cid(a), calculate_cid(b"other"));
    }

    #[test]
    fn test_short_cid() {
        let cid = calculate_cid(b"x");
        assert_eq!(short_cid(&cid).len(), 12);
        assert_eq!(short_cid("ab"), "ab");
    }

    #[test]
    fn test_is_data_id() {
        assert!(is_data_id(&new_data_id()));
        assert!(!is_data_id("my-model-alias"));
    }
}
