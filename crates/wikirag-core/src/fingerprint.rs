//! Content fingerprints used to detect changed documents.

use sha2::{Digest, Sha256};

/// SHA-256 of `content`, lowercase hex.
pub fn content_fingerprint(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_hex() {
        let fp = content_fingerprint(b"# Osaka\n");
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fp, content_fingerprint(b"# Osaka\n"));
    }

    #[test]
    fn fingerprint_changes_with_content() {
        assert_ne!(content_fingerprint(b"a"), content_fingerprint(b"b"));
        assert_eq!(
            content_fingerprint(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
