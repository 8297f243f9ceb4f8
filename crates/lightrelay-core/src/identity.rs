//! Fingerprints for API keys.
//!
//! Keys are secrets and never appear in logs; a short SHA-256 prefix is
//! enough to tell sessions apart when reading them.

use sha2::{Digest, Sha256};

/// Length of the hex prefix used for log output.
const FINGERPRINT_LEN: usize = 12;

/// Hex-encoded SHA-256 prefix of an API key, for logging.
pub fn key_fingerprint(key: &str) -> String {
    let hash = Sha256::digest(key.as_bytes());
    let mut fp = hex::encode(hash);
    fp.truncate(FINGERPRINT_LEN);
    fp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_short_hex() {
        let fp = key_fingerprint("secret-api-key");
        assert_eq!(fp.len(), FINGERPRINT_LEN);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fingerprint_is_stable_and_distinct() {
        assert_eq!(key_fingerprint("a"), key_fingerprint("a"));
        assert_ne!(key_fingerprint("a"), key_fingerprint("b"));
        assert!(!key_fingerprint("secret").contains("secret"));
    }
}
