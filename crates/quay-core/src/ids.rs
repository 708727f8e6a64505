//! Identifier and secret generation.

use base64::{engine::general_purpose, Engine as _};
use rand::RngCore;

/// Generate a 128-bit identifier (hyphenated UUID v4).
///
/// Collision-free under the birthday bound well past 10^9 ids/second.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Fill `n` bytes from the OS cryptographic RNG.
pub fn random_secret(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

/// Opaque URL-safe token of `n` random bytes (no padding).
pub fn random_token(n: usize) -> String {
    general_purpose::URL_SAFE_NO_PAD.encode(random_secret(n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn new_id_is_uuid_shaped() {
        let id = new_id();
        assert_eq!(id.len(), 36);
        assert_eq!(id.matches('-').count(), 4);
    }

    #[test]
    fn new_id_unique() {
        let ids: HashSet<String> = (0..1000).map(|_| new_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn random_secret_length() {
        assert_eq!(random_secret(32).len(), 32);
        assert_eq!(random_secret(0).len(), 0);
    }

    #[test]
    fn random_secret_unique() {
        assert_ne!(random_secret(16), random_secret(16));
    }

    #[test]
    fn random_token_urlsafe() {
        let t = random_token(32);
        assert!(!t.is_empty());
        assert!(t.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
