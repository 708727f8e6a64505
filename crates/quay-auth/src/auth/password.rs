//! Password hashing and verification.
//!
//! bcrypt with the default cost. Verification is CPU-bound; the service
//! layer runs it on the blocking pool and applies the constant timing
//! floor around the whole lookup-plus-verify sequence.

use crate::auth::error::AuthResult;
use bcrypt::{hash, verify, DEFAULT_COST};

/// Hash a password for storage.
pub fn hash_password(password: &str) -> AuthResult<String> {
    Ok(hash(password, DEFAULT_COST)?)
}

/// Verify a password against a stored bcrypt verifier.
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    verify(password, stored_hash).unwrap_or(false)
}

/// A verifier that can never match any password, used for the dummy
/// verification on the unknown-user path so the work factor is identical.
pub fn unusable_hash() -> AuthResult<String> {
    // 33 random bytes so the base64 form can never be re-entered as a
    // password through any normal input path.
    let noise = quay_core::random_token(33);
    hash_password(&noise)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify() {
        let h = hash_password("s3cret-pass").unwrap();
        assert!(h.starts_with("$2"));
        assert!(verify_password("s3cret-pass", &h));
        assert!(!verify_password("wrong", &h));
    }

    #[test]
    fn hashes_are_salted() {
        let a = hash_password("same").unwrap();
        let b = hash_password("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn verify_garbage_hash_is_false() {
        assert!(!verify_password("x", "not-a-bcrypt-hash"));
    }

    #[test]
    fn unusable_hash_is_valid_bcrypt() {
        let h = unusable_hash().unwrap();
        assert!(h.starts_with("$2"));
        assert!(!verify_password("", &h));
        assert!(!verify_password("password", &h));
    }
}
