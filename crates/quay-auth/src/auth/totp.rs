//! TOTP second factor: RFC 4226 (HOTP) / RFC 6238 (TOTP), SHA-1,
//! 6 digits, 30-second step. Also backup recovery codes.

use crate::auth::error::{AuthError, AuthResult};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Time step in seconds.
pub const PERIOD: u64 = 30;
/// Code length.
pub const DIGITS: u8 = 6;
/// Steps checked on either side of now.
pub const DRIFT_WINDOW: u64 = 1;

// ── Code generation ──────────────────────────────────────────────────

/// HOTP for raw key bytes and a counter (RFC 4226 §5.3).
pub fn hotp_raw(key: &[u8], counter: u64) -> String {
    let mut mac =
        Hmac::<Sha1>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = ((digest[offset] as u32 & 0x7f) << 24)
        | ((digest[offset + 1] as u32) << 16)
        | ((digest[offset + 2] as u32) << 8)
        | (digest[offset + 3] as u32);
    let code = binary % 10u32.pow(DIGITS as u32);
    format!("{:0>width$}", code, width = DIGITS as usize)
}

/// TOTP code for a base-32 secret at an explicit unix timestamp.
pub fn generate_at(secret_b32: &str, unix_seconds: u64) -> AuthResult<String> {
    let key = decode_secret(secret_b32)?;
    Ok(hotp_raw(&key, unix_seconds / PERIOD))
}

/// Verify a code at an explicit timestamp with the ±1 step tolerance.
pub fn verify_at(secret_b32: &str, code: &str, unix_seconds: u64) -> AuthResult<bool> {
    if code.len() != DIGITS as usize || !code.chars().all(|c| c.is_ascii_digit()) {
        return Ok(false);
    }
    let key = decode_secret(secret_b32)?;
    let step = unix_seconds / PERIOD;
    let start = step.saturating_sub(DRIFT_WINDOW);
    for candidate in start..=step + DRIFT_WINDOW {
        if constant_time_eq(hotp_raw(&key, candidate).as_bytes(), code.as_bytes()) {
            return Ok(true);
        }
    }
    Ok(false)
}

// ── Secret handling ──────────────────────────────────────────────────

/// Decode a base-32 secret (spaces/dashes tolerated, case-insensitive).
pub fn decode_secret(b32: &str) -> AuthResult<Vec<u8>> {
    let cleaned = b32.replace([' ', '-'], "").to_uppercase();
    base32::decode(base32::Alphabet::Rfc4648 { padding: false }, &cleaned)
        .ok_or_else(|| AuthError::validation("Invalid base-32 TOTP secret"))
}

/// Generate a fresh 20-byte secret, base-32 encoded without padding.
pub fn generate_secret() -> String {
    base32::encode(
        base32::Alphabet::Rfc4648 { padding: false },
        &quay_core::random_secret(20),
    )
}

/// otpauth:// provisioning URI for authenticator apps.
pub fn otpauth_uri(username: &str, secret_b32: &str) -> String {
    format!(
        "otpauth://totp/QuayNAS:{}?secret={}&issuer=QuayNAS&digits={}&period={}",
        username, secret_b32, DIGITS, PERIOD
    )
}

// ── Backup codes ─────────────────────────────────────────────────────

const BACKUP_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// One backup code, `XXXX-XXXX` over an ambiguity-free alphabet.
pub fn generate_backup_code() -> String {
    let bytes = quay_core::random_secret(8);
    let chars: String = bytes
        .iter()
        .map(|b| BACKUP_ALPHABET[(*b as usize) % BACKUP_ALPHABET.len()] as char)
        .collect();
    format!("{}-{}", &chars[..4], &chars[4..])
}

pub fn generate_backup_codes(count: usize) -> Vec<String> {
    (0..count).map(|_| generate_backup_code()).collect()
}

/// Canonical form used for hashing and lookup.
pub fn normalize_backup_code(code: &str) -> String {
    code.replace([' ', '-'], "").to_uppercase()
}

/// SHA-256 hex of the normalised code; only the hash is stored.
pub fn hash_backup_code(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_backup_code(code).as_bytes());
    hex::encode(hasher.finalize())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 4226 Appendix D secret "12345678901234567890" in base-32.
    const RFC_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    #[test]
    fn rfc4226_hotp_vectors() {
        let expected = [
            "755224", "287082", "359152", "969429", "338314",
            "254676", "287922", "162583", "399871", "520489",
        ];
        let key = decode_secret(RFC_SECRET).unwrap();
        for (counter, exp) in expected.iter().enumerate() {
            assert_eq!(&hotp_raw(&key, counter as u64), exp);
        }
    }

    #[test]
    fn totp_at_t59_is_step_one() {
        // Step 1 of the RFC secret, six digits.
        assert_eq!(generate_at(RFC_SECRET, 59).unwrap(), "287082");
    }

    #[test]
    fn verify_exact() {
        assert!(verify_at(RFC_SECRET, "287082", 59).unwrap());
        assert!(!verify_at(RFC_SECRET, "000000", 59).unwrap());
    }

    #[test]
    fn verify_accepts_adjacent_steps() {
        // Code for step 0 still accepted at step 1 (drift -1)...
        assert!(verify_at(RFC_SECRET, "755224", 59).unwrap());
        // ...and code for step 2 accepted at step 1 (drift +1).
        let next = generate_at(RFC_SECRET, 60).unwrap();
        assert!(verify_at(RFC_SECRET, &next, 59).unwrap());
    }

    #[test]
    fn verify_rejects_two_steps_away() {
        let far = generate_at(RFC_SECRET, 150).unwrap();
        assert!(!verify_at(RFC_SECRET, &far, 59).unwrap());
    }

    #[test]
    fn verify_rejects_malformed_codes() {
        assert!(!verify_at(RFC_SECRET, "12345", 59).unwrap());
        assert!(!verify_at(RFC_SECRET, "1234567", 59).unwrap());
        assert!(!verify_at(RFC_SECRET, "28708a", 59).unwrap());
    }

    #[test]
    fn generated_secret_round_trips() {
        let secret = generate_secret();
        assert_eq!(decode_secret(&secret).unwrap().len(), 20);
        // Tolerant decoding.
        let spaced = format!("{} {}", &secret[..8], &secret[8..]);
        assert_eq!(
            decode_secret(&spaced).unwrap(),
            decode_secret(&secret).unwrap()
        );
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_secret("!!!").is_err());
    }

    #[test]
    fn otpauth_uri_shape() {
        let uri = otpauth_uri("alice", "ABC234");
        assert!(uri.starts_with("otpauth://totp/QuayNAS:alice?"));
        assert!(uri.contains("secret=ABC234"));
        assert!(uri.contains("period=30"));
    }

    #[test]
    fn backup_code_shape() {
        let code = generate_backup_code();
        assert_eq!(code.len(), 9);
        assert_eq!(&code[4..5], "-");
        // No ambiguous characters.
        assert!(!code.contains('O') && !code.contains('0') && !code.contains('I'));
    }

    #[test]
    fn backup_code_hash_is_format_insensitive() {
        assert_eq!(hash_backup_code("abcd-efgh"), hash_backup_code("ABCDEFGH"));
        assert_ne!(hash_backup_code("AAAA-AAAA"), hash_backup_code("AAAA-AAAB"));
    }

    #[test]
    fn backup_codes_are_distinct() {
        let codes = generate_backup_codes(10);
        let unique: std::collections::HashSet<_> = codes.iter().collect();
        assert_eq!(unique.len(), 10);
    }
}
