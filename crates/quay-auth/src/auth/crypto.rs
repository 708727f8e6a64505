//! Secret-at-rest envelopes.
//!
//! TOTP secrets and the directory bind password are stored as AES-256-GCM
//! envelopes. The key is derived once per process from the configured
//! master secret with PBKDF2-HMAC-SHA256; each envelope carries its own
//! random nonce.

use crate::auth::error::{AuthError, AuthResult};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
/// Derivation count for the process-lifetime key (done once at boot).
const PBKDF2_ITERATIONS: u32 = 100_000;
/// Context string keeping this derivation distinct from any other use of
/// the master secret.
const CONTEXT_SALT: &[u8] = b"quaynas.secretbox.v1";

/// Envelope stored in a TEXT column.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    nonce: String,
    ciphertext: String,
}

/// Process-wide encryptor for small secrets.
#[derive(Clone)]
pub struct SecretBox {
    key: [u8; KEY_LEN],
}

impl SecretBox {
    pub fn new(master_secret: &str) -> Self {
        let mut key = [0u8; KEY_LEN];
        pbkdf2::pbkdf2_hmac::<sha2::Sha256>(
            master_secret.as_bytes(),
            CONTEXT_SALT,
            PBKDF2_ITERATIONS,
            &mut key,
        );
        Self { key }
    }

    pub fn seal(&self, plaintext: &str) -> AuthResult<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| AuthError::crypto("AES init failed").with_detail(e.to_string()))?;
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|e| AuthError::crypto("Encryption failed").with_detail(e.to_string()))?;
        let envelope = Envelope {
            version: 1,
            nonce: hex::encode(nonce),
            ciphertext: hex::encode(ciphertext),
        };
        serde_json::to_string(&envelope)
            .map_err(|e| AuthError::crypto("Envelope serialise failed").with_detail(e.to_string()))
    }

    pub fn open(&self, envelope_json: &str) -> AuthResult<String> {
        let envelope: Envelope = serde_json::from_str(envelope_json)
            .map_err(|e| AuthError::crypto("Invalid secret envelope").with_detail(e.to_string()))?;
        let nonce_bytes = hex::decode(&envelope.nonce)
            .map_err(|e| AuthError::crypto("Bad nonce hex").with_detail(e.to_string()))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(AuthError::crypto("Bad nonce length"));
        }
        let ciphertext = hex::decode(&envelope.ciphertext)
            .map_err(|e| AuthError::crypto("Bad ciphertext hex").with_detail(e.to_string()))?;
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| AuthError::crypto("AES init failed").with_detail(e.to_string()))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| AuthError::crypto("Decryption failed"))?;
        String::from_utf8(plaintext)
            .map_err(|e| AuthError::crypto("Plaintext not UTF-8").with_detail(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let sb = SecretBox::new("master-secret");
        let sealed = sb.seal("JBSWY3DPEHPK3PXP").unwrap();
        assert_ne!(sealed, "JBSWY3DPEHPK3PXP");
        assert_eq!(sb.open(&sealed).unwrap(), "JBSWY3DPEHPK3PXP");
    }

    #[test]
    fn each_seal_is_unique() {
        let sb = SecretBox::new("master");
        assert_ne!(sb.seal("same").unwrap(), sb.seal("same").unwrap());
    }

    #[test]
    fn wrong_master_fails() {
        let sealed = SecretBox::new("right").seal("secret").unwrap();
        assert!(SecretBox::new("wrong").open(&sealed).is_err());
    }

    #[test]
    fn garbage_envelope_fails() {
        let sb = SecretBox::new("m");
        assert!(sb.open("not json").is_err());
        assert!(sb.open("{\"version\":1,\"nonce\":\"zz\",\"ciphertext\":\"\"}").is_err());
    }
}
