//! Secret envelopes: AES-256-GCM with PBKDF2 key derivation.
//!
//! The master key is a passphrase; the AEAD key is derived once with
//! PBKDF2-SHA256 under a fixed context salt so envelopes stay
//! self-contained (ciphertext, nonce, tag). A `masterKeyCheck` envelope
//! sealing a known plaintext validates the passphrase at init time.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng, rand_core::RngCore},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use pbkdf2::pbkdf2_hmac_array;
use sha2::Sha256;

use crate::credential::model::Envelope;
use crate::error::{GantryError, Result};

/// Size of the nonce for AES-GCM (12 bytes)
const NONCE_SIZE: usize = 12;
/// Size of the GCM authentication tag (16 bytes)
const TAG_SIZE: usize = 16;
/// Number of PBKDF2 iterations
const PBKDF2_ITERATIONS: u32 = 100_000;
/// Size of the derived key (256 bits for AES-256)
const KEY_SIZE: usize = 32;
/// Context salt for key derivation. Envelopes carry no per-record salt,
/// so derivation must be deterministic per master key.
const KDF_SALT: &[u8] = b"gantry.credential.store.v1";
/// Known plaintext sealed into the master key check envelope.
const KEY_CHECK_PLAINTEXT: &[u8] = b"gantry-master-key-check";

const ALGORITHM: &str = "aes-256-gcm";

/// Symmetric cipher bound to one derived master key.
#[derive(Clone)]
pub struct SecretCipher {
    key: [u8; KEY_SIZE],
}

impl SecretCipher {
    pub fn new(master_key: &str) -> Self {
        Self {
            key: derive_key(master_key),
        }
    }

    /// Seal a plaintext into an envelope with a fresh random nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Envelope> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| GantryError::Crypto(format!("failed to create cipher: {e}")))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        // aes-gcm appends the tag to the ciphertext; split it back out
        // so the envelope stores them separately.
        let sealed = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| GantryError::Crypto(format!("encryption failed: {e:?}")))?;
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_SIZE);

        Ok(Envelope {
            ciphertext: BASE64.encode(ciphertext),
            nonce: BASE64.encode(nonce_bytes),
            tag: BASE64.encode(tag),
            algorithm: ALGORITHM.to_string(),
        })
    }

    /// Open an envelope. Fails on wrong key, corruption, or an unknown
    /// algorithm tag.
    pub fn open(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        if envelope.algorithm != ALGORITHM {
            return Err(GantryError::Crypto(format!(
                "unsupported envelope algorithm: {}",
                envelope.algorithm
            )));
        }

        let ciphertext = decode_field(&envelope.ciphertext, "ciphertext")?;
        let nonce_bytes = decode_field(&envelope.nonce, "nonce")?;
        let tag = decode_field(&envelope.tag, "tag")?;

        if nonce_bytes.len() != NONCE_SIZE {
            return Err(GantryError::Crypto("invalid nonce length".into()));
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| GantryError::Crypto(format!("failed to create cipher: {e}")))?;

        let mut sealed = ciphertext;
        sealed.extend_from_slice(&tag);

        cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), sealed.as_ref())
            .map_err(|_| GantryError::Crypto("decryption failed: wrong key or corrupted envelope".into()))
    }

    /// Produce the master key check envelope for a fresh store.
    pub fn key_check(&self) -> Result<Envelope> {
        self.seal(KEY_CHECK_PLAINTEXT)
    }

    /// Validate the master key against a stored check envelope.
    pub fn verify_check(&self, envelope: &Envelope) -> bool {
        matches!(self.open(envelope), Ok(plaintext) if plaintext == KEY_CHECK_PLAINTEXT)
    }
}

fn decode_field(value: &str, field: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(value)
        .map_err(|_| GantryError::Crypto(format!("invalid base64 in envelope {field}")))
}

/// Derive a 256-bit key from the master passphrase using PBKDF2-SHA256.
fn derive_key(master_key: &str) -> [u8; KEY_SIZE] {
    pbkdf2_hmac_array::<Sha256, KEY_SIZE>(master_key.as_bytes(), KDF_SALT, PBKDF2_ITERATIONS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let cipher = SecretCipher::new("test-master-key");
        let envelope = cipher.seal(b"api-token-12345").unwrap();

        assert_eq!(envelope.algorithm, "aes-256-gcm");
        let plaintext = cipher.open(&envelope).unwrap();
        assert_eq!(plaintext, b"api-token-12345");
    }

    #[test]
    fn seal_produces_different_envelopes_for_same_plaintext() {
        let cipher = SecretCipher::new("test-master-key");
        let a = cipher.seal(b"same secret").unwrap();
        let b = cipher.seal(b"same secret").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let cipher = SecretCipher::new("correct-key");
        let envelope = cipher.seal(b"secret").unwrap();

        let wrong = SecretCipher::new("wrong-key");
        assert!(matches!(
            wrong.open(&envelope),
            Err(GantryError::Crypto(_))
        ));
    }

    #[test]
    fn tampered_ciphertext_fails_to_open() {
        let cipher = SecretCipher::new("key");
        let mut envelope = cipher.seal(b"secret").unwrap();
        let mut bytes = BASE64.decode(&envelope.ciphertext).unwrap();
        bytes[0] ^= 0xff;
        envelope.ciphertext = BASE64.encode(bytes);

        assert!(cipher.open(&envelope).is_err());
    }

    #[test]
    fn key_check_validates_only_the_same_key() {
        let cipher = SecretCipher::new("master");
        let check = cipher.key_check().unwrap();

        assert!(cipher.verify_check(&check));
        assert!(!SecretCipher::new("other").verify_check(&check));
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        let cipher = SecretCipher::new("key");
        let mut envelope = cipher.seal(b"secret").unwrap();
        envelope.algorithm = "rot13".into();
        assert!(cipher.open(&envelope).is_err());
    }
}
