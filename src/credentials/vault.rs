//! AES-256-GCM vault for sealing credential tokens.
//!
//! Each seal uses a fresh random nonce, prepended to the ciphertext so a
//! sealed blob is a single opaque value. The master key is 32 bytes
//! (256 bits), loaded once at startup from the environment and injected
//! explicitly; it never appears in persisted records.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::error::BrokerError;

/// Size of the encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Authenticated-encryption boundary protecting secrets at rest.
///
/// `open(seal(x)) == x` for all byte strings `x`; opening a blob sealed
/// under a different key or tampered with fails with a `Decryption` error,
/// never returns garbage plaintext.
#[derive(Clone)]
pub struct Vault {
    cipher: Aes256Gcm,
}

impl Vault {
    /// Create a vault from a base64-encoded 32-byte master key.
    ///
    /// Fails with `Configuration` if the key is not valid base64 or not
    /// exactly 32 bytes. The key value itself never appears in the error.
    pub fn new(key_base64: &str) -> Result<Self, BrokerError> {
        let key_bytes = BASE64.decode(key_base64).map_err(|_| {
            BrokerError::Configuration("encryption key is not valid base64".to_string())
        })?;

        if key_bytes.len() != KEY_SIZE {
            return Err(BrokerError::Configuration(format!(
                "encryption key must be {} bytes (256 bits), got {}",
                KEY_SIZE,
                key_bytes.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|_| BrokerError::Configuration("failed to initialize cipher".to_string()))?;

        Ok(Self { cipher })
    }

    /// Encrypt plaintext, returning `nonce || ciphertext` as one blob.
    ///
    /// A cryptographically random nonce is generated per call and never
    /// reused.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, BrokerError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| BrokerError::Storage("failed to seal credential".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt a sealed blob produced by [`seal`](Self::seal).
    ///
    /// Fails with `Decryption` if the blob is truncated, was sealed under a
    /// different key, or has been tampered with (GCM tag mismatch).
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, BrokerError> {
        if sealed.len() < NONCE_SIZE {
            return Err(BrokerError::Decryption(
                "sealed blob too short to contain nonce".to_string(),
            ));
        }

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher.decrypt(nonce, ciphertext).map_err(|_| {
            BrokerError::Decryption("ciphertext failed authentication (wrong key or tampered)".to_string())
        })
    }
}
