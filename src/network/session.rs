//! Session encryption
//!
//! The client generates a random AES-256 key, wraps it with the server's RSA key
//! (OAEP) and from then on encrypts every message with AES-256-GCM.
//!
//! Message format: `[12-byte random nonce][ciphertext + 16-byte tag]`

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPublicKey};
use sha1::Sha1;

use super::error::CryptoError;

/// Size of the symmetric key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of the nonce (96 bits for AES-GCM)
pub const NONCE_SIZE: usize = 12;

/// Size of the authentication tag (AES-GCM)
pub const TAG_SIZE: usize = 16;

/// Symmetric state for one connection attempt
pub struct Session {
    public_key: RsaPublicKey,
    key: [u8; KEY_SIZE],
    cipher: Aes256Gcm,
}

impl Session {
    /// Import the server's public key and generate a fresh session key
    pub fn new(server_public_key: &[u8]) -> Result<Self, CryptoError> {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self::from_key(key, server_public_key)
    }

    /// Build a session around a known key
    pub fn from_key(key: [u8; KEY_SIZE], server_public_key: &[u8]) -> Result<Self, CryptoError> {
        let public_key = import_public_key(server_public_key)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        Ok(Self {
            public_key,
            key,
            cipher,
        })
    }

    /// The session key wrapped with the server's public key
    pub fn encrypted_session_key(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(self
            .public_key
            .encrypt(&mut OsRng, Oaep::new::<Sha1>(), &self.key)?)
    }

    /// Encrypt with a fresh random nonce, returned in front of the ciphertext
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Authenticate and decrypt `[nonce][ciphertext]`
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::Truncated(data.len()));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_SIZE);

        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

/// Accepts PEM or DER, SubjectPublicKeyInfo or PKCS#1
fn import_public_key(bytes: &[u8]) -> Result<RsaPublicKey, CryptoError> {
    if let Ok(text) = std::str::from_utf8(bytes) {
        let text = text.trim();
        if text.starts_with("-----BEGIN") {
            return RsaPublicKey::from_public_key_pem(text)
                .or_else(|_| RsaPublicKey::from_pkcs1_pem(text))
                .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()));
        }
    }

    RsaPublicKey::from_public_key_der(bytes)
        .or_else(|_| RsaPublicKey::from_pkcs1_der(bytes))
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
}
