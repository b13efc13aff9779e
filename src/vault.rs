//! Credential vault - authenticated encryption for the stored provider token
//!
//! The access token is the only secret this crate persists. It is sealed with
//! ChaCha20-Poly1305 under a key derived from one long-lived process secret and
//! stored as a base64 envelope: `version || nonce || ciphertext+tag`.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

use crate::config::Config;

const ENVELOPE_VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Why a ciphertext could not be opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptFailure {
    /// No encryption secret is configured
    KeyMissing,
    /// Not a valid envelope (bad base64, truncated, unknown version)
    Malformed,
    /// Authentication failed, usually because another key sealed it
    WrongKey,
}

impl fmt::Display for DecryptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            DecryptFailure::KeyMissing => "encryption secret is not configured",
            DecryptFailure::Malformed => "ciphertext is malformed",
            DecryptFailure::WrongKey => "ciphertext was sealed with a different key",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VaultError {
    #[error("encryption secret is not configured")]
    MissingKey,
    #[error("encryption failed")]
    Encryption,
    #[error("stored credential could not be decrypted: {0}")]
    Decryption(DecryptFailure),
}

/// Seals and opens the provider credential
#[derive(Clone)]
pub struct TokenVault {
    key: Option<[u8; 32]>,
}

impl fmt::Debug for TokenVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenVault")
            .field("keyed", &self.key.is_some())
            .finish()
    }
}

impl TokenVault {
    /// Build a vault from the raw secret; `None` or blank leaves it unkeyed
    pub fn new(secret: Option<&str>) -> Self {
        let key = secret
            .filter(|s| !s.trim().is_empty())
            .map(|s| derive_key(s.as_bytes()));
        Self { key }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.security.encryption_secret.as_deref())
    }

    pub fn is_keyed(&self) -> bool {
        self.key.is_some()
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let key = self.key.as_ref().ok_or(VaultError::MissingKey)?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| VaultError::Encryption)?;

        let mut envelope = Vec::with_capacity(1 + NONCE_LEN + sealed.len());
        envelope.push(ENVELOPE_VERSION);
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&sealed);

        Ok(BASE64_STANDARD.encode(envelope))
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<String, VaultError> {
        let key = self
            .key
            .as_ref()
            .ok_or(VaultError::Decryption(DecryptFailure::KeyMissing))?;

        let envelope = BASE64_STANDARD
            .decode(ciphertext.trim())
            .map_err(|_| VaultError::Decryption(DecryptFailure::Malformed))?;

        if envelope.len() < 1 + NONCE_LEN + TAG_LEN || envelope[0] != ENVELOPE_VERSION {
            return Err(VaultError::Decryption(DecryptFailure::Malformed));
        }

        let (nonce, sealed) = envelope[1..].split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| VaultError::Decryption(DecryptFailure::WrongKey))?;

        String::from_utf8(plaintext).map_err(|_| VaultError::Decryption(DecryptFailure::Malformed))
    }
}

fn derive_key(secret: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    key.copy_from_slice(&Sha256::digest(secret));
    key
}
