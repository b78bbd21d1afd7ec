//! Channel secret encryption
//!
//! Notification channel secrets (bot tokens, webhook URLs) are stored as
//! AES-256-GCM blobs: a random 12 byte nonce followed by ciphertext and tag.
//! They are decrypted right before a send and dropped afterwards.

use std::fmt;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The blob is shorter than nonce plus tag
    Truncated(usize),

    /// Authentication failed (wrong key or tampered blob)
    Decrypt,

    Encrypt,

    /// The plaintext is not valid UTF-8
    Encoding,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::Truncated(len) => write!(f, "encrypted secret too short ({len} bytes)"),
            CryptoError::Decrypt => write!(f, "failed to decrypt secret"),
            CryptoError::Encrypt => write!(f, "failed to encrypt secret"),
            CryptoError::Encoding => write!(f, "decrypted secret is not valid UTF-8"),
        }
    }
}

impl std::error::Error for CryptoError {}

/// A decrypted secret
///
/// Its `Debug` output is redacted so it can't leak through `{:?}` in logs.
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

pub trait Encryptor: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>, CryptoError>;

    fn decrypt(&self, blob: &[u8]) -> Result<Secret, CryptoError>;
}

/// AES-256-GCM keyed by the SHA-256 digest of a passphrase
#[derive(Clone)]
pub struct AesGcmEncryptor {
    cipher: Aes256Gcm,
}

impl AesGcmEncryptor {
    pub fn from_passphrase(passphrase: &str) -> Self {
        let key = Sha256::digest(passphrase.as_bytes());
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }
}

impl Encryptor for AesGcmEncryptor {
    fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::Encrypt)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decrypt(&self, blob: &[u8]) -> Result<Secret, CryptoError> {
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Truncated(blob.len()));
        }

        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)?;

        String::from_utf8(plaintext)
            .map(Secret)
            .map_err(|_| CryptoError::Encoding)
    }
}
