use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use thiserror::Error;

pub const NONCE_LEN: usize = 12;
pub const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption key must be {KEY_LEN} bytes, got {0}")]
    BadKeyLength(usize),

    #[error("ciphertext too short to contain a nonce")]
    CiphertextTooShort,

    #[error("decryption failed: ciphertext, key or AAD do not match")]
    DecryptionFailed,
}

/// A 32-byte AES-256-GCM key, held in memory only as long as needed.
#[derive(Clone)]
pub struct EncryptionKey(Box<[u8; KEY_LEN]>);

impl EncryptionKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::BadKeyLength(bytes.len()));
        }
        let mut buf = [0u8; KEY_LEN];
        buf.copy_from_slice(bytes);
        Ok(Self(Box::new(buf)))
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new_from_slice(self.0.as_slice()).expect("key length checked at construction")
    }
}

/// Encrypt `plaintext` under `key`, binding `aad`. The nonce is generated
/// randomly and stored alongside the ciphertext (nonce || ciphertext).
pub fn encrypt(key: &EncryptionKey, aad: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let cipher = key.cipher();
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .expect("AES-256-GCM encryption cannot fail for valid inputs");

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    out
}

/// Decrypt data produced by [`encrypt`]. Fails if `key` or `aad` do not
/// match what was used to encrypt, or if the ciphertext has been tampered
/// with (GCM's authentication tag will not verify).
pub fn decrypt(key: &EncryptionKey, aad: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_LEN {
        return Err(CryptoError::CiphertextTooShort);
    }
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    let cipher = key.cipher();

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)
}
