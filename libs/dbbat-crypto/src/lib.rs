//! Cryptographic primitives consumed by the proxy: AES-256-GCM for target
//! database credentials at rest, and Argon2id for client password hashes.

mod aad;
mod cache;
mod gcm;
mod hash;

pub use aad::database_aad;
pub use cache::PasswordVerifyCache;
pub use gcm::{decrypt, encrypt, CryptoError, EncryptionKey};
pub use hash::{hash_password, verify_password, HashError};
