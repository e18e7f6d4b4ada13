//! Crypto error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid nonce length: expected {expected}, got {actual}")]
    InvalidNonceLength { expected: usize, actual: usize },

    /// Key text is not base64
    #[error("Invalid key encoding: {0}")]
    InvalidEncoding(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Wrong key, wrong recipient or tampered datagram; indistinguishable on purpose
    #[error("Decryption failed: authentication or integrity check failed")]
    DecryptionFailed,

    /// Sealed datagram shorter than its fixed header and tag
    #[error("Malformed sealed datagram: {0}")]
    MalformedCiphertext(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    /// Low-order or otherwise non-contributory X25519 point
    #[error("Invalid public key")]
    InvalidPublicKey,

    /// Sealing was asked for a host whose key is not in the keyring
    #[error("No public key known for peer {0}")]
    UnknownPeer(String),

    #[error("Key storage error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CryptoResult<T> = Result<T, CryptoError>;
