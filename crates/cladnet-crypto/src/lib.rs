//! CLADNet Cryptographic Primitives
//!
//! This crate provides the cryptographic side of the tunneling agent:
//! - Host key pairs (X25519)
//! - Symmetric encryption (ChaCha20-Poly1305)
//! - Sealing whole packets for a single peer
//! - Key manager with on-disk persistence and the peer keyring

pub mod error;
pub mod keyring;
pub mod keys;
pub mod sealed;
pub mod symmetric;

pub use error::{CryptoError, CryptoResult};
pub use keyring::KeyManager;
pub use keys::{ephemeral_agreement, KeyPair, PublicKey, SecretKey, SharedSecret};
pub use sealed::{open, seal, SealingSession};
pub use symmetric::{Nonce, SymmetricKey};

/// Protocol constants
pub mod constants {
    /// X25519 key size in bytes
    pub const X25519_KEY_SIZE: usize = 32;

    /// ChaCha20-Poly1305 key size
    pub const SYMMETRIC_KEY_SIZE: usize = 32;

    /// ChaCha20-Poly1305 nonce size
    pub const NONCE_SIZE: usize = 12;

    /// Poly1305 authentication tag size
    pub const AUTH_TAG_SIZE: usize = 16;

    /// Bytes a sealed datagram adds on top of the plaintext packet
    pub const SEAL_OVERHEAD: usize = X25519_KEY_SIZE + NONCE_SIZE + AUTH_TAG_SIZE;

    /// Packets sealed under one sender session before a fresh ephemeral key is drawn
    pub const MAX_PACKETS_PER_SESSION: u64 = 1 << 24;
}
