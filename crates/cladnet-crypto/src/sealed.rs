//! Packet sealing
//!
//! Encrypts a whole IP packet so that only the holder of the recipient's
//! static secret can read it.
//!
//! Wire format:
//! [Ephemeral public key: 32 bytes][Nonce: 12 bytes][Ciphertext + tag: variable]
//!
//! The sender draws one ephemeral X25519 key per recipient and derives a
//! ChaCha20-Poly1305 key from it, so the Diffie-Hellman cost is paid once per
//! session rather than once per packet. The ephemeral public key travels in
//! every datagram, which keeps each datagram self-contained.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::constants::{MAX_PACKETS_PER_SESSION, NONCE_SIZE, SEAL_OVERHEAD, X25519_KEY_SIZE};
use crate::error::{CryptoError, CryptoResult};
use crate::keys::{ephemeral_agreement, PublicKey, SecretKey};
use crate::symmetric::{Nonce, SymmetricKey};

const SESSION_INFO: &[u8] = b"cladnet:seal:v1";

/// Sender side of a sealing session towards one recipient
pub struct SealingSession {
    recipient: PublicKey,
    ephemeral_public: PublicKey,
    key: SymmetricKey,
    sealed: AtomicU64,
}

impl SealingSession {
    /// Start a new session for the recipient's static public key
    pub fn new(recipient: &PublicKey) -> CryptoResult<Self> {
        let (ephemeral_public, shared) = ephemeral_agreement(recipient)?;
        let key = shared.derive_key(&session_info(&ephemeral_public, recipient))?;

        Ok(Self {
            recipient: *recipient,
            ephemeral_public,
            key,
            sealed: AtomicU64::new(0),
        })
    }

    /// Recipient key this session was built for
    pub fn recipient(&self) -> &PublicKey {
        &self.recipient
    }

    /// Whether the session has sealed enough packets to be replaced
    pub fn is_exhausted(&self) -> bool {
        self.sealed.load(Ordering::Relaxed) >= MAX_PACKETS_PER_SESSION
    }

    /// Seal one packet
    pub fn seal(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let nonce = Nonce::generate();
        let ephemeral = self.ephemeral_public.as_bytes();

        let mut out = Vec::with_capacity(SEAL_OVERHEAD + plaintext.len());
        out.extend_from_slice(ephemeral);
        out.extend_from_slice(nonce.as_bytes());
        self.key.seal_into(&nonce, plaintext, ephemeral, &mut out)?;

        self.sealed.fetch_add(1, Ordering::Relaxed);
        Ok(out)
    }
}

/// The parts of a sealed datagram
pub struct SealedParts<'a> {
    pub ephemeral_public: PublicKey,
    pub nonce: Nonce,
    pub ciphertext: &'a [u8],
}

/// Split a sealed datagram into its header fields and ciphertext
pub fn split(datagram: &[u8]) -> CryptoResult<SealedParts<'_>> {
    if datagram.len() < SEAL_OVERHEAD {
        return Err(CryptoError::MalformedCiphertext(format!(
            "{} bytes is shorter than the {} byte seal overhead",
            datagram.len(),
            SEAL_OVERHEAD
        )));
    }

    let (ephemeral, rest) = datagram.split_at(X25519_KEY_SIZE);
    let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);

    Ok(SealedParts {
        ephemeral_public: PublicKey::try_from(ephemeral)?,
        nonce: Nonce::try_from(nonce)?,
        ciphertext,
    })
}

/// Derive the receiving key for a session opened by `ephemeral_public`
pub fn receiving_key(secret: &SecretKey, ephemeral_public: &PublicKey) -> CryptoResult<SymmetricKey> {
    secret
        .agree(ephemeral_public)?
        .derive_key(&session_info(ephemeral_public, &secret.public_key()))
}

/// Decrypt the ciphertext of a split datagram with an already derived key
pub fn open_parts(key: &SymmetricKey, parts: &SealedParts<'_>) -> CryptoResult<Vec<u8>> {
    key.open(
        &parts.nonce,
        parts.ciphertext,
        parts.ephemeral_public.as_bytes(),
    )
}

/// One-shot seal under a fresh session
pub fn seal(recipient: &PublicKey, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    SealingSession::new(recipient)?.seal(plaintext)
}

/// One-shot open with the recipient's static secret
pub fn open(secret: &SecretKey, datagram: &[u8]) -> CryptoResult<Vec<u8>> {
    let parts = split(datagram)?;
    let key = receiving_key(secret, &parts.ephemeral_public)?;
    open_parts(&key, &parts)
}

fn session_info(ephemeral_public: &PublicKey, recipient: &PublicKey) -> Vec<u8> {
    let mut info = Vec::with_capacity(SESSION_INFO.len() + 2 * X25519_KEY_SIZE);
    info.extend_from_slice(SESSION_INFO);
    info.extend_from_slice(ephemeral_public.as_bytes());
    info.extend_from_slice(recipient.as_bytes());
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;

    #[test]
    fn test_seal_open_every_packet_size() {
        let recipient = KeyPair::generate();
        let session = SealingSession::new(&recipient.public).unwrap();

        for len in [0usize, 1, 20, 576, 1300, 1500, 9000, 65_535 - SEAL_OVERHEAD] {
            let packet: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let sealed = session.seal(&packet).unwrap();

            assert_eq!(sealed.len(), packet.len() + SEAL_OVERHEAD);
            assert_eq!(open(&recipient.secret, &sealed).unwrap(), packet);
        }
    }

    #[test]
    fn test_session_reuses_ephemeral_key() {
        let recipient = KeyPair::generate();
        let session = SealingSession::new(&recipient.public).unwrap();

        let first = session.seal(b"one").unwrap();
        let second = session.seal(b"two").unwrap();

        assert_eq!(first[..X25519_KEY_SIZE], second[..X25519_KEY_SIZE]);
        // Nonces differ
        assert_ne!(
            first[X25519_KEY_SIZE..X25519_KEY_SIZE + NONCE_SIZE],
            second[X25519_KEY_SIZE..X25519_KEY_SIZE + NONCE_SIZE]
        );
    }

    #[test]
    fn test_wrong_recipient_cannot_open() {
        let recipient = KeyPair::generate();
        let eavesdropper = KeyPair::generate();

        let sealed = seal(&recipient.public, b"for the recipient only").unwrap();

        assert!(matches!(
            open(&eavesdropper.secret, &sealed),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_swapped_ephemeral_key_fails() {
        let recipient = KeyPair::generate();
        let mut sealed = seal(&recipient.public, b"payload").unwrap();

        let other = KeyPair::generate();
        sealed[..X25519_KEY_SIZE].copy_from_slice(other.public.as_bytes());

        assert!(open(&recipient.secret, &sealed).is_err());
    }

    #[test]
    fn test_truncated_datagram_rejected() {
        let recipient = KeyPair::generate();

        assert!(matches!(
            open(&recipient.secret, &[0u8; SEAL_OVERHEAD - 1]),
            Err(CryptoError::MalformedCiphertext(_))
        ));
    }

    #[test]
    fn test_low_order_recipient_rejected() {
        let zero = PublicKey::from([0u8; X25519_KEY_SIZE]);

        assert!(matches!(
            SealingSession::new(&zero),
            Err(CryptoError::InvalidPublicKey)
        ));
    }
}
