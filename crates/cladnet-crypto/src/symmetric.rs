//! ChaCha20-Poly1305 bulk cipher
//!
//! A [`SymmetricKey`] holds the keyed cipher rather than the key bytes, so a
//! session pays the key schedule once and then seals straight into the
//! outgoing datagram buffer.

use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Tag};
use rand::RngCore;
use zeroize::Zeroize;

use crate::constants::{AUTH_TAG_SIZE, NONCE_SIZE, SYMMETRIC_KEY_SIZE};
use crate::error::{CryptoError, CryptoResult};

type CipherNonce = chacha20poly1305::Nonce;

/// A keyed ChaCha20-Poly1305 instance
#[derive(Clone)]
pub struct SymmetricKey {
    cipher: ChaCha20Poly1305,
}

impl SymmetricKey {
    /// Key the cipher and wipe `bytes`
    pub fn from_bytes(mut bytes: [u8; SYMMETRIC_KEY_SIZE]) -> Self {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&bytes));
        bytes.zeroize();
        Self { cipher }
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; SYMMETRIC_KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }

    /// Append `ciphertext || tag` for `plaintext` to `out`
    pub fn seal_into(
        &self,
        nonce: &Nonce,
        plaintext: &[u8],
        aad: &[u8],
        out: &mut Vec<u8>,
    ) -> CryptoResult<()> {
        let start = out.len();
        out.reserve(plaintext.len() + AUTH_TAG_SIZE);
        out.extend_from_slice(plaintext);

        match self
            .cipher
            .encrypt_in_place_detached(nonce.cipher_nonce(), aad, &mut out[start..])
        {
            Ok(tag) => {
                out.extend_from_slice(&tag);
                Ok(())
            }
            Err(_) => {
                out.truncate(start);
                Err(CryptoError::EncryptionFailed(format!(
                    "{} byte plaintext rejected by the cipher",
                    plaintext.len()
                )))
            }
        }
    }

    /// Authenticate and decrypt `ciphertext || tag`
    pub fn open(&self, nonce: &Nonce, sealed: &[u8], aad: &[u8]) -> CryptoResult<Vec<u8>> {
        let body_len = sealed
            .len()
            .checked_sub(AUTH_TAG_SIZE)
            .ok_or(CryptoError::DecryptionFailed)?;
        let (body, tag) = sealed.split_at(body_len);

        let mut plaintext = body.to_vec();
        self.cipher
            .decrypt_in_place_detached(nonce.cipher_nonce(), aad, &mut plaintext, Tag::from_slice(tag))
            .map_err(|_| CryptoError::DecryptionFailed)?;
        Ok(plaintext)
    }
}

/// 96-bit ChaCha20-Poly1305 nonce
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Random nonce. Sessions rotate long before random nonces risk colliding.
    pub fn generate() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    fn cipher_nonce(&self) -> &CipherNonce {
        CipherNonce::from_slice(&self.0)
    }
}

impl TryFrom<&[u8]> for Nonce {
    type Error = CryptoError;

    fn try_from(slice: &[u8]) -> CryptoResult<Self> {
        slice
            .try_into()
            .map(Self)
            .map_err(|_| CryptoError::InvalidNonceLength {
                expected: NONCE_SIZE,
                actual: slice.len(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed(key: &SymmetricKey, nonce: &Nonce, plaintext: &[u8], aad: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        key.seal_into(nonce, plaintext, aad, &mut out).unwrap();
        out
    }

    #[test]
    fn test_seal_appends_after_header() {
        let key = SymmetricKey::generate();
        let nonce = Nonce::generate();

        let mut out = b"header".to_vec();
        key.seal_into(&nonce, b"Secret data", b"ephemeral", &mut out)
            .unwrap();

        assert_eq!(&out[..6], b"header");
        assert_eq!(out.len(), 6 + 11 + AUTH_TAG_SIZE);
        assert_eq!(key.open(&nonce, &out[6..], b"ephemeral").unwrap(), b"Secret data");
    }

    #[test]
    fn test_aad_is_authenticated() {
        let key = SymmetricKey::generate();
        let nonce = Nonce::generate();
        let ciphertext = sealed(&key, &nonce, b"Secret data", b"ephemeral");

        assert!(matches!(
            key.open(&nonce, &ciphertext, b"other"),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_other_key_or_nonce_fails() {
        let key = SymmetricKey::generate();
        let nonce = Nonce::generate();
        let ciphertext = sealed(&key, &nonce, b"Test message", b"");

        assert!(SymmetricKey::generate().open(&nonce, &ciphertext, b"").is_err());
        assert!(key.open(&Nonce::generate(), &ciphertext, b"").is_err());
    }

    #[test]
    fn test_flipped_bit_fails() {
        let key = SymmetricKey::generate();
        let nonce = Nonce::generate();
        let mut ciphertext = sealed(&key, &nonce, b"Test message", b"");
        ciphertext[3] ^= 0x01;

        assert!(key.open(&nonce, &ciphertext, b"").is_err());
    }

    #[test]
    fn test_shorter_than_tag_fails() {
        let key = SymmetricKey::generate();
        let nonce = Nonce::generate();

        assert!(matches!(
            key.open(&nonce, &[0u8; AUTH_TAG_SIZE - 1], b""),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_nonce_length_checked() {
        assert!(Nonce::try_from(&[0u8; NONCE_SIZE][..]).is_ok());
        assert!(matches!(
            Nonce::try_from(&[0u8; 8][..]),
            Err(CryptoError::InvalidNonceLength { expected: 12, actual: 8 })
        ));
    }
}
