//! Host identity keys
//!
//! Every host owns one static X25519 key pair. Peers learn the public half
//! as base64 through the control plane, and seal packets to it that only
//! this host can open.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, StaticSecret};
use zeroize::Zeroizing;

use crate::constants::{SYMMETRIC_KEY_SIZE, X25519_KEY_SIZE};
use crate::error::{CryptoError, CryptoResult};
use crate::symmetric::SymmetricKey;

/// A peer's public key. Displays and parses as base64.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; X25519_KEY_SIZE]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; X25519_KEY_SIZE] {
        &self.0
    }

    fn point(&self) -> x25519_dalek::PublicKey {
        x25519_dalek::PublicKey::from(self.0)
    }
}

impl From<[u8; X25519_KEY_SIZE]> for PublicKey {
    fn from(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        Self(bytes)
    }
}

impl From<x25519_dalek::PublicKey> for PublicKey {
    fn from(point: x25519_dalek::PublicKey) -> Self {
        Self(point.to_bytes())
    }
}

impl TryFrom<&[u8]> for PublicKey {
    type Error = CryptoError;

    fn try_from(slice: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; X25519_KEY_SIZE] =
            slice.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                expected: X25519_KEY_SIZE,
                actual: slice.len(),
            })?;
        Ok(Self(bytes))
    }
}

impl FromStr for PublicKey {
    type Err = CryptoError;

    fn from_str(s: &str) -> CryptoResult<Self> {
        let decoded = decode_base64(s)?;
        Self::try_from(decoded.as_slice())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&BASE64.encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = self.to_string();
        write!(f, "PublicKey({}..)", &encoded[..8])
    }
}

/// Long-term secret half of a host key pair
#[derive(Clone)]
pub struct SecretKey(StaticSecret);

impl SecretKey {
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(OsRng))
    }

    pub fn public_key(&self) -> PublicKey {
        x25519_dalek::PublicKey::from(&self.0).into()
    }

    /// Agree on a secret with the holder of `peer`
    ///
    /// Fails for low-order points, which would make the result predictable.
    pub fn agree(&self, peer: &PublicKey) -> CryptoResult<SharedSecret> {
        SharedSecret::checked(self.0.diffie_hellman(&peer.point()))
    }

    /// Base64 form written to the private key file
    pub fn export(&self) -> Zeroizing<String> {
        let bytes = Zeroizing::new(self.0.to_bytes());
        Zeroizing::new(BASE64.encode(bytes.as_slice()))
    }
}

impl FromStr for SecretKey {
    type Err = CryptoError;

    fn from_str(s: &str) -> CryptoResult<Self> {
        let decoded = Zeroizing::new(decode_base64(s)?);
        let bytes: [u8; X25519_KEY_SIZE] =
            decoded
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: X25519_KEY_SIZE,
                    actual: decoded.len(),
                })?;
        Ok(Self(StaticSecret::from(bytes)))
    }
}

/// A host key pair
#[derive(Clone)]
pub struct KeyPair {
    pub secret: SecretKey,
    pub public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_secret(SecretKey::generate())
    }

    pub fn from_secret(secret: SecretKey) -> Self {
        let public = secret.public_key();
        Self { secret, public }
    }
}

/// Draw a single-use key and agree on a secret with `recipient`
///
/// Returns the ephemeral public key the recipient needs to repeat the
/// agreement on its side.
pub fn ephemeral_agreement(recipient: &PublicKey) -> CryptoResult<(PublicKey, SharedSecret)> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(x25519_dalek::PublicKey::from(&ephemeral));
    let shared = SharedSecret::checked(ephemeral.diffie_hellman(&recipient.point()))?;
    Ok((ephemeral_public, shared))
}

/// Output of an X25519 agreement, wiped on drop
pub struct SharedSecret(Zeroizing<[u8; SYMMETRIC_KEY_SIZE]>);

impl SharedSecret {
    fn checked(shared: x25519_dalek::SharedSecret) -> CryptoResult<Self> {
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidPublicKey);
        }
        Ok(Self(Zeroizing::new(shared.to_bytes())))
    }

    /// Expand into a cipher key with HKDF-SHA256, bound to `info`
    pub fn derive_key(&self, info: &[u8]) -> CryptoResult<SymmetricKey> {
        let mut okm = [0u8; SYMMETRIC_KEY_SIZE];
        Hkdf::<Sha256>::new(None, self.0.as_slice())
            .expand(info, &mut okm)
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
        Ok(SymmetricKey::from_bytes(okm))
    }

    #[cfg(test)]
    fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }
}

fn decode_base64(encoded: &str) -> CryptoResult<Vec<u8>> {
    BASE64
        .decode(encoded.trim())
        .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))
}
