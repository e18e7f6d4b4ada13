//! Key Manager
//!
//! Owns this host's key pair and the keyring of peer public keys, and does
//! the sealing/opening of packets in the data path.
//!
//! The key pair is persisted under `<key_dir>/<host_id>/` so a restarted
//! agent keeps its identity. Regenerating it invalidates every peer's copy of
//! the public key until they learn the new one.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;

use crate::constants::X25519_KEY_SIZE;
use crate::error::{CryptoError, CryptoResult};
use crate::keys::{KeyPair, PublicKey, SecretKey};
use crate::sealed::{self, SealingSession};
use crate::symmetric::SymmetricKey;

/// File holding the base64 private key
pub const PRIVATE_KEY_FILE: &str = "private.key";

/// File holding the base64 public key
pub const PUBLIC_KEY_FILE: &str = "public.key";

/// Receiving keys cached before the cache is flushed
const MAX_RECEIVING_SESSIONS: usize = 1024;

/// Per-host key material and the peer keyring
pub struct KeyManager {
    host_id: String,
    keypair: KeyPair,
    /// host ID -> peer public key
    keyring: DashMap<String, PublicKey>,
    /// host ID -> sending session
    sending: DashMap<String, Arc<SealingSession>>,
    /// ephemeral public key -> receiving key
    receiving: DashMap<[u8; X25519_KEY_SIZE], SymmetricKey>,
}

impl KeyManager {
    /// Create a manager around an existing key pair
    pub fn new(host_id: impl Into<String>, keypair: KeyPair) -> Self {
        Self {
            host_id: host_id.into(),
            keypair,
            keyring: DashMap::new(),
            sending: DashMap::new(),
            receiving: DashMap::new(),
        }
    }

    /// Create a manager with a fresh, unpersisted key pair
    pub fn generate(host_id: impl Into<String>) -> Self {
        Self::new(host_id, KeyPair::generate())
    }

    /// Load the persisted key pair for `host_id`, or generate and persist one
    pub async fn load_or_generate(key_dir: &Path, host_id: &str) -> CryptoResult<Self> {
        let dir = Self::key_path(key_dir, host_id);
        let private_path = dir.join(PRIVATE_KEY_FILE);

        let keypair = if tokio::fs::try_exists(&private_path).await? {
            let encoded = tokio::fs::read_to_string(&private_path).await?;
            let keypair = KeyPair::from_secret(encoded.parse::<SecretKey>()?);

            // The private half is authoritative
            let public_path = dir.join(PUBLIC_KEY_FILE);
            let expected = keypair.public.to_string();
            let stored_public = tokio::fs::read_to_string(&public_path).await.ok();
            if stored_public.as_deref().map(str::trim) != Some(expected.as_str()) {
                tokio::fs::write(&public_path, expected).await?;
            }
            keypair
        } else {
            let keypair = KeyPair::generate();
            Self::persist(&dir, &keypair).await?;
            keypair
        };

        Ok(Self::new(host_id, keypair))
    }

    /// Directory holding the key files of `host_id`
    pub fn key_path(key_dir: &Path, host_id: &str) -> PathBuf {
        key_dir.join(host_id)
    }

    async fn persist(dir: &Path, keypair: &KeyPair) -> CryptoResult<()> {
        tokio::fs::create_dir_all(dir).await?;

        let private_path = dir.join(PRIVATE_KEY_FILE);
        tokio::fs::write(&private_path, keypair.secret.export().as_bytes()).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&private_path, std::fs::Permissions::from_mode(0o600))
                .await?;
        }

        tokio::fs::write(dir.join(PUBLIC_KEY_FILE), keypair.public.to_string()).await?;
        Ok(())
    }

    /// Host ID the key pair belongs to
    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// This host's public key
    pub fn public_key(&self) -> PublicKey {
        self.keypair.public
    }

    /// This host's public key as base64
    pub fn public_key_base64(&self) -> String {
        self.keypair.public.to_string()
    }

    /// Learn or replace a peer's public key from its base64 form
    pub fn update_keyring(&self, host_id: &str, public_key: &str) -> CryptoResult<()> {
        let key: PublicKey = public_key.parse()?;
        self.insert_key(host_id, key);
        Ok(())
    }

    /// Learn or replace a peer's public key
    pub fn insert_key(&self, host_id: &str, key: PublicKey) {
        let previous = self.keyring.insert(host_id.to_string(), key);
        if previous.is_some_and(|old| old != key) {
            self.sending.remove(host_id);
        }
    }

    /// Get a peer's public key
    pub fn get_key(&self, host_id: &str) -> Option<PublicKey> {
        self.keyring.get(host_id).map(|entry| *entry)
    }

    /// Forget a peer's public key
    pub fn remove_key(&self, host_id: &str) -> Option<PublicKey> {
        self.sending.remove(host_id);
        self.keyring.remove(host_id).map(|(_, key)| key)
    }

    /// Number of peers with a known key
    pub fn keyring_len(&self) -> usize {
        self.keyring.len()
    }

    /// Seal a packet for `host_id`
    ///
    /// Fails with [`CryptoError::UnknownPeer`] when the peer's key has not
    /// been learned yet.
    pub fn seal(&self, host_id: &str, packet: &[u8]) -> CryptoResult<Vec<u8>> {
        let recipient = self
            .get_key(host_id)
            .ok_or_else(|| CryptoError::UnknownPeer(host_id.to_string()))?;

        let session = self.sending_session(host_id, &recipient)?;
        session.seal(packet)
    }

    fn sending_session(
        &self,
        host_id: &str,
        recipient: &PublicKey,
    ) -> CryptoResult<Arc<SealingSession>> {
        if let Some(session) = self.sending.get(host_id) {
            if session.recipient() == recipient && !session.is_exhausted() {
                return Ok(Arc::clone(session.value()));
            }
        }

        let session = Arc::new(SealingSession::new(recipient)?);
        self.sending
            .insert(host_id.to_string(), Arc::clone(&session));
        Ok(session)
    }

    /// Open a datagram sealed for this host
    pub fn open(&self, datagram: &[u8]) -> CryptoResult<Vec<u8>> {
        let parts = sealed::split(datagram)?;
        let ephemeral = *parts.ephemeral_public.as_bytes();

        if let Some(key) = self.receiving.get(&ephemeral) {
            return sealed::open_parts(&key, &parts);
        }

        let key = sealed::receiving_key(&self.keypair.secret, &parts.ephemeral_public)?;
        let plaintext = sealed::open_parts(&key, &parts)?;

        // Only cache keys that authenticated a packet
        if self.receiving.len() >= MAX_RECEIVING_SESSIONS {
            self.receiving.clear();
        }
        self.receiving.insert(ephemeral, key);

        Ok(plaintext)
    }
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("host_id", &self.host_id)
            .field("public_key", &self.keypair.public)
            .field("keyring", &self.keyring.len())
            .finish()
    }
}
