//! Packet Crypto
//!
//! Seals and opens individual packets with ChaCha20-Poly1305 under the
//! persisted symmetric key.
//!
//! # Sealed Packet Layout
//!
//! ```text
//! ┌──────────────┬──────────────────────────┬──────────────┐
//! │ nonce (12 B) │ ciphertext (len = input) │  tag (16 B)  │
//! └──────────────┴──────────────────────────┴──────────────┘
//! ```
//!
//! Every call draws a fresh random 96-bit nonce. Random nonces are only
//! safe for a bounded number of messages per key, so each provider stops
//! sealing once its message limit is reached; a new provider must be
//! created through [`CryptoProvider::rotate`].

use crate::keys::{KeyStore, KeyStoreError, SymmetricKey};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{error, info};

/// Nonce length in bytes
pub const NONCE_LEN: usize = 12;

/// Authentication tag length in bytes
pub const TAG_LEN: usize = 16;

/// Bytes added to every sealed packet
pub const SEAL_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Messages sealed under one key before it must be rotated (2^32, the
/// usual bound for random 96-bit nonces)
pub const DEFAULT_MESSAGE_LIMIT: u64 = 1 << 32;

/// Authenticated packet encryption under a single key.
///
/// The key is immutable for the provider's lifetime, so a provider can be
/// shared behind an `Arc` across every packet without locking.
pub struct CryptoProvider {
    cipher: ChaCha20Poly1305,
    sealed: AtomicU64,
    limit: u64,
    exhausted: AtomicBool,
}

impl CryptoProvider {
    /// Create a provider for an explicit key
    pub fn from_key(key: &SymmetricKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key.as_bytes())),
            sealed: AtomicU64::new(0),
            limit: DEFAULT_MESSAGE_LIMIT,
            exhausted: AtomicBool::new(false),
        }
    }

    /// Override the per-key message limit
    pub fn with_message_limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    /// Load the key from `store`, generating and persisting one on first use.
    pub fn initialize(store: &dyn KeyStore) -> Result<Self, CryptoError> {
        let key = match store.retrieve().map_err(CryptoError::KeyUnavailable)? {
            Some(key) => {
                info!("Loaded packet key from key store");
                key
            }
            None => {
                info!("No packet key found, generating a new one");
                let key = SymmetricKey::generate();
                store.store(&key).map_err(CryptoError::KeyUnavailable)?;
                key
            }
        };

        Ok(Self::from_key(&key))
    }

    /// Generate a fresh key, persist it and return a provider for it.
    ///
    /// Existing providers keep their old key until dropped.
    pub fn rotate(store: &dyn KeyStore) -> Result<Self, CryptoError> {
        let key = SymmetricKey::generate();
        store.store(&key).map_err(CryptoError::KeyUnavailable)?;

        info!("Rotated packet key");
        Ok(Self::from_key(&key))
    }

    /// Has this key sealed its last allowed message?
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Acquire)
    }

    /// Messages sealed so far under this key
    pub fn sealed_count(&self) -> u64 {
        self.sealed.load(Ordering::Relaxed).min(self.limit)
    }

    /// Seal `plaintext` as `nonce || ciphertext || tag`
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.sealed.fetch_add(1, Ordering::Relaxed) >= self.limit {
            if !self.exhausted.swap(true, Ordering::AcqRel) {
                error!("Packet key reached its message limit, rotation required");
            }
            return Err(CryptoError::EncryptionFailed);
        }

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Open a sealed packet.
    ///
    /// Every failure (short input, wrong key, tag mismatch) yields the same
    /// `DecryptionFailed`.
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(CryptoError::DecryptionFailed);
        }

        let (nonce, body) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl fmt::Debug for CryptoProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoProvider")
            .field("sealed", &self.sealed_count())
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

/// Crypto errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("Packet key unavailable: {0}")]
    KeyUnavailable(KeyStoreError),

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed")]
    DecryptionFailed,
}
