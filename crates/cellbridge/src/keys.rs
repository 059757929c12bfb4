//! Symmetric Key Management
//!
//! Provides the 256-bit packet key and the stores that keep it across
//! process restarts.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand::RngCore;
use rand::rngs::OsRng;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info};

/// Key length in bytes
pub const KEY_LEN: usize = 32;

/// 256-bit symmetric packet key
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey {
    bytes: [u8; KEY_LEN],
}

impl SymmetricKey {
    /// Generate a new random key from the OS RNG
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Create from base64 string
    pub fn from_base64(s: &str) -> Result<Self, KeyStoreError> {
        let bytes = BASE64
            .decode(s.trim())
            .map_err(|_| KeyStoreError::Corrupt("invalid base64".into()))?;

        let bytes: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| KeyStoreError::Corrupt("invalid key length".into()))?;
        Ok(Self::from_bytes(bytes))
    }

    /// Encode as base64 (only key stores should call this)
    pub(crate) fn to_base64(&self) -> String {
        BASE64.encode(self.bytes)
    }

    /// Raw key material for the cipher
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymmetricKey([redacted])")
    }
}

/// Durable secret storage for the packet key.
///
/// Implementations must be process-durable and private to the bridge
/// (a keychain or an owner-only file).
pub trait KeyStore: Send + Sync {
    /// Persist `key`, replacing any previous key
    fn store(&self, key: &SymmetricKey) -> Result<(), KeyStoreError>;

    /// Load the persisted key, `None` if nothing was stored yet
    fn retrieve(&self) -> Result<Option<SymmetricKey>, KeyStoreError>;
}

/// Key store errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyStoreError {
    #[error("Key store access denied: {0}")]
    AccessDenied(String),

    #[error("Key store I/O error: {0}")]
    Io(String),

    #[error("Stored key is corrupt: {0}")]
    Corrupt(String),
}

impl From<std::io::Error> for KeyStoreError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            ErrorKind::PermissionDenied => Self::AccessDenied(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

/// In-memory key store, mostly for tests and ephemeral bridges
#[derive(Default)]
pub struct MemoryKeyStore {
    key: Mutex<Option<SymmetricKey>>,
    store_calls: AtomicUsize,
    inaccessible: bool,
}

impl MemoryKeyStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that rejects every access
    pub fn inaccessible() -> Self {
        Self {
            inaccessible: true,
            ..Self::default()
        }
    }

    /// How many times `store` succeeded
    pub fn store_calls(&self) -> usize {
        self.store_calls.load(Ordering::Relaxed)
    }

    fn check_access(&self) -> Result<(), KeyStoreError> {
        if self.inaccessible {
            Err(KeyStoreError::AccessDenied("store is locked".into()))
        } else {
            Ok(())
        }
    }
}

impl KeyStore for MemoryKeyStore {
    fn store(&self, key: &SymmetricKey) -> Result<(), KeyStoreError> {
        self.check_access()?;
        *self.key.lock().unwrap_or_else(|e| e.into_inner()) = Some(key.clone());
        self.store_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn retrieve(&self) -> Result<Option<SymmetricKey>, KeyStoreError> {
        self.check_access()?;
        Ok(self.key.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

/// File-backed key store.
///
/// The key is written as a single base64 line. On unix the file is created
/// with mode `0600`.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    /// Create a store at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backing file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    fn restrict_permissions(path: &Path) -> std::io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
    }

    #[cfg(not(unix))]
    fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
        Ok(())
    }
}

impl KeyStore for FileKeyStore {
    fn store(&self, key: &SymmetricKey) -> Result<(), KeyStoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        // Write next to the target and rename so a crash never leaves half a key
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, key.to_base64())?;
        Self::restrict_permissions(&tmp)?;
        std::fs::rename(&tmp, &self.path)?;

        info!("Stored packet key at {}", self.path.display());
        Ok(())
    }

    fn retrieve(&self) -> Result<Option<SymmetricKey>, KeyStoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => SymmetricKey::from_base64(&content).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No key at {}", self.path.display());
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation() {
        let a = SymmetricKey::generate();
        let b = SymmetricKey::generate();

        assert_eq!(a.as_bytes().len(), KEY_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = SymmetricKey::from_bytes([0xAB; KEY_LEN]);
        let printed = format!("{:?}", key);

        assert_eq!(printed, "SymmetricKey([redacted])");
        assert!(!printed.contains("ab"));
    }

    #[test]
    fn test_invalid_base64() {
        assert!(SymmetricKey::from_base64("not-valid-base64!!!").is_err());
        assert!(SymmetricKey::from_base64(&BASE64.encode([1u8; 16])).is_err());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryKeyStore::new();
        assert_eq!(store.retrieve().unwrap(), None);

        let key = SymmetricKey::generate();
        store.store(&key).unwrap();

        assert_eq!(store.retrieve().unwrap(), Some(key));
        assert_eq!(store.store_calls(), 1);
    }

    #[test]
    fn test_inaccessible_store() {
        let store = MemoryKeyStore::inaccessible();

        assert!(matches!(store.retrieve(), Err(KeyStoreError::AccessDenied(_))));
        assert!(store.store(&SymmetricKey::generate()).is_err());
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path().join("keys").join("bridge.key"));

        assert_eq!(store.retrieve().unwrap(), None);

        let key = SymmetricKey::generate();
        store.store(&key).unwrap();

        let reopened = FileKeyStore::new(store.path());
        assert_eq!(reopened.retrieve().unwrap(), Some(key));
    }

    #[cfg(unix)]
    #[test]
    fn test_file_store_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path().join("bridge.key"));
        store.store(&SymmetricKey::generate()).unwrap();

        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_file_store_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.key");
        std::fs::write(&path, "garbage").unwrap();

        let store = FileKeyStore::new(&path);
        assert!(matches!(store.retrieve(), Err(KeyStoreError::Corrupt(_))));
    }
}
