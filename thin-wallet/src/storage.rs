//! Encrypted Credential Storage
//!
//! Persists the account keypair as a single JSON record:
//!
//! ```json
//! { "version": 1, "scheme": { ... }, "digest": "<hex IV || ciphertext>" }
//! ```
//!
//! The record is always replaced wholesale. A record carrying only `digest`
//! opens with the default scheme (SHA-256 fingerprint, AES-256-CTR + HMAC).

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

use crate::cipher::EncryptionScheme;
use crate::error::{CryptoError, Result, WalletError};

/// Current credential record format version
const RECORD_VERSION: u32 = 1;

/// Persisted credential record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// File format version
    #[serde(default = "default_version")]
    version: u32,

    /// Key derivation and cipher parameters
    #[serde(default)]
    scheme: EncryptionScheme,

    /// Sealed keypair (hex encoded)
    digest: String,
}

fn default_version() -> u32 {
    RECORD_VERSION
}

impl CredentialRecord {
    /// Seal raw key bytes under `password`.
    pub fn seal(key_bytes: &[u8], password: &str, scheme: &EncryptionScheme) -> Result<Self> {
        let blob = scheme.seal(key_bytes, password)?;
        Ok(Self {
            version: RECORD_VERSION,
            scheme: scheme.clone(),
            digest: hex::encode(blob),
        })
    }

    /// Recover the raw key bytes. Any failure is the same opaque error.
    pub fn open(&self, password: &str) -> std::result::Result<Zeroizing<Vec<u8>>, CryptoError> {
        if self.version != RECORD_VERSION {
            return Err(CryptoError);
        }
        let blob = hex::decode(&self.digest).map_err(|_| CryptoError)?;
        self.scheme.open(&blob, password)
    }

    pub fn scheme(&self) -> &EncryptionScheme {
        &self.scheme
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| WalletError::StorageUnavailable(format!("failed to encode record: {}", e)))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| WalletError::StorageUnavailable(format!("failed to parse record: {}", e)))
    }
}

/// A store holding at most one credential record.
pub trait CredentialStore: Send + Sync {
    /// Read the record; `StorageUnavailable` if absent or unreadable.
    fn read(&self) -> Result<CredentialRecord>;

    /// Replace the stored record.
    fn write(&self, record: &CredentialRecord) -> Result<()>;

    /// Check if a record exists
    fn exists(&self) -> bool;
}

/// Credential record kept in a JSON file
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileStore {
    fn read(&self) -> Result<CredentialRecord> {
        let json = fs::read_to_string(&self.path).map_err(|e| {
            WalletError::StorageUnavailable(format!(
                "failed to read {}: {}",
                self.path.display(),
                e
            ))
        })?;
        CredentialRecord::from_json(&json)
    }

    fn write(&self, record: &CredentialRecord) -> Result<()> {
        let json = record.to_json()?;
        write_private(&self.path, json.as_bytes()).map_err(|e| {
            WalletError::StorageUnavailable(format!(
                "failed to write {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    fn exists(&self) -> bool {
        self.path.exists()
    }
}

/// Write a file readable by the owner only, creating parent directories.
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(contents)?;
    }

    #[cfg(not(unix))]
    {
        fs::write(path, contents)?;
    }

    Ok(())
}

/// In-memory record store, holding the serialized JSON
#[derive(Debug, Default)]
pub struct MemoryStore {
    json: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw stored JSON, if any
    pub fn raw(&self) -> Option<String> {
        self.json.lock().clone()
    }

    /// Overwrite the stored JSON verbatim
    pub fn set_raw(&self, json: impl Into<String>) {
        *self.json.lock() = Some(json.into());
    }
}

impl CredentialStore for MemoryStore {
    fn read(&self) -> Result<CredentialRecord> {
        let json = self
            .json
            .lock()
            .clone()
            .ok_or_else(|| WalletError::StorageUnavailable("no credential stored".to_string()))?;
        CredentialRecord::from_json(&json)
    }

    fn write(&self, record: &CredentialRecord) -> Result<()> {
        *self.json.lock() = Some(record.to_json()?);
        Ok(())
    }

    fn exists(&self) -> bool {
        self.json.lock().is_some()
    }
}
