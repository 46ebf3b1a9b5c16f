//! Local durable key-value store.
//!
//! Holds the Envelope and the per-user audit log. Scoped to one device
//! profile and never synced.
//!
//! Key layout:
//! ```text
//! envelope:{device_profile}:{user_id} -> EnvelopeBytes
//! audit:{user_id}                     -> JSON array of AuditEntry
//! ```

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{VaultError, VaultResult};

pub fn envelope_key(device_profile: &str, user_id: &str) -> String {
    format!("envelope:{device_profile}:{user_id}")
}

pub fn audit_key(user_id: &str) -> String {
    format!("audit:{user_id}")
}

/// Byte-oriented durable store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> VaultResult<Option<Vec<u8>>>;
    fn set(&self, key: &str, value: &[u8]) -> VaultResult<()>;
    fn remove(&self, key: &str) -> VaultResult<()>;
}

// ---------------------------------------------------------------------------
// Built-in store: memory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> VaultError {
    VaultError::Storage("store lock poisoned".to_string())
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> VaultResult<Option<Vec<u8>>> {
        Ok(self.values.lock().map_err(poisoned)?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> VaultResult<()> {
        self.values
            .lock()
            .map_err(poisoned)?
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> VaultResult<()> {
        self.values.lock().map_err(poisoned)?.remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Built-in store: file
// ---------------------------------------------------------------------------

/// One file per key inside a directory. Key characters outside
/// `[A-Za-z0-9_-]` are hex-escaped to form the file name.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) the store directory.
    pub fn new(dir: impl AsRef<Path>) -> VaultResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| VaultError::Storage(e.to_string()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut name = String::with_capacity(key.len());
        for byte in key.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
                name.push(byte as char);
            } else {
                name.push_str(&format!("%{byte:02x}"));
            }
        }
        self.dir.join(name)
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> VaultResult<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(VaultError::Storage(e.to_string())),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> VaultResult<()> {
        // A reader sees the old value or the new one, never a partial write.
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, value).map_err(|e| VaultError::Storage(e.to_string()))?;
        fs::rename(&tmp, &path).map_err(|e| VaultError::Storage(e.to_string()))
    }

    fn remove(&self, key: &str) -> VaultResult<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VaultError::Storage(e.to_string())),
        }
    }
}
