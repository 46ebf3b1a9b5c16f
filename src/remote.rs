//! Remote storage collaborator.
//!
//! The transport, authentication and timeouts live behind
//! [`RemoteStorage`]; a timeout is just another `VaultError::Remote`.
//! [`MemoryRemote`] is an in-process implementation with the same
//! generation semantics as the real service, plus fault injection.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use crate::archive::{Archive, ArchiveSnapshot, SecretEntry};
use crate::error::{VaultError, VaultResult};
use crate::record::CipherRecord;

/// One record to store, with the entry metadata that names it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryWrite {
    pub entry: SecretEntry,
    pub record: CipherRecord,
}

/// Contract of the remote storage service. Every call requires an
/// authenticated session, supplied by the implementation.
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// Fetch the encoded archive container for `user_id`.
    async fn fetch_archive(&self, user_id: &str) -> VaultResult<Vec<u8>>;

    /// Insert or replace the record for `write.entry`'s (platform, login).
    async fn write_entry(&self, user_id: &str, write: EntryWrite) -> VaultResult<()>;

    /// Replace a set of records as one logical update. All or nothing.
    async fn write_batch(&self, user_id: &str, writes: Vec<EntryWrite>) -> VaultResult<()>;

    /// Remove the entry and its blob.
    async fn delete_entry(&self, user_id: &str, platform: &str, login: &str) -> VaultResult<()>;
}

// ---------------------------------------------------------------------------
// In-process implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct UserArchive {
    generation: u64,
    entries: Vec<SecretEntry>,
    files: BTreeMap<String, Vec<u8>>,
}

impl UserArchive {
    fn upsert(&mut self, write: EntryWrite) {
        let EntryWrite { entry, record } = write;
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|e| e.platform == entry.platform && e.login == entry.login)
        {
            if existing.archive_file_id != entry.archive_file_id {
                self.files.remove(&existing.archive_file_id);
            }
            *existing = entry.clone();
        } else {
            self.entries.push(entry.clone());
        }
        self.files.insert(entry.archive_file_id, record.encode());
    }
}

#[derive(Default)]
struct RemoteInner {
    users: HashMap<String, UserArchive>,
    fail_writes: bool,
    fail_fetches: bool,
    fetches: usize,
    entry_writes: usize,
    batch_writes: usize,
}

/// In-memory remote storage service.
#[derive(Default)]
pub struct MemoryRemote {
    inner: Mutex<RemoteInner>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> VaultResult<MutexGuard<'_, RemoteInner>> {
        self.inner
            .lock()
            .map_err(|_| VaultError::Remote("remote state poisoned".to_string()))
    }

    /// Make every subsequent write (entry, batch, delete) fail.
    pub fn set_fail_writes(&self, fail: bool) {
        if let Ok(mut inner) = self.lock() {
            inner.fail_writes = fail;
        }
    }

    /// Make every subsequent fetch fail.
    pub fn set_fail_fetches(&self, fail: bool) {
        if let Ok(mut inner) = self.lock() {
            inner.fail_fetches = fail;
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.lock().map(|i| i.fetches).unwrap_or_default()
    }

    pub fn entry_write_count(&self) -> usize {
        self.lock().map(|i| i.entry_writes).unwrap_or_default()
    }

    pub fn batch_write_count(&self) -> usize {
        self.lock().map(|i| i.batch_writes).unwrap_or_default()
    }

    pub fn generation(&self, user_id: &str) -> u64 {
        self.lock()
            .ok()
            .and_then(|i| i.users.get(user_id).map(|u| u.generation))
            .unwrap_or_default()
    }

    /// Raw blob content as stored on the server.
    pub fn raw_blob(&self, user_id: &str, file_id: &str) -> Option<Vec<u8>> {
        let inner = self.lock().ok()?;
        inner.users.get(user_id)?.files.get(file_id).cloned()
    }

    /// Store an entry with arbitrary blob bytes, bypassing record encoding.
    /// Used to seed archives written by older clients or to corrupt a blob.
    pub fn put_raw(&self, user_id: &str, entry: SecretEntry, blob: Vec<u8>) {
        if let Ok(mut inner) = self.lock() {
            let user = inner.users.entry(user_id.to_string()).or_default();
            user.entries.retain(|e| !(e.platform == entry.platform && e.login == entry.login));
            user.files.insert(entry.archive_file_id.clone(), blob);
            user.entries.push(entry);
            user.generation += 1;
        }
    }

    /// Remove a blob but keep the entry that references it.
    pub fn drop_blob(&self, user_id: &str, file_id: &str) {
        if let Ok(mut inner) = self.lock() {
            if let Some(user) = inner.users.get_mut(user_id) {
                user.files.remove(file_id);
                user.generation += 1;
            }
        }
    }
}

#[async_trait]
impl RemoteStorage for MemoryRemote {
    async fn fetch_archive(&self, user_id: &str) -> VaultResult<Vec<u8>> {
        let mut inner = self.lock()?;
        inner.fetches += 1;
        if inner.fail_fetches {
            return Err(VaultError::Remote("fetch rejected".to_string()));
        }
        let snapshot = match inner.users.get(user_id) {
            Some(user) => ArchiveSnapshot::new(
                Archive::new(user.generation, user.files.clone()),
                user.entries.clone(),
            ),
            None => ArchiveSnapshot::new(Archive::default(), Vec::new()),
        };
        snapshot.encode()
    }

    async fn write_entry(&self, user_id: &str, write: EntryWrite) -> VaultResult<()> {
        let mut inner = self.lock()?;
        if inner.fail_writes {
            return Err(VaultError::Remote("write rejected".to_string()));
        }
        inner.entry_writes += 1;
        let user = inner.users.entry(user_id.to_string()).or_default();
        user.upsert(write);
        user.generation += 1;
        debug!(user_id, generation = user.generation, "remote entry written");
        Ok(())
    }

    async fn write_batch(&self, user_id: &str, writes: Vec<EntryWrite>) -> VaultResult<()> {
        let mut inner = self.lock()?;
        if inner.fail_writes {
            return Err(VaultError::Remote("batch rejected".to_string()));
        }
        inner.batch_writes += 1;
        let user = inner.users.entry(user_id.to_string()).or_default();
        for write in writes {
            user.upsert(write);
        }
        user.generation += 1;
        debug!(user_id, generation = user.generation, "remote batch committed");
        Ok(())
    }

    async fn delete_entry(&self, user_id: &str, platform: &str, login: &str) -> VaultResult<()> {
        let mut inner = self.lock()?;
        if inner.fail_writes {
            return Err(VaultError::Remote("delete rejected".to_string()));
        }
        let user = inner.users.entry(user_id.to_string()).or_default();
        if let Some(pos) = user
            .entries
            .iter()
            .position(|e| e.platform == platform && e.login == login)
        {
            let removed = user.entries.remove(pos);
            user.files.remove(&removed.archive_file_id);
        }
        user.generation += 1;
        Ok(())
    }
}
