//! Encrypted archive access.
//!
//! The archive is the server-delivered container of opaque blobs, one per
//! live [`SecretEntry`]. A fetched archive is immutable: every write on the
//! server bumps its generation and the client re-fetches before trusting
//! any further read.
//!
//! ## Wire container
//!
//! ```json
//! { "generation": 7,
//!   "entries": [ { "platform": "...", "login": "...", "archive_file_id": "..." } ],
//!   "files": { "<archive_file_id>": "<base64 blob>" } }
//! ```
//!
//! An entry whose blob is missing from `files` does not make the container
//! unreadable. It is kept aside as dangling so the rest of the vault stays
//! usable and the entry can still be deleted or overwritten.

use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::entry::decrypt_entry;
use crate::error::{VaultError, VaultResult};
use crate::keys::Capability;
use crate::record::CipherRecord;

/// Identity of a stored credential.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryKey {
    pub platform: String,
    pub login: String,
}

impl EntryKey {
    pub fn new(platform: impl Into<String>, login: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            login: login.into(),
        }
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {}", self.platform, self.login)
    }
}

/// A live credential: which blob in the archive holds its ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretEntry {
    pub platform: String,
    pub login: String,
    pub archive_file_id: String,
}

impl SecretEntry {
    pub fn key(&self) -> EntryKey {
        EntryKey::new(self.platform.clone(), self.login.clone())
    }

    pub fn matches(&self, key: &EntryKey) -> bool {
        self.platform == key.platform && self.login == key.login
    }
}

/// One generation of the server container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Archive {
    generation: u64,
    blobs: BTreeMap<String, Vec<u8>>,
}

impl Archive {
    pub fn new(generation: u64, blobs: BTreeMap<String, Vec<u8>>) -> Self {
        Self { generation, blobs }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Raw blob content, if present.
    pub fn read(&self, file_id: &str) -> Option<&[u8]> {
        self.blobs.get(file_id).map(Vec::as_slice)
    }

    pub fn contains(&self, file_id: &str) -> bool {
        self.blobs.contains_key(file_id)
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

/// Read and decode the blob behind `entry`.
pub fn lookup_secret(archive: &Archive, entry: &SecretEntry) -> VaultResult<CipherRecord> {
    let blob = archive
        .read(&entry.archive_file_id)
        .ok_or_else(|| VaultError::MissingBlob(entry.archive_file_id.clone()))?;
    CipherRecord::decode(blob)
}

/// Check that `capability` is the key this archive is encrypted under.
///
/// Live entries are tried in order until one decrypts. A blob that cannot
/// be read says nothing about the key and is skipped. If every readable
/// entry fails authentication the Capability is wrong; an archive with
/// nothing readable accepts any Capability.
pub fn verify_capability(snapshot: &ArchiveSnapshot, capability: &Capability) -> VaultResult<()> {
    let mut rejected = false;
    for entry in snapshot.entries() {
        let Ok(record) = lookup_secret(snapshot.archive(), entry) else {
            continue;
        };
        match decrypt_entry(&record, capability) {
            Ok(_) => return Ok(()),
            Err(_) => rejected = true,
        }
    }
    if rejected {
        Err(VaultError::Decryption)
    } else {
        Ok(())
    }
}

/// A fetched archive together with the entry list that references it.
///
/// `entries` only holds entries whose blob is present in `archive`; the
/// others are listed by [`ArchiveSnapshot::dangling`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSnapshot {
    archive: Archive,
    entries: Vec<SecretEntry>,
    dangling: Vec<SecretEntry>,
}

#[derive(Serialize, Deserialize)]
struct WireArchive {
    generation: u64,
    #[serde(default)]
    entries: Vec<SecretEntry>,
    #[serde(default)]
    files: BTreeMap<String, String>,
}

impl ArchiveSnapshot {
    /// Split `entries` into live and dangling against `archive`.
    pub fn new(archive: Archive, entries: Vec<SecretEntry>) -> Self {
        let (entries, dangling): (Vec<_>, Vec<_>) = entries
            .into_iter()
            .partition(|e| archive.contains(&e.archive_file_id));
        Self {
            archive,
            entries,
            dangling,
        }
    }

    /// Decode the JSON wire container fetched from remote storage.
    pub fn decode(bytes: &[u8]) -> VaultResult<Self> {
        let wire: WireArchive =
            serde_json::from_slice(bytes).map_err(|e| VaultError::CorruptArchive(e.to_string()))?;

        let mut blobs = BTreeMap::new();
        for (file_id, content) in wire.files {
            let blob = STANDARD
                .decode(content.as_bytes())
                .map_err(|_| VaultError::CorruptArchive(format!("blob {file_id} is not base64")))?;
            blobs.insert(file_id, blob);
        }
        Ok(Self::new(Archive::new(wire.generation, blobs), wire.entries))
    }

    /// Encode into the JSON wire container.
    pub fn encode(&self) -> VaultResult<Vec<u8>> {
        let wire = WireArchive {
            generation: self.archive.generation,
            entries: self.entries.iter().chain(&self.dangling).cloned().collect(),
            files: self
                .archive
                .blobs
                .iter()
                .map(|(id, blob)| (id.clone(), STANDARD.encode(blob)))
                .collect(),
        };
        serde_json::to_vec(&wire).map_err(|e| VaultError::CorruptArchive(e.to_string()))
    }

    pub fn archive(&self) -> &Archive {
        &self.archive
    }

    pub fn entries(&self) -> &[SecretEntry] {
        &self.entries
    }

    /// Entries whose blob is missing from the archive.
    pub fn dangling(&self) -> &[SecretEntry] {
        &self.dangling
    }

    /// Find an entry by key, live or dangling.
    pub fn find(&self, key: &EntryKey) -> Option<&SecretEntry> {
        self.entries.iter().chain(&self.dangling).find(|e| e.matches(key))
    }

    /// `(archive, live entries, dangling entries)`
    pub fn into_parts(self) -> (Archive, Vec<SecretEntry>, Vec<SecretEntry>) {
        (self.archive, self.entries, self.dangling)
    }
}
