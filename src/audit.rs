//! Local audit history.
//!
//! Records every successful decrypt, copy, add and update. Two views are
//! kept:
//! - [`AuditLog`]: the append-only, capped log persisted per user in the
//!   local store. Never sent to the server.
//! - the recent window: one entry per (platform, login), last write wins,
//!   ordered newest first and trimmed to N for display.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::archive::EntryKey;
use crate::error::{VaultError, VaultResult};
use crate::store::{self, KeyValueStore};

/// What happened to the secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Decrypt,
    Copy,
    Add,
    Update,
}

/// A record of one successful operation on a secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub platform: String,
    pub login: String,
    pub action: AuditAction,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    pub fn now(key: &EntryKey, action: AuditAction) -> Self {
        Self {
            platform: key.platform.clone(),
            login: key.login.clone(),
            action,
            timestamp: Utc::now(),
        }
    }

    pub fn key(&self) -> EntryKey {
        EntryKey::new(self.platform.clone(), self.login.clone())
    }

    pub fn is_for(&self, key: &EntryKey) -> bool {
        self.platform == key.platform && self.login == key.login
    }
}

/// Insert `entry` into the recent window: replaces any entry with the same
/// key, keeps newest-first order by timestamp, trims to `window`.
pub fn upsert_recent(recent: &mut Vec<AuditEntry>, entry: AuditEntry, window: usize) {
    recent.retain(|e| !(e.platform == entry.platform && e.login == entry.login));
    let pos = recent
        .iter()
        .position(|e| e.timestamp <= entry.timestamp)
        .unwrap_or(recent.len());
    recent.insert(pos, entry);
    recent.truncate(window);
}

/// Append-only history, capped at `capacity` entries (oldest dropped first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditLog {
    records: VecDeque<AuditEntry>,
    capacity: usize,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::new(),
            capacity,
        }
    }

    /// Append a new record, evicting the oldest beyond capacity.
    pub fn append(&mut self, record: AuditEntry) {
        self.records.push_back(record);
        while self.records.len() > self.capacity {
            self.records.pop_front();
        }
    }

    /// Drop every record for `key`. Used when the entry itself is deleted.
    pub fn forget(&mut self, key: &EntryKey) {
        self.records.retain(|r| !r.is_for(key));
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AuditEntry> {
        self.records.iter()
    }

    /// Build the recent window from the full log.
    pub fn recent(&self, window: usize) -> Vec<AuditEntry> {
        let mut recent = Vec::new();
        for record in &self.records {
            upsert_recent(&mut recent, record.clone(), usize::MAX);
        }
        recent.truncate(window);
        recent
    }

    /// Load the log persisted for `user_id`; absent means empty.
    pub fn load(store: &dyn KeyValueStore, user_id: &str, capacity: usize) -> VaultResult<Self> {
        let mut log = Self::new(capacity);
        if let Some(bytes) = store.get(&store::audit_key(user_id))? {
            let records: Vec<AuditEntry> =
                serde_json::from_slice(&bytes).map_err(|e| VaultError::Storage(e.to_string()))?;
            for record in records {
                log.append(record);
            }
        }
        Ok(log)
    }

    /// Persist the log for `user_id` as a JSON array.
    pub fn persist(&self, store: &dyn KeyValueStore, user_id: &str) -> VaultResult<()> {
        let bytes = serde_json::to_vec(&self.records).map_err(|e| VaultError::Storage(e.to_string()))?;
        store.set(&store::audit_key(user_id), &bytes)
    }
}
