//! Authoritative vault state and its pure transition function.
//!
//! [`reduce`] is the only code that changes a [`VaultState`]. It performs
//! no I/O: every action carries the results of the side effects that
//! produced it (a re-fetched archive, a derived Capability).
//!
//! Invariants held by every transition:
//! - entries and archive are replaced together, from one snapshot, so no
//!   live entry references a blob missing from the current archive
//!   (entries without a blob are listed apart as dangling);
//! - a snapshot older than the current generation is ignored;
//! - a Capability change that comes with a new archive (rotation) swaps
//!   both at once.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::archive::{Archive, ArchiveSnapshot, EntryKey, SecretEntry};
use crate::audit::{upsert_recent, AuditEntry, AuditLog};
use crate::keys::Capability;

/// Snapshot of everything the UI may render.
#[derive(Debug, Clone)]
pub struct VaultState {
    user_id: Option<String>,
    entries: Vec<SecretEntry>,
    dangling: Vec<SecretEntry>,
    archive: Option<Arc<Archive>>,
    capability: Option<Arc<Capability>>,
    audit: Vec<AuditEntry>,
    login_audit_cache: AuditLog,
    audit_window: usize,
    audit_capacity: usize,
}

impl VaultState {
    /// The signed-out state.
    pub fn new(audit_window: usize, audit_capacity: usize) -> Self {
        Self {
            user_id: None,
            entries: Vec::new(),
            dangling: Vec::new(),
            archive: None,
            capability: None,
            audit: Vec::new(),
            login_audit_cache: AuditLog::new(audit_capacity),
            audit_window,
            audit_capacity,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn entries(&self) -> &[SecretEntry] {
        &self.entries
    }

    pub fn entry(&self, key: &EntryKey) -> Option<&SecretEntry> {
        self.entries.iter().find(|e| e.matches(key))
    }

    /// Entries the server lists without a blob. They cannot be revealed,
    /// only deleted or overwritten.
    pub fn dangling(&self) -> &[SecretEntry] {
        &self.dangling
    }

    pub fn archive(&self) -> Option<&Arc<Archive>> {
        self.archive.as_ref()
    }

    pub fn generation(&self) -> Option<u64> {
        self.archive.as_ref().map(|a| a.generation())
    }

    pub fn capability(&self) -> Option<&Arc<Capability>> {
        self.capability.as_ref()
    }

    pub fn has_capability(&self) -> bool {
        self.capability.is_some()
    }

    /// Recent window, newest first, one entry per (platform, login).
    pub fn audit(&self) -> &[AuditEntry] {
        &self.audit
    }

    /// Full local audit log for the signed-in user.
    pub fn login_audit_cache(&self) -> &AuditLog {
        &self.login_audit_cache
    }

    fn apply_snapshot(&mut self, snapshot: ArchiveSnapshot) -> bool {
        if let Some(current) = self.generation() {
            if snapshot.archive().generation() < current {
                warn!(
                    current,
                    incoming = snapshot.archive().generation(),
                    "ignoring stale archive snapshot"
                );
                return false;
            }
        }
        self.replace_archive(snapshot);
        true
    }

    fn replace_archive(&mut self, snapshot: ArchiveSnapshot) {
        let (archive, entries, dangling) = snapshot.into_parts();
        if !dangling.is_empty() {
            warn!(count = dangling.len(), "entries without a blob set aside");
        }
        self.archive = Some(Arc::new(archive));
        self.entries = entries;
        self.dangling = dangling;
    }

    fn record(&mut self, entry: AuditEntry) {
        self.login_audit_cache.append(entry.clone());
        upsert_recent(&mut self.audit, entry, self.audit_window);
    }
}

/// Everything that can happen to the vault state.
#[derive(Debug)]
pub enum Action {
    /// A user signed in or restored a session. The Capability is absent
    /// when it has to be supplied later through recovery.
    SessionStarted {
        user_id: String,
        snapshot: ArchiveSnapshot,
        capability: Option<Arc<Capability>>,
        audit_log: AuditLog,
    },
    /// A freshly fetched archive.
    LoadArchive(ArchiveSnapshot),
    /// The archive re-fetched after adding a secret.
    AddSecret { snapshot: ArchiveSnapshot, audit: AuditEntry },
    /// The archive re-fetched after updating a secret.
    UpdateSecret { snapshot: ArchiveSnapshot, audit: AuditEntry },
    /// The archive re-fetched after deleting `key`.
    DeleteSecret { snapshot: ArchiveSnapshot, key: EntryKey },
    /// A Capability supplied through recovery, with the archive it was
    /// verified against.
    SetCapability {
        capability: Arc<Capability>,
        snapshot: ArchiveSnapshot,
    },
    /// The archive no longer opens under the held Capability, usually
    /// because another device rotated the Masterkey. The Capability is
    /// dropped so the next operation asks for the Masterkey again.
    CapabilityRevoked(ArchiveSnapshot),
    /// A committed rotation: new Capability and the archive it encrypts.
    Rotated {
        snapshot: Option<ArchiveSnapshot>,
        capability: Arc<Capability>,
    },
    RecordAudit(AuditEntry),
    Logout,
}

/// Pure transition function.
pub fn reduce(mut state: VaultState, action: Action) -> VaultState {
    let signed_in = state.user_id.is_some();
    match action {
        Action::SessionStarted {
            user_id,
            snapshot,
            capability,
            audit_log,
        } => {
            let mut next = VaultState::new(state.audit_window, state.audit_capacity);
            next.user_id = Some(user_id);
            next.apply_snapshot(snapshot);
            next.capability = capability;
            next.audit = audit_log.recent(next.audit_window);
            next.login_audit_cache = audit_log;
            return next;
        }
        Action::Logout => {
            debug!("session state discarded");
            return VaultState::new(state.audit_window, state.audit_capacity);
        }
        _ if !signed_in => {
            warn!(action = ?action, "action without a session ignored");
        }
        Action::LoadArchive(snapshot) => {
            state.apply_snapshot(snapshot);
        }
        Action::AddSecret { snapshot, audit } | Action::UpdateSecret { snapshot, audit } => {
            if state.apply_snapshot(snapshot) {
                state.record(audit);
            }
        }
        Action::DeleteSecret { snapshot, key } => {
            if state.apply_snapshot(snapshot) {
                state.audit.retain(|e| !e.is_for(&key));
                state.login_audit_cache.forget(&key);
            }
        }
        Action::SetCapability { capability, snapshot } => {
            state.apply_snapshot(snapshot);
            state.capability = Some(capability);
        }
        Action::CapabilityRevoked(snapshot) => {
            state.apply_snapshot(snapshot);
            state.capability = None;
        }
        Action::Rotated { snapshot, capability } => {
            // The old archive is encrypted under the old key; it must not
            // survive next to the new Capability.
            match snapshot {
                Some(snapshot) => state.replace_archive(snapshot),
                None => {
                    state.archive = None;
                    state.entries.clear();
                    state.dangling.clear();
                }
            }
            state.capability = Some(capability);
        }
        Action::RecordAudit(entry) => {
            state.record(entry);
        }
    }
    state
}
