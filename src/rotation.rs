//! Masterkey rotation.
//!
//! Re-encrypts every stored secret under a new Capability. The protocol is
//! an explicit state machine:
//!
//! ```text
//! Idle → FetchArchive → VerifyOldCapability → DecryptAll → EncryptAll
//!      → CommitRemote → PersistEnvelope → Idle
//! any  → Failed → Idle
//! ```
//!
//! Everything before `CommitRemote` is local and pure; nothing is sent
//! unless every entry decrypted. `CommitRemote` is the single
//! non-idempotent effect and is never retried here: a caller that retries
//! runs the whole protocol again, which re-fetches and re-verifies first.
//! The Envelope is only resealed after the remote accepted the batch.
//!
//! Entries without a blob are not part of the batch and stay dangling.

use std::num::NonZeroU32;

use secrecy::SecretString;
use tracing::{debug, error, info, warn};

use crate::archive::{lookup_secret, verify_capability, ArchiveSnapshot, SecretEntry};
use crate::entry::{decrypt_entry, encrypt_entry};
use crate::envelope::{open_envelope, seal_masterkey, EnvelopeBytes};
use crate::error::{VaultError, VaultResult};
use crate::keys::{derive_capability, Capability, KdfParams, Masterkey};
use crate::remote::{EntryWrite, RemoteStorage};
use crate::store::KeyValueStore;

/// States of the rotation protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationPhase {
    Idle,
    FetchArchive,
    VerifyOldCapability,
    DecryptAll,
    EncryptAll,
    CommitRemote,
    PersistEnvelope,
    Failed,
}

impl RotationPhase {
    /// Successor on the happy path.
    fn successor(self) -> RotationPhase {
        match self {
            Self::Idle => Self::FetchArchive,
            Self::FetchArchive => Self::VerifyOldCapability,
            Self::VerifyOldCapability => Self::DecryptAll,
            Self::DecryptAll => Self::EncryptAll,
            Self::EncryptAll => Self::CommitRemote,
            Self::CommitRemote => Self::PersistEnvelope,
            Self::PersistEnvelope | Self::Failed => Self::Idle,
        }
    }
}

/// Tracks the current phase and every phase visited in the last run.
#[derive(Debug)]
pub struct RotationMachine {
    phase: RotationPhase,
    history: Vec<RotationPhase>,
}

impl Default for RotationMachine {
    fn default() -> Self {
        Self {
            phase: RotationPhase::Idle,
            history: vec![RotationPhase::Idle],
        }
    }
}

impl RotationMachine {
    pub fn phase(&self) -> RotationPhase {
        self.phase
    }

    pub fn history(&self) -> &[RotationPhase] {
        &self.history
    }

    fn advance(&mut self) -> RotationPhase {
        self.enter(self.phase.successor());
        self.phase
    }

    fn fail(&mut self) {
        self.enter(RotationPhase::Failed);
        self.enter(RotationPhase::Idle);
    }

    fn enter(&mut self, next: RotationPhase) {
        debug!(from = ?self.phase, to = ?next, "rotation phase");
        self.phase = next;
        self.history.push(next);
    }
}

/// Collaborators and parameters for one rotation.
pub struct RotationContext<'a> {
    pub remote: &'a dyn RemoteStorage,
    pub store: &'a dyn KeyValueStore,
    pub user_id: &'a str,
    /// Local store key of this user's Envelope.
    pub envelope_key: &'a str,
    /// The login password. Used to open the current Envelope and to seal
    /// the new one.
    pub secondary: &'a SecretString,
    pub kdf: &'a KdfParams,
    pub envelope_rounds: NonZeroU32,
}

/// Result of a committed rotation.
#[derive(Debug)]
pub struct RotationOutcome {
    pub capability: Capability,
    /// Archive re-fetched after commit. `None` if that read failed; the
    /// remote is rotated regardless and the caller must refresh.
    pub snapshot: Option<ArchiveSnapshot>,
    /// False if the new Envelope could not be stored. The stale Envelope
    /// is removed in that case.
    pub envelope_persisted: bool,
    pub reencrypted: usize,
}

/// One rotation run over a context.
pub struct Rotation<'a> {
    ctx: RotationContext<'a>,
    machine: RotationMachine,
}

impl<'a> Rotation<'a> {
    pub fn new(ctx: RotationContext<'a>) -> Self {
        Self {
            ctx,
            machine: RotationMachine::default(),
        }
    }

    pub fn machine(&self) -> &RotationMachine {
        &self.machine
    }

    /// Run the protocol to completion or explicit failure.
    pub async fn run(&mut self, old: &Masterkey, new: &Masterkey) -> VaultResult<RotationOutcome> {
        if old.is_empty() || new.is_empty() {
            return Err(VaultError::EmptyInput);
        }
        match self.execute(old, new).await {
            Ok(outcome) => {
                info!(user_id = self.ctx.user_id, entries = outcome.reencrypted, "masterkey rotated");
                Ok(outcome)
            }
            Err(err) => {
                warn!(user_id = self.ctx.user_id, phase = ?self.machine.phase(), error = %err, "rotation failed");
                self.machine.fail();
                Err(err)
            }
        }
    }

    async fn execute(&mut self, old: &Masterkey, new: &Masterkey) -> VaultResult<RotationOutcome> {
        let ctx = &self.ctx;

        // Never trust a cached archive for a rotation.
        self.machine.advance();
        let snapshot = ArchiveSnapshot::decode(&ctx.remote.fetch_archive(ctx.user_id).await?)?;

        self.machine.advance();
        let old_capability = derive_capability(old, ctx.kdf)?;
        verify_old_masterkey(ctx, old, &old_capability, &snapshot)?;

        self.machine.advance();
        let mut plaintexts: Vec<(SecretEntry, SecretString)> = Vec::with_capacity(snapshot.entries().len());
        for entry in snapshot.entries() {
            let record = lookup_secret(snapshot.archive(), entry)?;
            let plaintext = decrypt_entry(&record, &old_capability)?;
            plaintexts.push((entry.clone(), plaintext));
        }

        self.machine.advance();
        let new_capability = derive_capability(new, ctx.kdf)?;
        let mut writes = Vec::with_capacity(plaintexts.len());
        for (entry, plaintext) in &plaintexts {
            writes.push(EntryWrite {
                entry: entry.clone(),
                record: encrypt_entry(plaintext, &new_capability)?,
            });
        }
        drop(plaintexts);
        let reencrypted = writes.len();

        self.machine.advance();
        ctx.remote.write_batch(ctx.user_id, writes).await?;
        info!(user_id = ctx.user_id, entries = reencrypted, "rotation batch committed");

        self.machine.advance();
        let envelope_persisted = persist_envelope(ctx, new);

        let snapshot = match ctx.remote.fetch_archive(ctx.user_id).await {
            Ok(bytes) => ArchiveSnapshot::decode(&bytes)
                .map_err(|e| warn!(error = %e, "post-rotation archive unreadable"))
                .ok(),
            Err(e) => {
                warn!(error = %e, "post-rotation re-fetch failed");
                None
            }
        };

        self.machine.advance();
        Ok(RotationOutcome {
            capability: new_capability,
            snapshot,
            envelope_persisted,
            reencrypted,
        })
    }
}

/// The claimed old Masterkey must be the one currently in force.
///
/// A stored Envelope that still opens the live archive decides directly.
/// One that no longer does was left behind by a rotation on another device
/// and is ignored. Either way the old Capability must open the archive; an
/// archive with nothing readable has nothing to contradict the claim.
fn verify_old_masterkey(
    ctx: &RotationContext<'_>,
    old: &Masterkey,
    old_capability: &Capability,
    snapshot: &ArchiveSnapshot,
) -> VaultResult<()> {
    if let Some(bytes) = ctx.store.get(ctx.envelope_key)? {
        let recovered = open_envelope(&EnvelopeBytes::from_vec(bytes), ctx.secondary)?;
        if !recovered.matches(old) {
            let current = derive_capability(&recovered, ctx.kdf)?;
            if verify_capability(snapshot, &current).is_ok() {
                return Err(VaultError::InvalidOldMasterkey);
            }
            warn!(user_id = ctx.user_id, "stored envelope does not open the archive; ignoring it");
        }
    }
    verify_capability(snapshot, old_capability).map_err(|_| VaultError::InvalidOldMasterkey)
}

fn persist_envelope(ctx: &RotationContext<'_>, new: &Masterkey) -> bool {
    let stored = seal_masterkey(new, ctx.secondary, ctx.envelope_rounds)
        .and_then(|sealed| ctx.store.set(ctx.envelope_key, sealed.as_bytes()));
    match stored {
        Ok(()) => true,
        Err(e) => {
            error!(error = %e, "new envelope not stored; removing stale envelope");
            if let Err(e) = ctx.store.remove(ctx.envelope_key) {
                error!(error = %e, "stale envelope could not be removed");
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_order() {
        let mut machine = RotationMachine::default();
        for _ in 0..7 {
            machine.advance();
        }
        assert_eq!(
            machine.history(),
            &[
                RotationPhase::Idle,
                RotationPhase::FetchArchive,
                RotationPhase::VerifyOldCapability,
                RotationPhase::DecryptAll,
                RotationPhase::EncryptAll,
                RotationPhase::CommitRemote,
                RotationPhase::PersistEnvelope,
                RotationPhase::Idle,
            ]
        );
    }

    #[test]
    fn failure_returns_to_idle() {
        let mut machine = RotationMachine::default();
        machine.advance();
        machine.advance();
        machine.fail();
        assert_eq!(machine.phase(), RotationPhase::Idle);
        assert_eq!(
            &machine.history()[machine.history().len() - 2..],
            &[RotationPhase::Failed, RotationPhase::Idle]
        );
    }
}
