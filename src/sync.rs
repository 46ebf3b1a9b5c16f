//! Vault state synchronizer.
//!
//! A single task owns the [`VaultState`] and the session secrets. Callers
//! talk to it through a cloneable [`VaultHandle`]; every state change is a
//! command processed in arrival order, so write operations against one
//! archive generation never overlap. Reads (revealing a secret) run on the
//! caller's side against the latest published snapshot and may proceed in
//! parallel.
//!
//! Cancellation: dropping a caller's future discards the reply, never the
//! work. A rotation that reached the remote commit always runs to its end
//! inside the task.
//!
//! When an operation needs the Capability and none is loaded, the handle
//! returns [`Completion::NeedsMasterkey`] carrying a [`Recovery`]: a
//! one-shot continuation that unlocks with the supplied Masterkey and
//! retries the original operation exactly once.

use std::fmt;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::archive::{lookup_secret, verify_capability, ArchiveSnapshot, EntryKey, SecretEntry};
use crate::audit::{AuditAction, AuditEntry, AuditLog};
use crate::config::VaultConfig;
use crate::entry::{decrypt_entry, encrypt_entry};
use crate::envelope::{open_envelope, seal_masterkey, EnvelopeBytes};
use crate::error::{VaultError, VaultResult};
use crate::keys::{derive_capability, Capability, KdfParams, Masterkey};
use crate::remote::{EntryWrite, RemoteStorage};
use crate::rotation::{Rotation, RotationContext};
use crate::state::{reduce, Action, VaultState};
use crate::store::{self, KeyValueStore};

// ---------------------------------------------------------------------------
// Recovery continuation
// ---------------------------------------------------------------------------

type Resume<T> = Box<dyn FnOnce(Masterkey) -> BoxFuture<'static, VaultResult<T>> + Send>;

/// A suspended operation waiting for the Masterkey.
///
/// Consumed by [`Recovery::resume`], so it can run at most once. If the
/// supplied Masterkey is wrong the error is final; no second prompt is
/// produced for the same operation.
pub struct Recovery<T> {
    resume: Resume<T>,
}

impl<T> Recovery<T> {
    fn new(resume: impl FnOnce(Masterkey) -> BoxFuture<'static, VaultResult<T>> + Send + 'static) -> Self {
        Self {
            resume: Box::new(resume),
        }
    }

    /// Unlock with `masterkey` and retry the suspended operation once.
    pub async fn resume(self, masterkey: Masterkey) -> VaultResult<T> {
        (self.resume)(masterkey).await
    }

    /// Give up on the suspended operation.
    pub fn abandon(self) {}
}

impl<T> fmt::Debug for Recovery<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Recovery")
    }
}

/// Outcome of an operation that may need the Masterkey first.
#[derive(Debug)]
pub enum Completion<T> {
    Done(T),
    NeedsMasterkey(Recovery<T>),
}

impl<T> Completion<T> {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }

    pub fn done(self) -> Option<T> {
        match self {
            Self::Done(value) => Some(value),
            Self::NeedsMasterkey(_) => None,
        }
    }

    pub fn into_recovery(self) -> Option<Recovery<T>> {
        match self {
            Self::Done(_) => None,
            Self::NeedsMasterkey(recovery) => Some(recovery),
        }
    }
}

/// Summary of a committed rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationReport {
    pub reencrypted: usize,
    pub envelope_persisted: bool,
    pub archive_refreshed: bool,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

type Reply<T> = oneshot::Sender<VaultResult<T>>;

enum Command {
    Login {
        user_id: String,
        password: SecretString,
        masterkey: Masterkey,
        reply: Reply<()>,
    },
    RestoreSession {
        user_id: String,
        password: SecretString,
        reply: Reply<bool>,
    },
    Refresh {
        reply: Reply<()>,
    },
    Unlock {
        masterkey: Masterkey,
        reply: Reply<()>,
    },
    AddSecret {
        key: EntryKey,
        secret: SecretString,
        reply: Reply<()>,
    },
    UpdateSecret {
        key: EntryKey,
        secret: SecretString,
        reply: Reply<()>,
    },
    DeleteSecret {
        key: EntryKey,
        reply: Reply<()>,
    },
    RecordAudit(AuditEntry),
    Rotate {
        old: Masterkey,
        new: Masterkey,
        reply: Reply<RotationReport>,
    },
    Logout {
        reply: Reply<()>,
    },
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable entry point to the synchronizer task.
#[derive(Clone)]
pub struct VaultHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<Arc<VaultState>>,
}

impl fmt::Debug for VaultHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultHandle").finish_non_exhaustive()
    }
}

/// Start the synchronizer task on the current tokio runtime.
pub fn spawn(
    config: VaultConfig,
    remote: Arc<dyn RemoteStorage>,
    store: Arc<dyn KeyValueStore>,
) -> VaultResult<VaultHandle> {
    config.validate()?;
    let kdf = config.kdf_params()?;
    let (commands, inbox) = mpsc::channel(config.command_buffer);
    let initial = VaultState::new(config.audit_window, config.audit_log_capacity);
    let (publisher, state) = watch::channel(Arc::new(initial.clone()));

    let task = Synchronizer {
        config,
        kdf,
        remote,
        store,
        session: None,
        state: initial,
        publisher,
        inbox,
    };
    tokio::spawn(task.run());

    Ok(VaultHandle { commands, state })
}

impl VaultHandle {
    /// Latest published state.
    pub fn state(&self) -> Arc<VaultState> {
        Arc::clone(&*self.state.borrow())
    }

    /// Receiver notified on every state transition.
    pub fn subscribe(&self) -> watch::Receiver<Arc<VaultState>> {
        self.state.clone()
    }

    fn needs_masterkey(&self) -> VaultResult<bool> {
        let state = self.state.borrow();
        if state.user_id().is_none() {
            return Err(VaultError::NoSession);
        }
        Ok(!state.has_capability())
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> VaultResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| VaultError::Closed)?;
        response.await.map_err(|_| VaultError::Closed)?
    }

    /// Sign in with the login password and the Masterkey. Seals a fresh
    /// Envelope for later session restore.
    pub async fn login(
        &self,
        user_id: impl Into<String>,
        password: SecretString,
        masterkey: Masterkey,
    ) -> VaultResult<()> {
        let user_id = user_id.into();
        self.request(|reply| Command::Login {
            user_id,
            password,
            masterkey,
            reply,
        })
        .await
    }

    /// Resume a session from the stored Envelope. Returns whether the
    /// Capability was recovered; if not, the first operation that needs it
    /// asks for the Masterkey.
    pub async fn restore_session(&self, user_id: impl Into<String>, password: SecretString) -> VaultResult<bool> {
        let user_id = user_id.into();
        self.request(|reply| Command::RestoreSession {
            user_id,
            password,
            reply,
        })
        .await
    }

    /// Re-fetch the archive.
    pub async fn refresh(&self) -> VaultResult<()> {
        self.request(|reply| Command::Refresh { reply }).await
    }

    /// Derive and load the Capability for `masterkey`, after checking it
    /// against the live archive.
    pub async fn unlock(&self, masterkey: Masterkey) -> VaultResult<()> {
        self.request(|reply| Command::Unlock { masterkey, reply }).await
    }

    pub async fn add_secret(
        &self,
        platform: impl Into<String>,
        login: impl Into<String>,
        secret: SecretString,
    ) -> VaultResult<Completion<()>> {
        let key = EntryKey::new(platform, login);
        if self.needs_masterkey()? {
            let handle = self.clone();
            return Ok(Completion::NeedsMasterkey(Recovery::new(move |masterkey| {
                async move {
                    handle.unlock(masterkey).await?;
                    handle.request(|reply| Command::AddSecret { key, secret, reply }).await
                }
                .boxed()
            })));
        }
        self.request(|reply| Command::AddSecret { key, secret, reply })
            .await
            .map(Completion::Done)
    }

    pub async fn update_secret(
        &self,
        platform: impl Into<String>,
        login: impl Into<String>,
        secret: SecretString,
    ) -> VaultResult<Completion<()>> {
        let key = EntryKey::new(platform, login);
        if self.needs_masterkey()? {
            let handle = self.clone();
            return Ok(Completion::NeedsMasterkey(Recovery::new(move |masterkey| {
                async move {
                    handle.unlock(masterkey).await?;
                    handle.request(|reply| Command::UpdateSecret { key, secret, reply }).await
                }
                .boxed()
            })));
        }
        self.request(|reply| Command::UpdateSecret { key, secret, reply })
            .await
            .map(Completion::Done)
    }

    /// Delete needs no Capability: it never touches ciphertext.
    pub async fn delete_secret(&self, platform: impl Into<String>, login: impl Into<String>) -> VaultResult<()> {
        let key = EntryKey::new(platform, login);
        self.request(|reply| Command::DeleteSecret { key, reply }).await
    }

    /// Decrypt one secret from the current snapshot and record `action`.
    pub async fn reveal_secret(&self, key: EntryKey, action: AuditAction) -> VaultResult<Completion<SecretString>> {
        if self.needs_masterkey()? {
            let handle = self.clone();
            return Ok(Completion::NeedsMasterkey(Recovery::new(move |masterkey| {
                async move {
                    handle.unlock(masterkey).await?;
                    handle.reveal_once(&key, action).await
                }
                .boxed()
            })));
        }
        self.reveal_once(&key, action).await.map(Completion::Done)
    }

    async fn reveal_once(&self, key: &EntryKey, action: AuditAction) -> VaultResult<SecretString> {
        let state = self.state();
        let entry = state
            .entry(key)
            .or_else(|| state.dangling().iter().find(|e| e.matches(key)))
            .ok_or_else(|| VaultError::UnknownEntry {
                platform: key.platform.clone(),
                login: key.login.clone(),
            })?;
        let archive = state.archive().ok_or(VaultError::NoSession)?;
        let capability = state.capability().ok_or(VaultError::CapabilityRequired)?;

        let record = lookup_secret(archive, entry)?;
        let secret = decrypt_entry(&record, capability)?;

        if self
            .commands
            .send(Command::RecordAudit(AuditEntry::now(key, action)))
            .await
            .is_err()
        {
            warn!("audit record dropped: synchronizer closed");
        }
        Ok(secret)
    }

    /// Rotate the Masterkey: re-encrypt every entry under the Capability of
    /// `new`. Fails with `InvalidOldMasterkey` before any ciphertext is
    /// touched if `old` is not the current Masterkey.
    pub async fn rotate_masterkey(&self, old: Masterkey, new: Masterkey) -> VaultResult<RotationReport> {
        self.request(|reply| Command::Rotate { old, new, reply }).await
    }

    /// Persist the audit log and drop every session secret. The Envelope
    /// stays for the next restore.
    pub async fn logout(&self) -> VaultResult<()> {
        self.request(|reply| Command::Logout { reply }).await
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

struct Session {
    user_id: String,
    password: SecretString,
}

struct Synchronizer {
    config: VaultConfig,
    kdf: KdfParams,
    remote: Arc<dyn RemoteStorage>,
    store: Arc<dyn KeyValueStore>,
    session: Option<Session>,
    state: VaultState,
    publisher: watch::Sender<Arc<VaultState>>,
    inbox: mpsc::Receiver<Command>,
}

impl Synchronizer {
    async fn run(mut self) {
        debug!("vault synchronizer started");
        while let Some(command) = self.inbox.recv().await {
            self.handle(command).await;
        }
        debug!("vault synchronizer stopped");
    }

    async fn handle(&mut self, command: Command) {
        // A failed send means the caller is gone; the result is discarded.
        match command {
            Command::Login {
                user_id,
                password,
                masterkey,
                reply,
            } => {
                let _ = reply.send(self.login(user_id, password, masterkey).await);
            }
            Command::RestoreSession {
                user_id,
                password,
                reply,
            } => {
                let _ = reply.send(self.restore_session(user_id, password).await);
            }
            Command::Refresh { reply } => {
                let _ = reply.send(self.refresh().await);
            }
            Command::Unlock { masterkey, reply } => {
                let _ = reply.send(self.unlock(masterkey).await);
            }
            Command::AddSecret { key, secret, reply } => {
                let _ = reply.send(self.add_secret(key, secret).await);
            }
            Command::UpdateSecret { key, secret, reply } => {
                let _ = reply.send(self.update_secret(key, secret).await);
            }
            Command::DeleteSecret { key, reply } => {
                let _ = reply.send(self.delete_secret(key).await);
            }
            Command::RecordAudit(entry) => self.dispatch(Action::RecordAudit(entry)),
            Command::Rotate { old, new, reply } => {
                let _ = reply.send(self.rotate(old, new).await);
            }
            Command::Logout { reply } => {
                let _ = reply.send(self.logout());
            }
        }
    }

    fn dispatch(&mut self, action: Action) {
        let current = std::mem::replace(
            &mut self.state,
            VaultState::new(self.config.audit_window, self.config.audit_log_capacity),
        );
        self.state = reduce(current, action);
        self.publisher.send_replace(Arc::new(self.state.clone()));
    }

    fn session(&self) -> VaultResult<&Session> {
        self.session.as_ref().ok_or(VaultError::NoSession)
    }

    fn envelope_key(&self, user_id: &str) -> String {
        store::envelope_key(&self.config.device_profile, user_id)
    }

    async fn fetch(&self, user_id: &str) -> VaultResult<ArchiveSnapshot> {
        let bytes = self.remote.fetch_archive(user_id).await?;
        ArchiveSnapshot::decode(&bytes)
    }

    /// PBKDF2 is CPU-bound; run it on the blocking pool.
    async fn derive(&self, masterkey: Masterkey) -> VaultResult<(Masterkey, Capability)> {
        let kdf = self.kdf.clone();
        tokio::task::spawn_blocking(move || derive_capability(&masterkey, &kdf).map(|cap| (masterkey, cap)))
            .await
            .map_err(|_| VaultError::KeyDerivationFailure)?
    }

    fn store_envelope(&self, user_id: &str, masterkey: &Masterkey, password: &SecretString) {
        let stored = self
            .config
            .envelope_rounds()
            .and_then(|rounds| seal_masterkey(masterkey, password, rounds))
            .and_then(|sealed| self.store.set(&self.envelope_key(user_id), sealed.as_bytes()));
        if let Err(e) = stored {
            warn!(user_id, error = %e, "envelope not stored; session restore will ask for the masterkey");
        }
    }

    fn load_audit(&self, user_id: &str) -> AuditLog {
        AuditLog::load(&*self.store, user_id, self.config.audit_log_capacity).unwrap_or_else(|e| {
            warn!(user_id, error = %e, "audit log unreadable; starting empty");
            AuditLog::new(self.config.audit_log_capacity)
        })
    }

    fn end_session(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = self.state.login_audit_cache().persist(&*self.store, &session.user_id) {
                warn!(user_id = %session.user_id, error = %e, "audit log not persisted");
            }
            info!(user_id = %session.user_id, "session ended");
        }
        self.dispatch(Action::Logout);
    }

    async fn login(&mut self, user_id: String, password: SecretString, masterkey: Masterkey) -> VaultResult<()> {
        if password.expose_secret().is_empty() {
            return Err(VaultError::EmptyInput);
        }
        let (masterkey, capability) = self.derive(masterkey).await?;
        let snapshot = self.fetch(&user_id).await?;
        verify_capability(&snapshot, &capability)?;

        if self.session.is_some() {
            self.end_session();
        }
        self.store_envelope(&user_id, &masterkey, &password);
        let audit_log = self.load_audit(&user_id);

        info!(user_id = %user_id, entries = snapshot.entries().len(), "session started");
        self.session = Some(Session {
            user_id: user_id.clone(),
            password,
        });
        self.dispatch(Action::SessionStarted {
            user_id,
            snapshot,
            capability: Some(Arc::new(capability)),
            audit_log,
        });
        Ok(())
    }

    async fn restore_session(&mut self, user_id: String, password: SecretString) -> VaultResult<bool> {
        let snapshot = self.fetch(&user_id).await?;

        let mut capability = None;
        let envelope_key = self.envelope_key(&user_id);
        if let Some(bytes) = self.store.get(&envelope_key)? {
            let masterkey = open_envelope(&EnvelopeBytes::from_vec(bytes), &password)?;
            let (_, derived) = self.derive(masterkey).await?;
            match verify_capability(&snapshot, &derived) {
                Ok(()) => capability = Some(Arc::new(derived)),
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "stored envelope is stale; removing it");
                    if let Err(e) = self.store.remove(&envelope_key) {
                        warn!(user_id = %user_id, error = %e, "stale envelope not removed");
                    }
                }
            }
        }

        if self.session.is_some() {
            self.end_session();
        }
        let restored = capability.is_some();
        let audit_log = self.load_audit(&user_id);
        info!(user_id = %user_id, restored, "session restored");
        self.session = Some(Session {
            user_id: user_id.clone(),
            password,
        });
        self.dispatch(Action::SessionStarted {
            user_id,
            snapshot,
            capability,
            audit_log,
        });
        Ok(restored)
    }

    async fn refresh(&mut self) -> VaultResult<()> {
        let user_id = self.session()?.user_id.clone();
        let snapshot = self.fetch(&user_id).await?;
        self.dispatch(Action::LoadArchive(snapshot));
        Ok(())
    }

    async fn unlock(&mut self, masterkey: Masterkey) -> VaultResult<()> {
        let user_id = self.session()?.user_id.clone();
        let (masterkey, capability) = self.derive(masterkey).await?;
        let snapshot = self.fetch(&user_id).await?;
        verify_capability(&snapshot, &capability)?;

        if let Some(session) = &self.session {
            self.store_envelope(&user_id, &masterkey, &session.password);
        }
        debug!(user_id = %user_id, "capability recovered");
        self.dispatch(Action::SetCapability {
            capability: Arc::new(capability),
            snapshot,
        });
        Ok(())
    }

    fn current_capability(&self) -> VaultResult<Arc<Capability>> {
        self.state
            .capability()
            .cloned()
            .ok_or(VaultError::CapabilityRequired)
    }

    /// Refuse to write under a Capability the live archive was not
    /// encrypted with. On mismatch the Capability is dropped and the next
    /// operation asks for the Masterkey.
    fn check_capability(&mut self, user_id: &str, fresh: &ArchiveSnapshot) -> VaultResult<()> {
        let capability = self.current_capability()?;
        if let Err(e) = verify_capability(fresh, &capability) {
            warn!(
                user_id,
                generation = fresh.archive().generation(),
                "archive no longer opens under the held capability"
            );
            self.dispatch(Action::CapabilityRevoked(fresh.clone()));
            return Err(e);
        }
        Ok(())
    }

    /// Encrypt, write, and re-fetch; returns the snapshot that shows the write.
    async fn write_secret(&self, user_id: &str, key: &EntryKey, secret: &SecretString) -> VaultResult<ArchiveSnapshot> {
        let capability = self.current_capability()?;
        let entry = SecretEntry {
            platform: key.platform.clone(),
            login: key.login.clone(),
            archive_file_id: Uuid::new_v4().to_string(),
        };
        let record = encrypt_entry(secret, &capability)?;
        self.remote
            .write_entry(user_id, EntryWrite {
                entry: entry.clone(),
                record,
            })
            .await?;

        let snapshot = self.fetch(user_id).await?;
        match snapshot.find(key) {
            Some(found) if found.archive_file_id == entry.archive_file_id => Ok(snapshot),
            _ => Err(VaultError::Remote(format!("write for {key} not visible after re-fetch"))),
        }
    }

    async fn add_secret(&mut self, key: EntryKey, secret: SecretString) -> VaultResult<()> {
        let user_id = self.session()?.user_id.clone();
        self.current_capability()?;

        let fresh = self.fetch(&user_id).await?;
        if fresh.find(&key).is_some() {
            return Err(VaultError::DuplicateEntry {
                platform: key.platform,
                login: key.login,
            });
        }
        self.check_capability(&user_id, &fresh)?;

        let snapshot = self.write_secret(&user_id, &key, &secret).await?;
        info!(user_id = %user_id, entry = %key, generation = snapshot.archive().generation(), "secret added");
        self.dispatch(Action::AddSecret {
            audit: AuditEntry::now(&key, AuditAction::Add),
            snapshot,
        });
        Ok(())
    }

    async fn update_secret(&mut self, key: EntryKey, secret: SecretString) -> VaultResult<()> {
        let user_id = self.session()?.user_id.clone();
        self.current_capability()?;

        let fresh = self.fetch(&user_id).await?;
        if fresh.find(&key).is_none() {
            return Err(VaultError::UnknownEntry {
                platform: key.platform,
                login: key.login,
            });
        }
        self.check_capability(&user_id, &fresh)?;

        let snapshot = self.write_secret(&user_id, &key, &secret).await?;
        info!(user_id = %user_id, entry = %key, generation = snapshot.archive().generation(), "secret updated");
        self.dispatch(Action::UpdateSecret {
            audit: AuditEntry::now(&key, AuditAction::Update),
            snapshot,
        });
        Ok(())
    }

    async fn delete_secret(&mut self, key: EntryKey) -> VaultResult<()> {
        let user_id = self.session()?.user_id.clone();

        let fresh = self.fetch(&user_id).await?;
        if fresh.find(&key).is_none() {
            return Err(VaultError::UnknownEntry {
                platform: key.platform,
                login: key.login,
            });
        }

        self.remote.delete_entry(&user_id, &key.platform, &key.login).await?;
        let snapshot = self.fetch(&user_id).await?;
        if snapshot.find(&key).is_some() {
            return Err(VaultError::Remote(format!("delete for {key} not visible after re-fetch")));
        }
        info!(user_id = %user_id, entry = %key, "secret deleted");
        self.dispatch(Action::DeleteSecret { snapshot, key });
        Ok(())
    }

    async fn rotate(&mut self, old: Masterkey, new: Masterkey) -> VaultResult<RotationReport> {
        let session = self.session()?;
        let envelope_key = self.envelope_key(&session.user_id);
        let envelope_rounds = self.config.envelope_rounds()?;

        let outcome = {
            let mut rotation = Rotation::new(RotationContext {
                remote: &*self.remote,
                store: &*self.store,
                user_id: &session.user_id,
                envelope_key: &envelope_key,
                secondary: &session.password,
                kdf: &self.kdf,
                envelope_rounds,
            });
            rotation.run(&old, &new).await?
        };

        let report = RotationReport {
            reencrypted: outcome.reencrypted,
            envelope_persisted: outcome.envelope_persisted,
            archive_refreshed: outcome.snapshot.is_some(),
        };
        self.dispatch(Action::Rotated {
            snapshot: outcome.snapshot,
            capability: Arc::new(outcome.capability),
        });
        Ok(report)
    }

    fn logout(&mut self) -> VaultResult<()> {
        self.session()?;
        self.end_session();
        Ok(())
    }
}
