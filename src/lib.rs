//! # lockbox
//!
//! Client-side encrypted password vault.
//!
//! Secrets are encrypted in the client under a Capability derived from the
//! user's Masterkey and stored remotely as opaque blobs inside a per-user
//! archive. The server never sees plaintext or key material. The Masterkey
//! is kept across sessions only inside an Envelope sealed under the login
//! password.
//!
//! ## Public API
//!
//! - [`sync::spawn`] starts the synchronizer and returns a [`VaultHandle`],
//!   the entry point for sessions, secret operations and rotation.
//! - [`keys`], [`envelope`] and [`entry`] expose the primitives directly.
//! - [`RemoteStorage`] and [`KeyValueStore`] are the I/O seams; in-memory
//!   implementations ship for tests and demos.
//!
//! The AES-GCM and random number plumbing stays `pub(crate)`.

pub mod archive;
pub mod audit;
pub mod config;
pub(crate) mod crypto;
pub mod entry;
pub mod envelope;
pub mod error;
pub mod keys;
pub mod record;
pub mod remote;
pub mod rotation;
pub mod state;
pub mod store;
pub mod sync;

pub use archive::{Archive, ArchiveSnapshot, EntryKey, SecretEntry};
pub use audit::{AuditAction, AuditEntry, AuditLog};
pub use config::VaultConfig;
pub use error::{FailureClass, VaultError, VaultResult};
pub use keys::{Capability, KdfParams, Masterkey};
pub use record::CipherRecord;
pub use remote::{MemoryRemote, RemoteStorage};
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use sync::{Completion, Recovery, RotationReport, VaultHandle};

/// Re-exported so callers can build secrets without a direct dependency.
pub use secrecy::{ExposeSecret, SecretString};
