//! Error types for lockbox.
//!
//! Every variant is a distinct failure mode of the vault. Messages are
//! intentionally minimal: they signal *what* failed without carrying
//! plaintext, Masterkey material or key bytes.

use thiserror::Error;

/// Result alias used across the crate.
pub type VaultResult<T> = Result<T, VaultError>;

/// The single error type for all lockbox operations.
#[derive(Debug, Error)]
pub enum VaultError {
    /// A secret input (Masterkey, secondary secret) was empty.
    #[error("empty secret input")]
    EmptyInput,

    /// Key material had the wrong shape for the AEAD primitive.
    #[error("invalid key")]
    InvalidKey,

    /// The AEAD seal operation failed.
    #[error("encryption failed")]
    EncryptionFailure,

    /// The system random number generator failed to produce bytes.
    #[error("randomness source failed")]
    RandomnessFailure,

    /// PBKDF2 parameters were unusable.
    #[error("key derivation failed")]
    KeyDerivationFailure,

    /// The Envelope could not be opened: wrong secondary secret or a
    /// tampered/truncated envelope.
    #[error("envelope integrity check failed")]
    Integrity,

    /// Per-entry authentication failed: wrong Capability or corrupted data.
    #[error("decryption failed")]
    Decryption,

    /// A live entry names a blob the archive does not contain.
    #[error("archive blob missing: {0}")]
    MissingBlob(String),

    /// A blob exists but is not a well-formed CipherRecord.
    #[error("malformed cipher record: {0}")]
    MalformedRecord(&'static str),

    /// The server-delivered container could not be decoded.
    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    /// Rotation precondition: the claimed old Masterkey is not the current one.
    #[error("old masterkey does not match")]
    InvalidOldMasterkey,

    /// The remote storage collaborator failed (network, timeout, rejection).
    #[error("remote storage failed: {0}")]
    Remote(String),

    /// The local durable key-value store failed.
    #[error("local storage failed: {0}")]
    Storage(String),

    /// Configuration was rejected by validation or parsing.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The operation needs a Capability and none is loaded.
    #[error("masterkey required")]
    CapabilityRequired,

    /// An entry with the same (platform, login) already exists.
    #[error("entry already exists: {platform} / {login}")]
    DuplicateEntry { platform: String, login: String },

    /// No entry with the given (platform, login) exists.
    #[error("entry not found: {platform} / {login}")]
    UnknownEntry { platform: String, login: String },

    /// There is no active session for the requested operation.
    #[error("no active session")]
    NoSession,

    /// The synchronizer task is no longer running.
    #[error("vault synchronizer is closed")]
    Closed,
}

/// How the UI layer should react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retrying with the same inputs fails again; ask for the Masterkey.
    NeedsMasterkey,
    /// Transient collaborator failure; the same request may be retried.
    Retry,
    /// Programming, configuration or local invariant failure.
    Fatal,
}

impl VaultError {
    /// Classify the error for user-visible handling.
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Integrity
            | Self::Decryption
            | Self::MalformedRecord(_)
            | Self::InvalidOldMasterkey
            | Self::CapabilityRequired => FailureClass::NeedsMasterkey,
            Self::Remote(_) | Self::Closed => FailureClass::Retry,
            _ => FailureClass::Fatal,
        }
    }

    /// Fixed, secret-free text for the UI.
    pub fn user_message(&self) -> &'static str {
        match self.class() {
            FailureClass::NeedsMasterkey => "operation failed, provide Masterkey",
            FailureClass::Retry => "operation failed, try again",
            FailureClass::Fatal => "operation failed",
        }
    }
}
