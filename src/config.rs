//! Vault configuration.

use std::num::NonZeroU32;

use serde::{Deserialize, Serialize};

use crate::error::{VaultError, VaultResult};
use crate::keys::KdfParams;

pub(crate) const DEFAULT_KDF_ITERATIONS: u32 = 600_000;
pub(crate) const DEFAULT_KDF_CONTEXT: &str = "lockbox-default-deployment";

/// Deployment and session parameters for the vault.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VaultConfig {
    /// Scope of the Envelope in the local store (one per browser profile).
    pub device_profile: String,

    /// PBKDF2-HMAC-SHA256 rounds for the Capability. Fixed per deployment:
    /// changing it makes existing entries undecryptable.
    pub kdf_iterations: u32,

    /// Application-known derivation context (the Capability salt).
    pub kdf_context: String,

    /// PBKDF2 rounds for the Envelope wrapping key. Stored inside each
    /// Envelope, so it may change between releases.
    pub envelope_iterations: u32,

    /// Size of the recent audit window shown in the UI.
    pub audit_window: usize,

    /// Maximum number of records kept in the persisted audit log.
    pub audit_log_capacity: usize,

    /// Mailbox size of the synchronizer task.
    pub command_buffer: usize,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            device_profile: "default".to_string(),
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
            kdf_context: DEFAULT_KDF_CONTEXT.to_string(),
            envelope_iterations: 210_000,
            audit_window: 10,
            audit_log_capacity: 500,
            command_buffer: 32,
        }
    }
}

impl VaultConfig {
    /// Parse a TOML document; missing keys take their defaults.
    pub fn from_toml_str(source: &str) -> VaultResult<Self> {
        let config: Self = toml::from_str(source).map_err(|e| VaultError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> VaultResult<()> {
        if self.kdf_iterations == 0 || self.envelope_iterations == 0 {
            return Err(VaultError::Config("iterations must be positive".into()));
        }
        if self.kdf_context.is_empty() {
            return Err(VaultError::Config("kdf_context must not be empty".into()));
        }
        if self.device_profile.is_empty() {
            return Err(VaultError::Config("device_profile must not be empty".into()));
        }
        if self.audit_window == 0 || self.audit_log_capacity == 0 {
            return Err(VaultError::Config("audit sizes must be positive".into()));
        }
        if self.command_buffer == 0 {
            return Err(VaultError::Config("command_buffer must be positive".into()));
        }
        Ok(())
    }

    pub fn kdf_params(&self) -> VaultResult<KdfParams> {
        KdfParams::new(self.kdf_iterations, self.kdf_context.clone())
            .map_err(|_| VaultError::Config("kdf_iterations must be positive".into()))
    }

    pub fn envelope_rounds(&self) -> VaultResult<NonZeroU32> {
        NonZeroU32::new(self.envelope_iterations)
            .ok_or_else(|| VaultError::Config("envelope_iterations must be positive".into()))
    }

    /// Low-cost parameters for tests and demos. Never use in production.
    pub fn insecure_fast() -> Self {
        Self {
            kdf_iterations: 1_000,
            envelope_iterations: 1_000,
            ..Self::default()
        }
    }
}
