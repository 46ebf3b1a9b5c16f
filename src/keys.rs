//! Key derivation and ownership.
//!
//! This module owns two responsibilities:
//! 1. Deriving the per-user Capability from a human Masterkey, and the
//!    Envelope wrapping key from the secondary secret, using
//!    PBKDF2-HMAC-SHA256.
//! 2. Holding secret material in types that are opaque, non-cloneable,
//!    redacted in `Debug`, and zeroised on drop.
//!
//! ## Derivation structure
//!
//! ```text
//! Capability   = PBKDF2-HMAC-SHA256(masterkey, "lockbox/capability/v1:" ‖ context, kdf_iterations)
//! Wrapping key = PBKDF2-HMAC-SHA256(secondary, "lockbox/envelope/v1:" ‖ random_salt, envelope_iterations)
//! ```
//!
//! The Capability salt is fixed and application-known, so the same
//! Masterkey always reproduces the key that encrypted existing entries.

use std::fmt;
use std::num::NonZeroU32;

use ring::pbkdf2;
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroizing;

use crate::crypto::{secrets_equal, KEY_LEN};
use crate::error::{VaultError, VaultResult};

static PBKDF2_ALG: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;

const CAPABILITY_DOMAIN: &[u8] = b"lockbox/capability/v1:";
const ENVELOPE_DOMAIN: &[u8] = b"lockbox/envelope/v1:";

// ---------------------------------------------------------------------------
// Masterkey
// ---------------------------------------------------------------------------

/// The user-memorised secret. Lives only in memory for one session and is
/// persisted nowhere except inside a sealed Envelope.
pub struct Masterkey(SecretString);

impl Masterkey {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(SecretString::from(secret.into()))
    }

    pub(crate) fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.expose().is_empty()
    }

    /// Compare two Masterkeys in constant time.
    pub fn matches(&self, other: &Masterkey) -> bool {
        secrets_equal(self.expose().as_bytes(), other.expose().as_bytes())
    }
}

impl From<&str> for Masterkey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Debug for Masterkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Masterkey([REDACTED])")
    }
}

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

/// The symmetric key derived from a Masterkey. Encrypts every entry.
///
/// - Not `Clone`. Shared across tasks behind an `Arc`.
/// - Zeroised on drop.
pub struct Capability {
    bytes: Zeroizing<[u8; KEY_LEN]>,
}

impl Capability {
    pub(crate) fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            bytes: Zeroizing::new(bytes),
        }
    }

    /// `pub(crate)`: raw bytes never leave the crate.
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl PartialEq for Capability {
    fn eq(&self, other: &Self) -> bool {
        secrets_equal(self.as_bytes(), other.as_bytes())
    }
}

impl Eq for Capability {}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Capability([REDACTED])")
    }
}

// ---------------------------------------------------------------------------
// Derivation
// ---------------------------------------------------------------------------

/// Fixed derivation policy for the Capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfParams {
    pub iterations: NonZeroU32,
    pub context: String,
}

impl KdfParams {
    pub fn new(iterations: u32, context: impl Into<String>) -> VaultResult<Self> {
        let iterations = NonZeroU32::new(iterations).ok_or(VaultError::KeyDerivationFailure)?;
        Ok(Self {
            iterations,
            context: context.into(),
        })
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            iterations: NonZeroU32::new(crate::config::DEFAULT_KDF_ITERATIONS)
                .unwrap_or(NonZeroU32::MIN),
            context: crate::config::DEFAULT_KDF_CONTEXT.to_string(),
        }
    }
}

fn pbkdf2_derive(secret: &[u8], domain: &[u8], salt: &[u8], iterations: NonZeroU32) -> [u8; KEY_LEN] {
    let mut full_salt = Vec::with_capacity(domain.len() + salt.len());
    full_salt.extend_from_slice(domain);
    full_salt.extend_from_slice(salt);

    let mut out = [0u8; KEY_LEN];
    pbkdf2::derive(PBKDF2_ALG, iterations, &full_salt, secret, &mut out);
    out
}

/// Derive the Capability for `masterkey`.
///
/// Pure and deterministic: identical Masterkey and parameters always give
/// the identical Capability. Fails only on an empty Masterkey.
pub fn derive_capability(masterkey: &Masterkey, params: &KdfParams) -> VaultResult<Capability> {
    if masterkey.is_empty() {
        return Err(VaultError::EmptyInput);
    }
    let bytes = pbkdf2_derive(
        masterkey.expose().as_bytes(),
        CAPABILITY_DOMAIN,
        params.context.as_bytes(),
        params.iterations,
    );
    Ok(Capability::from_bytes(bytes))
}

/// Derive the key that wraps the Masterkey inside an Envelope.
pub(crate) fn derive_wrapping_key(
    secondary: &SecretString,
    salt: &[u8],
    iterations: NonZeroU32,
) -> VaultResult<Zeroizing<[u8; KEY_LEN]>> {
    let secret = secondary.expose_secret();
    if secret.is_empty() {
        return Err(VaultError::EmptyInput);
    }
    Ok(Zeroizing::new(pbkdf2_derive(
        secret.as_bytes(),
        ENVELOPE_DOMAIN,
        salt,
        iterations,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> KdfParams {
        KdfParams::new(1_000, "unit-test").unwrap()
    }

    #[test]
    fn masterkey_matches_only_itself() {
        let key = Masterkey::from("correct-horse");
        assert!(key.matches(&Masterkey::from("correct-horse")));
        assert!(!key.matches(&Masterkey::from("correct-horsE")));
        assert!(!key.matches(&Masterkey::from("correct-horse-battery")));
        assert!(!key.matches(&Masterkey::from("")));
    }

    #[test]
    fn derivation_is_deterministic() {
        let a = derive_capability(&Masterkey::from("correct-horse"), &fast()).unwrap();
        let b = derive_capability(&Masterkey::from("correct-horse"), &fast()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn different_masterkeys_give_different_capabilities() {
        let a = derive_capability(&Masterkey::from("correct-horse"), &fast()).unwrap();
        let b = derive_capability(&Masterkey::from("correct-horsf"), &fast()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn context_separates_capabilities() {
        let mk = Masterkey::from("correct-horse");
        let a = derive_capability(&mk, &KdfParams::new(1_000, "deploy-a").unwrap()).unwrap();
        let b = derive_capability(&mk, &KdfParams::new(1_000, "deploy-b").unwrap()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn empty_masterkey_is_rejected() {
        let err = derive_capability(&Masterkey::from(""), &fast()).unwrap_err();
        assert!(matches!(err, VaultError::EmptyInput));
    }

    #[test]
    fn zero_iterations_rejected() {
        assert!(KdfParams::new(0, "ctx").is_err());
    }

    #[test]
    fn debug_is_redacted() {
        let mk = Masterkey::from("correct-horse");
        assert!(!format!("{mk:?}").contains("horse"));
        let cap = derive_capability(&mk, &fast()).unwrap();
        assert_eq!(format!("{cap:?}"), "Capability([REDACTED])");
    }
}
