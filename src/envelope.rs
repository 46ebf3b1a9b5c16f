//! Masterkey Envelope for session restore.
//!
//! The Envelope is the Masterkey sealed under a key derived from the
//! user's login password (the secondary secret). It exists so a reload can
//! recover the Capability without re-typing the Masterkey; it is not a
//! security boundary. The Masterkey itself never leaves the client.
//!
//! ## Layout
//!
//! ```text
//! [ version (1) ][ iterations (u32 BE) ][ salt (16) ][ nonce (12) ][ ciphertext + GCM tag ]
//! ```
//!
//! Every structural or cryptographic failure while opening is reported as
//! [`VaultError::Integrity`], the sole signal for "wrong secondary secret".

use std::num::NonZeroU32;

use secrecy::SecretString;

use crate::crypto::{self, NONCE_LEN, TAG_LEN};
use crate::error::{VaultError, VaultResult};
use crate::keys::{self, Masterkey};

const ENVELOPE_VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const HEADER_LEN: usize = 1 + 4 + SALT_LEN + NONCE_LEN;

/// Encoded Envelope, ready for the local key-value store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeBytes(Vec<u8>);

impl EnvelopeBytes {
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }
}

/// Seal `masterkey` under a key derived from `secondary`.
///
/// A fresh salt and nonce are drawn for every call, so sealing the same
/// Masterkey twice yields different envelopes. The caller persists the
/// result.
pub fn seal_masterkey(
    masterkey: &Masterkey,
    secondary: &SecretString,
    iterations: NonZeroU32,
) -> VaultResult<EnvelopeBytes> {
    if masterkey.is_empty() {
        return Err(VaultError::EmptyInput);
    }

    let salt = crypto::random_array::<SALT_LEN>()?;
    let wrapping_key = keys::derive_wrapping_key(secondary, &salt, iterations)?;
    let (ciphertext, nonce) = crypto::seal(&wrapping_key, masterkey.expose().as_bytes())?;

    let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    out.push(ENVELOPE_VERSION);
    out.extend_from_slice(&iterations.get().to_be_bytes());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(EnvelopeBytes(out))
}

/// Recover the Masterkey from an Envelope.
///
/// Never returns garbage: a wrong secondary secret, any flipped bit, a
/// truncated buffer or an unknown version all fail with `Integrity`.
pub fn open_envelope(envelope: &EnvelopeBytes, secondary: &SecretString) -> VaultResult<Masterkey> {
    let bytes = envelope.as_bytes();
    if bytes.len() < HEADER_LEN + TAG_LEN || bytes[0] != ENVELOPE_VERSION {
        return Err(VaultError::Integrity);
    }

    let iterations = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    let iterations = NonZeroU32::new(iterations).ok_or(VaultError::Integrity)?;
    let salt = &bytes[5..5 + SALT_LEN];
    let nonce: [u8; NONCE_LEN] = bytes[5 + SALT_LEN..HEADER_LEN]
        .try_into()
        .map_err(|_| VaultError::Integrity)?;

    let wrapping_key = keys::derive_wrapping_key(secondary, salt, iterations)?;
    let plaintext = crypto::open(&wrapping_key, &nonce, &bytes[HEADER_LEN..])
        .map_err(|_| VaultError::Integrity)?;

    let secret = String::from_utf8(plaintext).map_err(|_| VaultError::Integrity)?;
    Ok(Masterkey::new(secret))
}
