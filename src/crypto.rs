//! Low-level cryptographic operations.
//!
//! This module and `keys` are the only places in the crate that import
//! `ring` directly. Everything else seals and opens through the functions
//! exposed here.
//!
//! Primitive choices:
//! - **Cipher**: AES-256-GCM (authenticated encryption)
//! - **Nonce**: 96-bit (12 bytes), generated fresh per operation via `SystemRandom`
//! - **Key size**: 256 bits (32 bytes)

use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{VaultError, VaultResult};

/// The AEAD algorithm used throughout lockbox. Fixed per deployment.
const ALGORITHM: &aead::Algorithm = &AES_256_GCM;

/// Size of the nonce in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// Size of a Capability or wrapping key in bytes (256 bits).
pub const KEY_LEN: usize = 32;

/// Size of the GCM authentication tag appended to every ciphertext.
pub const TAG_LEN: usize = 16;

/// Fill a fixed-size buffer from the system CSPRNG.
pub(crate) fn random_array<const N: usize>() -> VaultResult<[u8; N]> {
    let rng = SystemRandom::new();
    let mut buf = [0u8; N];
    rng.fill(&mut buf).map_err(|_| VaultError::RandomnessFailure)?;
    Ok(buf)
}

fn less_safe_key(key_bytes: &[u8; KEY_LEN]) -> VaultResult<LessSafeKey> {
    let unbound = UnboundKey::new(ALGORITHM, key_bytes).map_err(|_| VaultError::InvalidKey)?;
    Ok(LessSafeKey::new(unbound))
}

/// Encrypt `plaintext` with AES-256-GCM under a fresh random nonce.
///
/// Returns `(ciphertext_with_tag, nonce)`. There is no nonce caching or
/// counter: every call draws a new nonce from the CSPRNG.
pub(crate) fn seal(
    key_bytes: &[u8; KEY_LEN],
    plaintext: &[u8],
) -> VaultResult<(Vec<u8>, [u8; NONCE_LEN])> {
    let key = less_safe_key(key_bytes)?;
    let nonce_bytes = random_array::<NONCE_LEN>()?;

    let mut in_out = Vec::with_capacity(plaintext.len() + ALGORITHM.tag_len());
    in_out.extend_from_slice(plaintext);

    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce_bytes),
        Aad::empty(),
        &mut in_out,
    )
    .map_err(|_| VaultError::EncryptionFailure)?;

    Ok((in_out, nonce_bytes))
}

/// Decrypt AES-256-GCM `ciphertext` (tag appended) sealed under `nonce`.
///
/// If the key is wrong or any byte was altered, the tag check fails and
/// the caller receives no partial plaintext. The error is mapped by the
/// caller into the domain-specific failure (`Decryption` or `Integrity`).
pub(crate) fn open(
    key_bytes: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, ring::error::Unspecified> {
    let unbound = UnboundKey::new(ALGORITHM, key_bytes)?;
    let key = LessSafeKey::new(unbound);

    let mut payload = ciphertext.to_vec();
    let plaintext = key.open_in_place(Nonce::assume_unique_for_key(*nonce), Aad::empty(), &mut payload)?;
    Ok(plaintext.to_vec())
}

/// Compare two secrets without a data-dependent early exit.
///
/// Both sides go through HMAC under a one-off key; `hmac::verify` checks
/// the tags in constant time. Returns false if no key could be drawn.
pub(crate) fn secrets_equal(a: &[u8], b: &[u8]) -> bool {
    let Ok(key) = hmac::Key::generate(hmac::HMAC_SHA256, &SystemRandom::new()) else {
        return false;
    };
    let tag = hmac::sign(&key, a);
    hmac::verify(&key, b, tag.as_ref()).is_ok()
}
