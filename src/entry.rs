//! Per-entry encryption engine.
//!
//! Each call is independent: the Capability is immutable input and no
//! state is shared between calls, so entries can be sealed and opened in
//! parallel.

use secrecy::{ExposeSecret, SecretString};

use crate::crypto;
use crate::error::{VaultError, VaultResult};
use crate::keys::Capability;
use crate::record::CipherRecord;

/// Encrypt one secret under `capability` with a fresh 96-bit IV.
pub fn encrypt_entry(plaintext: &SecretString, capability: &Capability) -> VaultResult<CipherRecord> {
    let (ciphertext, iv) = crypto::seal(capability.as_bytes(), plaintext.expose_secret().as_bytes())?;
    Ok(CipherRecord { ciphertext, iv })
}

/// Decrypt one record. Any authentication failure is `Decryption`; no
/// partial plaintext is ever returned.
pub fn decrypt_entry(record: &CipherRecord, capability: &Capability) -> VaultResult<SecretString> {
    let plaintext = crypto::open(capability.as_bytes(), &record.iv, &record.ciphertext)
        .map_err(|_| VaultError::Decryption)?;
    let text = String::from_utf8(plaintext).map_err(|_| VaultError::Decryption)?;
    Ok(SecretString::from(text))
}
