//! CipherRecord: the stored form of one encrypted secret.
//!
//! Binary layout written by this crate:
//!
//! ```text
//! [ version (1) ][ len (u32 BE) ][ ciphertext + tag ][ len (u32 BE) ][ iv ]
//! ```
//!
//! Older clients stored `base64(ciphertext):base64(iv)` as text. That form
//! is still accepted when decoding so their archives stay readable, but it
//! is never written.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::crypto::NONCE_LEN;
use crate::error::{VaultError, VaultResult};

const RECORD_VERSION: u8 = 1;

/// One encrypted secret: AEAD output plus the IV it was sealed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherRecord {
    pub ciphertext: Vec<u8>,
    pub iv: [u8; NONCE_LEN],
}

impl CipherRecord {
    /// Encode into the length-prefixed binary layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 4 + self.ciphertext.len() + 4 + NONCE_LEN);
        out.push(RECORD_VERSION);
        push_field(&mut out, &self.ciphertext);
        push_field(&mut out, &self.iv);
        out
    }

    /// Decode a stored blob, binary or legacy text.
    ///
    /// Anything that is not exactly two non-empty components is malformed;
    /// a blob is never treated as "empty".
    pub fn decode(bytes: &[u8]) -> VaultResult<Self> {
        match bytes.first() {
            None => Err(VaultError::MalformedRecord("empty blob")),
            Some(&RECORD_VERSION) => Self::decode_binary(&bytes[1..]),
            Some(_) => Self::decode_legacy_text(bytes),
        }
    }

    fn decode_binary(mut rest: &[u8]) -> VaultResult<Self> {
        let ciphertext = take_field(&mut rest)?;
        let iv = take_field(&mut rest)?;
        if !rest.is_empty() {
            return Err(VaultError::MalformedRecord("trailing bytes"));
        }
        Self::from_parts(ciphertext.to_vec(), iv)
    }

    fn decode_legacy_text(bytes: &[u8]) -> VaultResult<Self> {
        let text = std::str::from_utf8(bytes).map_err(|_| VaultError::MalformedRecord("not utf-8"))?;
        let mut parts = text.trim().split(':');
        let (Some(ct), Some(iv), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(VaultError::MalformedRecord("expected ciphertext:iv"));
        };
        if ct.is_empty() || iv.is_empty() {
            return Err(VaultError::MalformedRecord("empty component"));
        }
        let ciphertext = STANDARD
            .decode(ct)
            .map_err(|_| VaultError::MalformedRecord("ciphertext is not base64"))?;
        let iv = STANDARD
            .decode(iv)
            .map_err(|_| VaultError::MalformedRecord("iv is not base64"))?;
        Self::from_parts(ciphertext, &iv)
    }

    fn from_parts(ciphertext: Vec<u8>, iv: &[u8]) -> VaultResult<Self> {
        if ciphertext.is_empty() || iv.is_empty() {
            return Err(VaultError::MalformedRecord("empty component"));
        }
        let iv: [u8; NONCE_LEN] = iv
            .try_into()
            .map_err(|_| VaultError::MalformedRecord("iv must be 96 bits"))?;
        Ok(Self { ciphertext, iv })
    }

    /// Render in the legacy `ciphertext:iv` text form. Only used to build
    /// fixtures that mimic archives written by older clients.
    pub fn to_legacy_text(&self) -> String {
        format!("{}:{}", STANDARD.encode(&self.ciphertext), STANDARD.encode(self.iv))
    }
}

fn push_field(out: &mut Vec<u8>, field: &[u8]) {
    // Entry payloads are passwords; u32 lengths are never exceeded.
    out.extend_from_slice(&(field.len() as u32).to_be_bytes());
    out.extend_from_slice(field);
}

fn take_field<'a>(rest: &mut &'a [u8]) -> VaultResult<&'a [u8]> {
    if rest.len() < 4 {
        return Err(VaultError::MalformedRecord("truncated length"));
    }
    let (len_bytes, tail) = rest.split_at(4);
    let len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
    if tail.len() < len {
        return Err(VaultError::MalformedRecord("truncated field"));
    }
    let (field, tail) = tail.split_at(len);
    *rest = tail;
    Ok(field)
}
