//! HKDF-derived per-object HMAC-SHA256, incremental across parts.
//!
//! The engine itself is stateless and shared; callers (the stream engine,
//! multipart sessions) hold their own [`HmacState`].

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, Secret};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::config::IntegrityMode;
use crate::error::{Error, Result};

const HKDF_SALT: &[u8] = b"s3-proxy-integrity-v1";
const HKDF_INFO: &[u8] = b"file-hmac-key";

pub type Tag = [u8; 32];

fn derive_hmac_key(dek: &[u8]) -> Result<Secret<[u8; 32]>> {
    if dek.is_empty() {
        return Err(Error::Input("empty DEK"));
    }
    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), dek);
    let mut okm = [0u8; 32];
    hk.expand(HKDF_INFO, &mut okm)
        .map_err(|_| Error::Cipher("hkdf expand failed"))?;
    Ok(Secret::new(okm))
}

fn new_mac(dek: &[u8]) -> Result<Hmac<Sha256>> {
    let key = derive_hmac_key(dek)?;
    let mac = Hmac::<Sha256>::new_from_slice(key.expose_secret())
        .map_err(|_| Error::Cipher("invalid hmac key length"))?;
    // The Secret's own Drop zeroizes its backing array when `key` goes out
    // of scope here.
    Ok(mac)
}

/// Incremental HMAC accumulator bound to one object or multipart upload.
/// Part ingest order is enforced here as a sequencing check only; part
/// numbers are never mixed into the tag itself.
pub struct HmacState {
    mac: Hmac<Sha256>,
    next_part_number: u32,
}

impl HmacState {
    /// Ordering check only: `part_number` must equal the next expected part.
    /// Does not touch the accumulated MAC. Separated from [`Self::feed`] so
    /// the stream engine can check once per part and then feed many
    /// segments' worth of plaintext into that same part.
    pub fn begin_part(&mut self, part_number: u32) -> Result<()> {
        if part_number != self.next_part_number {
            return Err(Error::OutOfOrderPart {
                expected: self.next_part_number,
                got: part_number,
            });
        }
        self.next_part_number += 1;
        Ok(())
    }

    /// Appends plaintext bytes to the running MAC, no ordering check.
    pub fn feed(&mut self, data: &[u8]) {
        self.mac.update(data);
    }

    /// Convenience combining [`Self::begin_part`] and [`Self::feed`] for
    /// callers that already hold a whole part's plaintext in memory.
    pub fn update(&mut self, data: &[u8], part_number: u32) -> Result<()> {
        self.begin_part(part_number)?;
        self.feed(data);
        Ok(())
    }

    pub fn finalize(self) -> Tag {
        let bytes = self.mac.finalize().into_bytes();
        let mut tag = [0u8; 32];
        tag.copy_from_slice(&bytes);
        tag
    }
}

pub struct HmacEngine;

impl HmacEngine {
    /// One-shot HMAC over a complete plaintext buffer.
    pub fn calculate(data: &[u8], dek: &[u8]) -> Result<Tag> {
        let mut mac = new_mac(dek)?;
        mac.update(data);
        let bytes = mac.finalize().into_bytes();
        let mut tag = [0u8; 32];
        tag.copy_from_slice(&bytes);
        Ok(tag)
    }

    pub fn new_state(dek: &[u8]) -> Result<HmacState> {
        Ok(HmacState {
            mac: new_mac(dek)?,
            next_part_number: 1,
        })
    }

    /// One-shot verification over a complete buffer. `expected_tag` is
    /// `None` when the object's metadata carries no `hmac` field at all.
    pub fn verify(
        data: &[u8],
        expected_tag: Option<&[u8]>,
        dek: &[u8],
        policy: IntegrityMode,
    ) -> Result<()> {
        if matches!(policy, IntegrityMode::Off) {
            return Ok(());
        }
        let computed = Self::calculate(data, dek)?;
        Self::verify_tag(&computed, expected_tag, policy)
    }

    /// Same as `verify`, but takes an already-computed tag (the streaming
    /// path finalizes an [`HmacState`] rather than re-hashing a buffer).
    pub fn verify_tag(
        computed: &Tag,
        expected_tag: Option<&[u8]>,
        policy: IntegrityMode,
    ) -> Result<()> {
        match (policy, expected_tag) {
            (IntegrityMode::Off, _) => Ok(()),
            (IntegrityMode::Lax, None) => Ok(()),
            (IntegrityMode::Lax, Some(expected)) => {
                if constant_time_eq(computed, expected) {
                    Ok(())
                } else {
                    tracing::warn!("hmac mismatch under lax integrity policy; continuing");
                    Ok(())
                }
            }
            (IntegrityMode::Hybrid, None) => Ok(()),
            (IntegrityMode::Hybrid, Some(expected)) | (IntegrityMode::Strict, Some(expected)) => {
                if constant_time_eq(computed, expected) {
                    Ok(())
                } else {
                    Err(Error::HmacMismatch)
                }
            }
            (IntegrityMode::Strict, None) => Err(Error::HmacMismatch),
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
