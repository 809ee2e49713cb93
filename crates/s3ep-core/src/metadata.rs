//! Translation between logical envelope-encryption fields and the prefixed
//! string map that rides alongside an object at the origin store.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};

use crate::error::{Error, Result};

pub type Metadata = HashMap<String, String>;

const KEY_DEK_ALGORITHM: &str = "dek-algorithm";
const KEY_ENCRYPTED_DEK: &str = "encrypted-dek";
const KEY_AES_IV: &str = "aes-iv";
const KEY_KEK_FINGERPRINT: &str = "kek-fingerprint";
const KEY_KEK_ALGORITHM: &str = "kek-algorithm";
const KEY_HMAC: &str = "hmac";

/// Legacy unprefixed keys accepted on read for back-compat.
const LEGACY_KEYS: &[&str] = &[
    KEY_ENCRYPTED_DEK,
    KEY_KEK_FINGERPRINT,
    KEY_DEK_ALGORITHM,
    KEY_AES_IV,
];

#[derive(Clone)]
pub struct MetadataCodec {
    prefix: String,
}

impl Default for MetadataCodec {
    fn default() -> Self {
        MetadataCodec::new(crate::config::DEFAULT_METADATA_PREFIX)
    }
}

impl MetadataCodec {
    pub fn new(prefix: impl Into<String>) -> Self {
        MetadataCodec {
            prefix: prefix.into(),
        }
    }

    fn key(&self, logical: &str) -> String {
        format!("{}{}", self.prefix, logical)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn build_encrypt_metadata(
        &self,
        wrapped_dek: &[u8],
        iv: &[u8],
        algorithm: &str,
        fingerprint: &str,
        kek_algorithm: &str,
        user_metadata: &Metadata,
    ) -> Metadata {
        let mut map = user_metadata.clone();
        map.insert(self.key(KEY_DEK_ALGORITHM), algorithm.to_string());
        map.insert(self.key(KEY_ENCRYPTED_DEK), B64.encode(wrapped_dek));
        map.insert(self.key(KEY_AES_IV), B64.encode(iv));
        map.insert(self.key(KEY_KEK_FINGERPRINT), fingerprint.to_string());
        map.insert(self.key(KEY_KEK_ALGORITHM), kek_algorithm.to_string());
        map
    }

    pub fn set_hmac(&self, map: &mut Metadata, tag: &[u8]) {
        map.insert(self.key(KEY_HMAC), B64.encode(tag));
    }

    fn lookup<'a>(&self, map: &'a Metadata, logical: &str) -> Option<&'a str> {
        map.get(&self.key(logical))
            .or_else(|| {
                if LEGACY_KEYS.contains(&logical) {
                    map.get(logical)
                } else {
                    None
                }
            })
            .map(|s| s.as_str())
    }

    pub fn extract_wrapped_dek(&self, map: &Metadata) -> Result<Vec<u8>> {
        let raw = self
            .lookup(map, KEY_ENCRYPTED_DEK)
            .ok_or_else(|| Error::Metadata("missing encrypted-dek".to_string()))?;
        B64.decode(raw)
            .map_err(|e| Error::Metadata(format!("invalid encrypted-dek base64: {e}")))
    }

    pub fn extract_iv(&self, map: &Metadata) -> Result<Vec<u8>> {
        let raw = self
            .lookup(map, KEY_AES_IV)
            .ok_or_else(|| Error::Metadata("missing aes-iv".to_string()))?;
        B64.decode(raw).map_err(|e| Error::Metadata(format!("invalid aes-iv base64: {e}")))
    }

    pub fn extract_algorithm(&self, map: &Metadata) -> Result<String> {
        self.lookup(map, KEY_DEK_ALGORITHM)
            .map(str::to_string)
            .ok_or_else(|| Error::Metadata("missing dek-algorithm".to_string()))
    }

    pub fn extract_fingerprint(&self, map: &Metadata) -> Result<String> {
        self.lookup(map, KEY_KEK_FINGERPRINT)
            .map(str::to_string)
            .ok_or_else(|| Error::Metadata("missing kek-fingerprint".to_string()))
    }

    /// Returns `(tag_bytes, present)`. `present == false` means the object
    /// predates integrity verification, or it was written with it disabled.
    pub fn extract_hmac(&self, map: &Metadata) -> Result<(Vec<u8>, bool)> {
        match self.lookup(map, KEY_HMAC) {
            None => Ok((Vec::new(), false)),
            Some(raw) => {
                let bytes = B64
                    .decode(raw)
                    .map_err(|e| Error::Metadata(format!("invalid hmac base64: {e}")))?;
                Ok((bytes, true))
            }
        }
    }

    /// Strips every proxy-owned key before returning metadata to an
    /// external reader.
    pub fn filter_for_client(&self, map: &Metadata) -> Metadata {
        map.iter()
            .filter(|(k, _)| !k.starts_with(&self.prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Checks that the required fields for decryption are present.
    pub fn validate(&self, map: &Metadata) -> Result<()> {
        if self.lookup(map, KEY_ENCRYPTED_DEK).is_none() {
            return Err(Error::Metadata("missing encrypted-dek".to_string()));
        }
        if self.lookup(map, KEY_KEK_FINGERPRINT).is_none() {
            return Err(Error::Metadata("missing kek-fingerprint".to_string()));
        }
        Ok(())
    }
}
