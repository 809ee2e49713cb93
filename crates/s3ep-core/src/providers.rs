//! KEK resolution and DEK wrap/unwrap.
//!
//! `KeyEncryptor` is the external capability the core consumes to wrap and
//! unwrap DEK bytes under a named provider. The two implementations here
//! (`NoneProvider`, `StaticKeyProvider`) make the registry testable without
//! a real KMS; a production deployment plugs in its own `KeyEncryptor` for
//! whatever key-management service it fronts.

use std::collections::HashMap;

use aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Sentinel fingerprint the read path uses to detect a pass-through object
/// without consulting metadata.
pub const NONE_PROVIDER_FINGERPRINT: &str = "none-provider-fingerprint";

/// Capability to wrap and unwrap DEK bytes under one KEK.
pub trait KeyEncryptor: Send + Sync {
    fn wrap(&self, dek: &[u8]) -> Result<Vec<u8>>;
    fn unwrap(&self, wrapped: &[u8]) -> Result<Vec<u8>>;
    /// True for the pass-through "none" provider.
    fn is_passthrough(&self) -> bool {
        false
    }
    /// Wrap algorithm label persisted into an object's `kek-algorithm`
    /// metadata field, distinct from the KEK's fingerprint.
    fn algorithm_label(&self) -> &'static str;
}

/// The pass-through KEK: every crypto operation becomes byte-identity.
pub struct NoneProvider;

impl KeyEncryptor for NoneProvider {
    fn wrap(&self, dek: &[u8]) -> Result<Vec<u8>> {
        Ok(dek.to_vec())
    }

    fn unwrap(&self, wrapped: &[u8]) -> Result<Vec<u8>> {
        Ok(wrapped.to_vec())
    }

    fn is_passthrough(&self) -> bool {
        true
    }

    fn algorithm_label(&self) -> &'static str {
        "none"
    }
}

/// Wraps a DEK with AES-256-GCM under a statically configured 32-byte KEK.
/// Output shape is `nonce(12) || ciphertext || tag(16)`.
pub struct StaticKeyProvider {
    kek: [u8; 32],
}

impl StaticKeyProvider {
    pub fn new(kek: [u8; 32]) -> Self {
        StaticKeyProvider { kek }
    }

    /// Content-addressed fingerprint: first 16 hex chars of SHA-256(kek).
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.kek);
        hex::encode(&digest[..8])
    }
}

impl KeyEncryptor for StaticKeyProvider {
    fn wrap(&self, dek: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new_from_slice(&self.kek)
            .map_err(|_| Error::Cipher("invalid KEK length"))?;
        let mut nonce_bytes = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ct = cipher
            .encrypt(nonce, dek)
            .map_err(|_| Error::Cipher("DEK wrap failed"))?;
        let mut out = Vec::with_capacity(12 + ct.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    fn unwrap(&self, wrapped: &[u8]) -> Result<Vec<u8>> {
        if wrapped.len() < 12 + 16 {
            return Err(Error::Cipher("wrapped DEK too short"));
        }
        let (nonce_bytes, ct) = wrapped.split_at(12);
        let cipher = Aes256Gcm::new_from_slice(&self.kek)
            .map_err(|_| Error::Cipher("invalid KEK length"))?;
        let nonce = Nonce::from_slice(nonce_bytes);
        cipher
            .decrypt(nonce, Payload { msg: ct, aad: &[] })
            .map_err(|_| Error::Cipher("DEK unwrap failed"))
    }

    fn algorithm_label(&self) -> &'static str {
        "aes-256-gcm"
    }
}

struct Entry {
    alias: String,
    fingerprint: String,
    provider: Box<dyn KeyEncryptor>,
}

/// Resolves KEKs by alias (write path) or fingerprint (read path) and
/// delegates DEK wrap/unwrap to the matching provider.
pub struct ProviderRegistry {
    by_alias: HashMap<String, usize>,
    by_fingerprint: HashMap<String, usize>,
    entries: Vec<Entry>,
    active: usize,
}

impl ProviderRegistry {
    /// `providers` is `(alias, fingerprint, provider)`. Fails fast if
    /// `active_alias` does not name one of them.
    pub fn new(
        providers: Vec<(String, String, Box<dyn KeyEncryptor>)>,
        active_alias: &str,
    ) -> Result<Self> {
        let mut by_alias = HashMap::new();
        let mut by_fingerprint = HashMap::new();
        let mut entries = Vec::with_capacity(providers.len());

        for (alias, fingerprint, provider) in providers {
            let idx = entries.len();
            by_alias.insert(alias.clone(), idx);
            by_fingerprint.insert(fingerprint.clone(), idx);
            entries.push(Entry {
                alias,
                fingerprint,
                provider,
            });
        }

        let active = *by_alias
            .get(active_alias)
            .ok_or_else(|| Error::Provider(active_alias.to_string()))?;

        Ok(ProviderRegistry {
            by_alias,
            by_fingerprint,
            entries,
            active,
        })
    }

    /// Convenience constructor wrapping a single pass-through provider.
    pub fn passthrough() -> Self {
        ProviderRegistry::new(
            vec![(
                "none".to_string(),
                NONE_PROVIDER_FINGERPRINT.to_string(),
                Box::new(NoneProvider),
            )],
            "none",
        )
        .expect("passthrough registry is always well-formed")
    }

    pub fn wrap_dek(&self, dek: &[u8], provider_alias: &str) -> Result<Vec<u8>> {
        let idx = *self
            .by_alias
            .get(provider_alias)
            .ok_or_else(|| Error::Provider(provider_alias.to_string()))?;
        self.entries[idx].provider.wrap(dek)
    }

    pub fn unwrap_dek(&self, wrapped: &[u8], fingerprint: &str) -> Result<Vec<u8>> {
        let idx = self.by_fingerprint.get(fingerprint).ok_or_else(|| {
            Error::KekMissing {
                object_key: String::new(),
                fingerprint: fingerprint.to_string(),
            }
        })?;
        self.entries[*idx].provider.unwrap(wrapped)
    }

    /// Same as `unwrap_dek` but names the object in the error.
    pub fn unwrap_dek_for(
        &self,
        wrapped: &[u8],
        fingerprint: &str,
        object_key: &str,
    ) -> Result<Vec<u8>> {
        self.unwrap_dek(wrapped, fingerprint)
            .map_err(|e| match e {
                Error::KekMissing { fingerprint, .. } => Error::KekMissing {
                    object_key: object_key.to_string(),
                    fingerprint,
                },
                other => other,
            })
    }

    pub fn active_alias(&self) -> &str {
        &self.entries[self.active].alias
    }

    pub fn active_fingerprint(&self) -> &str {
        &self.entries[self.active].fingerprint
    }

    pub fn active_algorithm_label(&self) -> &'static str {
        self.entries[self.active].provider.algorithm_label()
    }

    pub fn is_passthrough(&self) -> bool {
        self.entries[self.active].provider.is_passthrough()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_kek_registry() -> (ProviderRegistry, [u8; 32], [u8; 32]) {
        let kek_a = [7u8; 32];
        let kek_b = [9u8; 32];
        let provider_a = StaticKeyProvider::new(kek_a);
        let provider_b = StaticKeyProvider::new(kek_b);
        let fp_a = provider_a.fingerprint();
        let fp_b = provider_b.fingerprint();
        let registry = ProviderRegistry::new(
            vec![
                ("a".to_string(), fp_a, Box::new(provider_a)),
                ("b".to_string(), fp_b, Box::new(provider_b)),
            ],
            "a",
        )
        .unwrap();
        (registry, kek_a, kek_b)
    }

    #[test]
    fn wrap_then_unwrap_round_trips() {
        let (registry, _, _) = two_kek_registry();
        let dek = [42u8; 32];
        let wrapped = registry.wrap_dek(&dek, "a").unwrap();
        let fp = registry.active_fingerprint().to_string();
        let unwrapped = registry.unwrap_dek(&wrapped, &fp).unwrap();
        assert_eq!(unwrapped, dek);
    }

    #[test]
    fn unknown_alias_fails_on_write() {
        let (registry, _, _) = two_kek_registry();
        let err = registry.wrap_dek(&[0u8; 32], "nope").unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
    }

    #[test]
    fn fingerprint_routing_rejects_wrong_kek() {
        let (registry, _, _) = two_kek_registry();
        let dek = [1u8; 32];
        let wrapped = registry.wrap_dek(&dek, "a").unwrap();
        // Fingerprint for "b" exists in the registry, but the ciphertext was
        // wrapped under "a"'s key, so unwrap must fail rather than silently
        // produce garbage.
        let entries_b_fp = {
            let other = StaticKeyProvider::new([9u8; 32]);
            other.fingerprint()
        };
        let err = registry.unwrap_dek(&wrapped, &entries_b_fp).unwrap_err();
        assert!(matches!(err, Error::Cipher(_)));
    }

    #[test]
    fn unknown_fingerprint_reports_kek_missing() {
        let (registry, _, _) = two_kek_registry();
        let err = registry
            .unwrap_dek_for(&[0u8; 48], "deadbeef", "objects/a.bin")
            .unwrap_err();
        match err {
            Error::KekMissing {
                object_key,
                fingerprint,
            } => {
                assert_eq!(object_key, "objects/a.bin");
                assert_eq!(fingerprint, "deadbeef");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn passthrough_registry_short_circuits() {
        let registry = ProviderRegistry::passthrough();
        assert!(registry.is_passthrough());
        assert_eq!(registry.active_fingerprint(), NONE_PROVIDER_FINGERPRINT);
        let dek = [5u8; 32];
        let wrapped = registry.wrap_dek(&dek, "none").unwrap();
        assert_eq!(wrapped, dek);
    }
}
