//! Top-level façade combining key management, streaming, integrity and
//! multipart coordination into the operations an HTTP layer calls.

use std::time::Duration;

use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::config::{EncryptionConfig, IntegrityMode, OptimizationsConfig};
use crate::error::{Error, Result};
use crate::hmac_engine::{HmacEngine, Tag};
use crate::metadata::{Metadata, MetadataCodec};
use crate::providers::{ProviderRegistry, NONE_PROVIDER_FINGERPRINT};
use crate::session::{SessionInfo, SessionRegistry};
use crate::stream::{
    self, gcm_open_whole, gcm_seal_whole, select_algorithm, Algorithm, BufferPool,
    DecryptingReader, DecryptingStream, EncryptingReader, EncryptingStream,
};

pub struct EncryptResult {
    pub ciphertext: Vec<u8>,
    pub wrapped_dek: Vec<u8>,
    pub metadata: Metadata,
}

/// Combines the manager's encryption configuration with its collaborators.
pub struct EncryptionManager {
    providers: ProviderRegistry,
    codec: MetadataCodec,
    sessions: SessionRegistry,
    pool: BufferPool,
    integrity_policy: IntegrityMode,
    streaming_threshold: usize,
    segment_size: usize,
}

impl EncryptionManager {
    pub fn new(
        providers: ProviderRegistry,
        encryption: &EncryptionConfig,
        optimizations: &OptimizationsConfig,
    ) -> Self {
        EncryptionManager {
            providers,
            codec: MetadataCodec::new(encryption.metadata_key_prefix.clone()),
            sessions: SessionRegistry::new(),
            pool: BufferPool::new(optimizations.streaming_segment_size),
            integrity_policy: encryption.integrity_verification,
            streaming_threshold: optimizations.streaming_threshold,
            segment_size: optimizations.streaming_segment_size,
        }
    }

    fn gen_dek() -> [u8; 32] {
        let mut dek = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut dek);
        dek
    }

    fn gen_iv16() -> [u8; 16] {
        let mut iv = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut iv);
        iv
    }

    pub fn encrypt_buffer(
        &self,
        data: &[u8],
        object_key: &str,
        content_type_hint: Option<&str>,
        user_metadata: &Metadata,
    ) -> Result<EncryptResult> {
        if self.providers.is_passthrough() {
            tracing::debug!(object_key = %object_key, "passthrough encrypt_buffer");
            return Ok(EncryptResult {
                ciphertext: data.to_vec(),
                wrapped_dek: Vec::new(),
                metadata: Metadata::new(),
            });
        }

        let algorithm = select_algorithm(
            false,
            Some(data.len() as u64),
            self.streaming_threshold,
            content_type_hint,
        );
        let dek = Self::gen_dek();
        let wrapped_dek = self.providers.wrap_dek(&dek, self.providers.active_alias())?;

        let (ciphertext, iv_bytes, tag) = match algorithm {
            Algorithm::Gcm => {
                let wire = gcm_seal_whole(&dek, data)?;
                let nonce = wire[..12].to_vec();
                let tag = integrity_tag(self.integrity_policy, data, &dek)?;
                (wire, nonce, tag)
            }
            Algorithm::Ctr => {
                let iv = Self::gen_iv16();
                let ctr = stream::CtrCipher::new(&dek, iv)?;
                let mut body = data.to_vec();
                ctr.apply_at_block_offset(0, &mut body);
                let tag = integrity_tag(self.integrity_policy, data, &dek)?;
                (body, iv.to_vec(), tag)
            }
        };

        let mut metadata = self.codec.build_encrypt_metadata(
            &wrapped_dek,
            &iv_bytes,
            algorithm.as_str(),
            self.providers.active_fingerprint(),
            self.providers.active_algorithm_label(),
            user_metadata,
        );
        if let Some(tag) = tag {
            self.codec.set_hmac(&mut metadata, &tag);
        }

        Ok(EncryptResult {
            ciphertext,
            wrapped_dek,
            metadata,
        })
    }

    pub fn decrypt_buffer(
        &self,
        ciphertext: &[u8],
        wrapped_dek: &[u8],
        metadata: &Metadata,
        object_key: &str,
    ) -> Result<Vec<u8>> {
        if metadata.is_empty() {
            return Ok(ciphertext.to_vec());
        }
        self.codec.validate(metadata)?;
        let fingerprint = self.codec.extract_fingerprint(metadata)?;
        if fingerprint == NONE_PROVIDER_FINGERPRINT {
            return Ok(ciphertext.to_vec());
        }

        let algorithm = Algorithm::parse(&self.codec.extract_algorithm(metadata)?)?;
        let dek: [u8; 32] = self
            .providers
            .unwrap_dek_for(wrapped_dek, &fingerprint, object_key)?
            .try_into()
            .map_err(|_| Error::Metadata("unwrapped dek must be 32 bytes".to_string()))?;

        let plaintext = match algorithm {
            Algorithm::Gcm => gcm_open_whole(&dek, ciphertext)?,
            Algorithm::Ctr => {
                let iv = extract_iv16(&self.codec, metadata)?;
                let ctr = stream::CtrCipher::new(&dek, iv)?;
                let mut body = ciphertext.to_vec();
                ctr.apply_at_block_offset(0, &mut body);
                body
            }
        };

        let (tag, present) = self.codec.extract_hmac(metadata)?;
        let expected = if present { Some(tag.as_slice()) } else { None };
        HmacEngine::verify(&plaintext, expected, &dek, self.integrity_policy)?;
        Ok(plaintext)
    }

    /// Returns a cipher reader, a oneshot receiver for the metadata that
    /// becomes available once the reader hits EOF, the wrapped DEK, and the
    /// metadata fields known up front (everything but `hmac`).
    pub fn encrypt_stream<R>(
        &self,
        reader: R,
        object_key: &str,
        user_metadata: &Metadata,
    ) -> Result<(
        EncryptingStream<R>,
        tokio::sync::oneshot::Receiver<Option<Tag>>,
        Vec<u8>,
        Metadata,
    )>
    where
        R: AsyncRead + Unpin,
    {
        if self.providers.is_passthrough() {
            tracing::debug!(object_key = %object_key, "passthrough encrypt_stream");
            let (tx, rx) = tokio::sync::oneshot::channel();
            let _ = tx.send(None);
            return Ok((
                EncryptingStream::Identity(reader),
                rx,
                Vec::new(),
                Metadata::new(),
            ));
        }

        let dek = Self::gen_dek();
        let iv = Self::gen_iv16();
        let wrapped_dek = self.providers.wrap_dek(&dek, self.providers.active_alias())?;
        let hmac = if self.integrity_policy != IntegrityMode::Off {
            Some(HmacEngine::new_state(&dek)?)
        } else {
            None
        };

        let metadata = self.codec.build_encrypt_metadata(
            &wrapped_dek,
            &iv,
            Algorithm::Ctr.as_str(),
            self.providers.active_fingerprint(),
            self.providers.active_algorithm_label(),
            user_metadata,
        );

        let (tx, rx) = tokio::sync::oneshot::channel();
        let cipher_reader = EncryptingReader::new(reader, &dek, iv, self.segment_size, hmac, tx)?;
        Ok((EncryptingStream::Ctr(cipher_reader), rx, wrapped_dek, metadata))
    }

    pub fn decrypt_stream<R>(
        &self,
        reader: R,
        wrapped_dek: &[u8],
        metadata: &Metadata,
        object_key: &str,
    ) -> Result<DecryptingStream<R>>
    where
        R: AsyncRead + Unpin,
    {
        if metadata.is_empty() {
            return Ok(DecryptingStream::Identity(reader));
        }
        self.codec.validate(metadata)?;
        let fingerprint = self.codec.extract_fingerprint(metadata)?;
        if fingerprint == NONE_PROVIDER_FINGERPRINT {
            return Ok(DecryptingStream::Identity(reader));
        }

        let dek: [u8; 32] = self
            .providers
            .unwrap_dek_for(wrapped_dek, &fingerprint, object_key)?
            .try_into()
            .map_err(|_| Error::Metadata("unwrapped dek must be 32 bytes".to_string()))?;
        let iv = extract_iv16(&self.codec, metadata)?;
        let (expected_tag, present) = self.codec.extract_hmac(metadata)?;
        let hmac = if self.integrity_policy != IntegrityMode::Off {
            Some(HmacEngine::new_state(&dek)?)
        } else {
            None
        };
        let reader = DecryptingReader::new(
            reader,
            &dek,
            iv,
            self.segment_size,
            hmac,
            if present { Some(expected_tag) } else { None },
            self.integrity_policy,
        )?;
        Ok(DecryptingStream::Ctr(reader))
    }

    pub fn initiate_multipart(&self, upload_id: &str, object_key: &str, bucket: &str) -> Result<()> {
        let dek = Self::gen_dek();
        let iv = Self::gen_iv16();
        self.sessions.initiate(
            upload_id,
            object_key,
            bucket,
            dek,
            iv,
            self.providers.active_fingerprint(),
            self.integrity_policy,
        )?;
        Ok(())
    }

    pub async fn upload_part<R, W>(
        &self,
        upload_id: &str,
        part_number: u32,
        reader: R,
        writer: W,
        cancel: &CancellationToken,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.sessions
            .process_part(upload_id, part_number, reader, writer, &self.pool, cancel)
            .await
    }

    pub fn store_part_etag(&self, upload_id: &str, part_number: u32, etag: &str) -> Result<()> {
        self.sessions.store_etag(upload_id, part_number, etag)
    }

    pub fn complete_multipart(
        &self,
        upload_id: &str,
        parts: &[(u32, String)],
        user_metadata: &Metadata,
    ) -> Result<Metadata> {
        let active_alias = self.providers.active_alias().to_string();
        self.sessions.finalize(
            upload_id,
            parts,
            |dek| self.providers.wrap_dek(dek, &active_alias),
            self.providers.active_algorithm_label(),
            &self.codec,
            self.integrity_policy,
            user_metadata,
        )
    }

    pub fn abort_multipart(&self, upload_id: &str) -> Result<()> {
        self.sessions.abort(upload_id)
    }

    pub fn cleanup_multipart(&self, upload_id: &str) {
        self.sessions.cleanup(upload_id)
    }

    pub fn sweep_multipart(&self, max_age: Duration) -> usize {
        self.sessions.sweep(max_age)
    }

    pub fn get_multipart_state(&self, upload_id: &str) -> Result<SessionInfo> {
        self.sessions.state_of(upload_id)
    }

    pub fn is_passthrough(&self) -> bool {
        self.providers.is_passthrough()
    }
}

fn integrity_tag(policy: IntegrityMode, data: &[u8], dek: &[u8; 32]) -> Result<Option<Tag>> {
    if policy == IntegrityMode::Off {
        Ok(None)
    } else {
        Ok(Some(HmacEngine::calculate(data, dek)?))
    }
}

fn extract_iv16(codec: &MetadataCodec, metadata: &Metadata) -> Result<[u8; 16]> {
    let iv_bytes = codec.extract_iv(metadata)?;
    iv_bytes
        .try_into()
        .map_err(|_| Error::Metadata("aes-iv must be 16 bytes".to_string()))
}
