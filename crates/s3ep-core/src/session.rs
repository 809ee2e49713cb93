//! Multipart upload session coordination.
//!
//! A [`Session`] binds one upload-id to a DEK/IV pair, a running HMAC
//! accumulator, and per-part bookkeeping for the lifetime of a multipart
//! upload. The [`SessionRegistry`] owns the map of live sessions; it never
//! holds its own lock while a session's lock is held, and never awaits
//! while holding either.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::IntegrityMode;
use crate::error::{Error, Result};
use crate::hmac_engine::{HmacEngine, HmacState};
use crate::metadata::{Metadata, MetadataCodec};
use crate::stream::{encrypt_ctr_segmented, BufferPool};

#[derive(Zeroize, ZeroizeOnDrop)]
struct KeyMaterial {
    dek: [u8; 32],
    iv: [u8; 16],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Active,
    Completed,
    Aborted,
}

struct SessionState {
    status: Status,
    next_part_number: u32,
    part_sizes: HashMap<u32, u64>,
    part_etags: HashMap<u32, String>,
    last_part: Option<(u32, u64)>,
    hmac: Option<HmacState>,
    block_offset: u64,
    final_metadata: Option<Metadata>,
}

/// Snapshot of a session's progress, for `get_multipart_state`-style callers.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub upload_id: String,
    pub object_key: String,
    pub bucket: String,
    pub next_part_number: u32,
    pub parts_ingested: usize,
    pub completed: bool,
    pub aborted: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("upload_id", &self.upload_id)
            .field("object_key", &self.object_key)
            .field("bucket", &self.bucket)
            .field("kek_fingerprint", &self.kek_fingerprint)
            .finish_non_exhaustive()
    }
}

pub struct Session {
    pub upload_id: String,
    pub object_key: String,
    pub bucket: String,
    pub kek_fingerprint: String,
    created_at: Instant,
    key_material: Mutex<Option<KeyMaterial>>,
    state: Mutex<SessionState>,
}

impl Session {
    fn new(
        upload_id: &str,
        object_key: &str,
        bucket: &str,
        dek: [u8; 32],
        iv: [u8; 16],
        kek_fingerprint: &str,
        hmac: Option<HmacState>,
    ) -> Self {
        Session {
            upload_id: upload_id.to_string(),
            object_key: object_key.to_string(),
            bucket: bucket.to_string(),
            kek_fingerprint: kek_fingerprint.to_string(),
            created_at: Instant::now(),
            key_material: Mutex::new(Some(KeyMaterial { dek, iv })),
            state: Mutex::new(SessionState {
                status: Status::Active,
                next_part_number: 1,
                part_sizes: HashMap::new(),
                part_etags: HashMap::new(),
                last_part: None,
                hmac,
                block_offset: 0,
                final_metadata: None,
            }),
        }
    }

    fn is_completed(&self) -> bool {
        matches!(self.state.lock().unwrap().status, Status::Completed)
    }

    fn zeroize_material(&self) {
        self.key_material.lock().unwrap().take();
    }

    async fn process_part<R, W>(
        &self,
        part_number: u32,
        reader: R,
        writer: W,
        pool: &BufferPool,
        cancel: &CancellationToken,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (dek, iv, start_offset) = {
            let guard = self.key_material.lock().unwrap();
            let km = guard.as_ref().ok_or_else(|| Error::UnknownUpload(self.upload_id.clone()))?;
            let state = self.state.lock().unwrap();
            if state.status != Status::Active {
                return Err(Error::UnknownUpload(self.upload_id.clone()));
            }
            if let Some((prev_number, prev_size)) = state.last_part {
                if prev_size % 16 != 0 {
                    return Err(Error::PartAlignment {
                        part_number: prev_number,
                    });
                }
            }
            if part_number != state.next_part_number {
                return Err(Error::OutOfOrderPart {
                    expected: state.next_part_number,
                    got: part_number,
                });
            }
            (km.dek, km.iv, state.block_offset)
        };

        let mut hmac_guard = self.state.lock().unwrap();
        let mut hmac_state = hmac_guard.hmac.take();
        drop(hmac_guard);

        let result = encrypt_ctr_segmented(
            pool,
            reader,
            writer,
            &dek,
            iv,
            start_offset,
            hmac_state.as_mut(),
            cancel,
        )
        .await;

        let mut state = self.state.lock().unwrap();
        state.hmac = hmac_state;
        let (bytes_written, end_offset) = result?;
        state.block_offset = end_offset;
        state.part_sizes.insert(part_number, bytes_written);
        state.last_part = Some((part_number, bytes_written));
        state.next_part_number = part_number + 1;
        Ok(bytes_written)
    }

    fn store_etag(&self, part_number: u32, etag: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.status == Status::Aborted {
            return Err(Error::UnknownUpload(self.upload_id.clone()));
        }
        state.part_etags.insert(part_number, etag.to_string());
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn finalize(
        &self,
        parts: &[(u32, String)],
        wrap_dek: impl FnOnce(&[u8; 32]) -> Result<Vec<u8>>,
        kek_algorithm: &str,
        codec: &MetadataCodec,
        policy: IntegrityMode,
        user_metadata: &Metadata,
    ) -> Result<Metadata> {
        let key_guard = self.key_material.lock().unwrap();
        let mut state = self.state.lock().unwrap();
        if let Some(cached) = &state.final_metadata {
            if state.status == Status::Completed {
                return Ok(cached.clone());
            }
        }
        if state.status == Status::Aborted {
            return Err(Error::UnknownUpload(self.upload_id.clone()));
        }

        for (part_number, _) in parts {
            if !state.part_sizes.contains_key(part_number) {
                return Err(Error::PartMissing {
                    part_number: *part_number,
                });
            }
        }

        let (dek, iv) = {
            let km = key_guard
                .as_ref()
                .ok_or_else(|| Error::UnknownUpload(self.upload_id.clone()))?;
            (km.dek, km.iv)
        };
        let wrapped_dek = wrap_dek(&dek)?;

        let mut metadata = codec.build_encrypt_metadata(
            &wrapped_dek,
            &iv,
            crate::stream::Algorithm::Ctr.as_str(),
            &self.kek_fingerprint,
            kek_algorithm,
            user_metadata,
        );

        if let Some(hmac) = state.hmac.take() {
            if policy != IntegrityMode::Off {
                let tag = hmac.finalize();
                codec.set_hmac(&mut metadata, &tag);
            }
        }

        state.status = Status::Completed;
        state.final_metadata = Some(metadata.clone());
        drop(state);
        drop(key_guard);
        self.zeroize_material();
        Ok(metadata)
    }

    fn snapshot(&self) -> SessionInfo {
        let state = self.state.lock().unwrap();
        SessionInfo {
            upload_id: self.upload_id.clone(),
            object_key: self.object_key.clone(),
            bucket: self.bucket.clone(),
            next_part_number: state.next_part_number,
            parts_ingested: state.part_sizes.len(),
            completed: state.status == Status::Completed,
            aborted: state.status == Status::Aborted,
        }
    }
}

/// Owns every live [`Session`], keyed by upload-id.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        SessionRegistry::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn initiate(
        &self,
        upload_id: &str,
        object_key: &str,
        bucket: &str,
        dek: [u8; 32],
        iv: [u8; 16],
        kek_fingerprint: &str,
        integrity_policy: IntegrityMode,
    ) -> Result<Arc<Session>> {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(upload_id) {
            return Err(Error::DuplicateUpload(upload_id.to_string()));
        }
        let hmac = if integrity_policy == IntegrityMode::Off {
            None
        } else {
            Some(HmacEngine::new_state(&dek)?)
        };
        let session = Arc::new(Session::new(
            upload_id,
            object_key,
            bucket,
            dek,
            iv,
            kek_fingerprint,
            hmac,
        ));
        sessions.insert(upload_id.to_string(), session.clone());
        Ok(session)
    }

    fn get(&self, upload_id: &str) -> Result<Arc<Session>> {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .get(upload_id)
            .cloned()
            .ok_or_else(|| Error::UnknownUpload(upload_id.to_string()))
    }

    pub async fn process_part<R, W>(
        &self,
        upload_id: &str,
        part_number: u32,
        reader: R,
        writer: W,
        pool: &BufferPool,
        cancel: &CancellationToken,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let session = self.get(upload_id)?;
        session
            .process_part(part_number, reader, writer, pool, cancel)
            .await
    }

    pub fn store_etag(&self, upload_id: &str, part_number: u32, etag: &str) -> Result<()> {
        self.get(upload_id)?.store_etag(part_number, etag)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn finalize(
        &self,
        upload_id: &str,
        parts: &[(u32, String)],
        wrap_dek: impl FnOnce(&[u8; 32]) -> Result<Vec<u8>>,
        kek_algorithm: &str,
        codec: &MetadataCodec,
        policy: IntegrityMode,
        user_metadata: &Metadata,
    ) -> Result<Metadata> {
        self.get(upload_id)?.finalize(
            parts,
            wrap_dek,
            kek_algorithm,
            codec,
            policy,
            user_metadata,
        )
    }

    pub fn abort(&self, upload_id: &str) -> Result<()> {
        let removed = self.sessions.lock().unwrap().remove(upload_id);
        match removed {
            Some(session) => {
                session.zeroize_material();
                Ok(())
            }
            None => {
                tracing::warn!(upload_id = %upload_id, "abort of unknown multipart upload");
                Err(Error::UnknownUpload(upload_id.to_string()))
            }
        }
    }

    /// Never fails: removing an absent session is a no-op.
    pub fn cleanup(&self, upload_id: &str) {
        if let Some(session) = self.sessions.lock().unwrap().remove(upload_id) {
            session.zeroize_material();
        }
    }

    /// Reclaims sessions that are still `Active` and older than `max_age`.
    /// Returns the number reclaimed. `Completed` sessions are never swept.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let mut sessions = self.sessions.lock().unwrap();
        let stale: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| !s.is_completed() && s.created_at.elapsed() > max_age)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            if let Some(session) = sessions.remove(id) {
                session.zeroize_material();
            }
        }
        stale.len()
    }

    pub fn state_of(&self, upload_id: &str) -> Result<SessionInfo> {
        Ok(self.get(upload_id)?.snapshot())
    }
}
