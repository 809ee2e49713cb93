//! Envelope key management, streaming AES-256-GCM/CTR, HMAC-SHA256 integrity
//! verification and multipart session coordination for an S3-compatible
//! encrypting proxy.
//!
//! The HTTP handler, origin object I/O, configuration-file parsing, log sink
//! setup and process bootstrap live outside this crate; it consumes a
//! [`providers::KeyEncryptor`] capability, a byte-stream source/sink, and a
//! string-keyed metadata map, and hands back ciphertext plus that same map
//! enriched with the fields a reader needs to decrypt later.

pub mod config;
pub mod error;
pub mod hmac_engine;
pub mod manager;
pub mod metadata;
pub mod providers;
pub mod session;
pub mod stream;

pub use config::{EncryptionConfig, IntegrityMode, OptimizationsConfig, ProviderConfig};
pub use error::{Error, Result};
pub use hmac_engine::{HmacEngine, HmacState, Tag};
pub use manager::{EncryptResult, EncryptionManager};
pub use metadata::{Metadata, MetadataCodec};
pub use providers::{KeyEncryptor, NoneProvider, ProviderRegistry, StaticKeyProvider};
pub use session::{Session, SessionInfo, SessionRegistry};
pub use stream::{
    Algorithm, BufferPool, DecryptingReader, DecryptingStream, EncryptingReader, EncryptingStream,
};
