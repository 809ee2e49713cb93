//! Error taxonomy for the encryption core.
//!
//! Every variant here is one of the kinds named in the core's error design:
//! no layer recovers from a cryptographic failure, so the manager surfaces
//! these verbatim to its HTTP-layer caller, which maps them to S3 status
//! codes outside this crate.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("input error: {0}")]
    Input(&'static str),

    #[error("unknown key provider alias: {0}")]
    Provider(String),

    #[error("no configured KEK matches fingerprint {fingerprint} required by object {object_key}")]
    KekMissing {
        object_key: String,
        fingerprint: String,
    },

    #[error("metadata error: {0}")]
    Metadata(String),

    #[error("cipher error: {0}")]
    Cipher(&'static str),

    #[error("short read: truncated ciphertext")]
    ShortRead,

    #[error("hmac verification failed")]
    HmacMismatch,

    #[error("duplicate multipart upload: {0}")]
    DuplicateUpload(String),

    #[error("unknown multipart upload: {0}")]
    UnknownUpload(String),

    #[error("out-of-order part: expected {expected}, got {got}")]
    OutOfOrderPart { expected: u32, got: u32 },

    #[error("part {part_number} is not aligned to a 16-byte boundary and is not the final part")]
    PartAlignment { part_number: u32 },

    #[error("part {part_number} missing at finalize")]
    PartMissing { part_number: u32 },

    #[error("operation canceled")]
    Canceled,
}

impl Error {
    /// True for cancellation, which must never be logged as an error.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Canceled)
    }
}
