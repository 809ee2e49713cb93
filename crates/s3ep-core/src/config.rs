//! Typed configuration surface recognized by the encryption core.
//!
//! Parsing the surrounding TOML/JSON config *file* is an external
//! collaborator's job; this module only owns the shape and defaults of the
//! values that collaborator hands in.

use serde::{Deserialize, Deserializer};

pub const DEFAULT_METADATA_PREFIX: &str = "s3ep-";
pub const DEFAULT_STREAMING_THRESHOLD: usize = 5 * 1024 * 1024;
pub const DEFAULT_SEGMENT_SIZE: usize = 12 * 1024 * 1024;

/// Integrity-verification policy mode.
///
/// Deserializes from either the four-valued string form or a bare boolean
/// (`true` -> `Strict`, `false` -> `Off`) so older config documents that
/// only ever toggled integrity on or off keep parsing unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IntegrityMode {
    #[default]
    Off,
    Lax,
    Hybrid,
    Strict,
}

impl<'de> Deserialize<'de> for IntegrityMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Bool(bool),
            Str(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Bool(true) => Ok(IntegrityMode::Strict),
            Repr::Bool(false) => Ok(IntegrityMode::Off),
            Repr::Str(s) => match s.as_str() {
                "off" => Ok(IntegrityMode::Off),
                "lax" => Ok(IntegrityMode::Lax),
                "hybrid" => Ok(IntegrityMode::Hybrid),
                "strict" => Ok(IntegrityMode::Strict),
                other => Err(serde::de::Error::custom(format!(
                    "unknown integrity_verification mode: {other}"
                ))),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub alias: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncryptionConfig {
    pub encryption_method_alias: String,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default = "default_prefix")]
    pub metadata_key_prefix: String,
    #[serde(default)]
    pub integrity_verification: IntegrityMode,
}

fn default_prefix() -> String {
    DEFAULT_METADATA_PREFIX.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct OptimizationsConfig {
    #[serde(default = "default_threshold")]
    pub streaming_threshold: usize,
    #[serde(default = "default_segment_size")]
    pub streaming_segment_size: usize,
}

fn default_threshold() -> usize {
    DEFAULT_STREAMING_THRESHOLD
}

fn default_segment_size() -> usize {
    DEFAULT_SEGMENT_SIZE
}

impl Default for OptimizationsConfig {
    fn default() -> Self {
        OptimizationsConfig {
            streaming_threshold: DEFAULT_STREAMING_THRESHOLD,
            streaming_segment_size: DEFAULT_SEGMENT_SIZE,
        }
    }
}
