//! Error taxonomy for the buffer, the window resolver and the sampler.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BufferError>;

#[derive(Error, Debug)]
pub enum BufferError {
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("Index {index} out of range for buffer of length {len}")]
    Index { index: i64, len: usize },
    #[error("Unknown field: {0}")]
    UnknownField(String),
    #[error(
        "Timestamp outside tolerance for field '{field}': target {target}s, nearest {nearest}s, \
         error {error}s > tolerance {tolerance}s"
    )]
    TimestampOutsideTolerance {
        field: String,
        target: f64,
        nearest: f64,
        error: f64,
        tolerance: f64,
    },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Storage directory is already owned by another buffer: {0}")]
    StorageLocked(PathBuf),
    #[error("Corrupt buffer index: {0}")]
    CorruptIndex(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Precondition violations of the sampler weight calculator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SamplerError {
    #[error("Both the offline and the online pool are empty")]
    BothPoolsEmpty,
    #[error("Online sampling ratio must lie in [0, 1], got {0}")]
    InvalidRatio(f64),
    #[error("Every sample was excluded by drop_n_last_frames")]
    NoRetainedSamples,
    #[error("Failed to read episode boundaries of a pool: {0}")]
    PoolRead(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for BufferError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Io(e) => BufferError::Io(e),
            other => BufferError::InvalidConfig(other.to_string()),
        }
    }
}

impl From<BufferError> for SamplerError {
    fn from(err: BufferError) -> Self {
        SamplerError::PoolRead(err.to_string())
    }
}
