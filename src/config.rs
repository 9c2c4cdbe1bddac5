//! Buffer configuration: TOML-loadable construction parameters and the
//! storage root used for derived storage locations.

use crate::buffer::layout::FieldSpec;
use crate::error::ConfigError;
use crate::window::DeltaTimestamps;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable naming the root of derived storage directories.
pub const STORAGE_ROOT_ENV: &str = "EPISODE_BUFFER_ROOT";

/// Construction parameters of a `DataBuffer`.
///
/// ```toml
/// storage_dir = "/tmp/online_buffer"
/// capacity = 10000
/// fps = 10.0
///
/// [fields.action]
/// shape = [2]
/// dtype = "float32"
///
/// [delta_timestamps]
/// action = [0.0, 0.1, 0.2]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferConfig {
    pub storage_dir: PathBuf,
    pub capacity: usize,
    /// Caller fields; reserved fields are added by the buffer.
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
    #[serde(default)]
    pub fps: Option<f64>,
    /// Defaults to `1/fps - 1e-4` when windows are configured.
    #[serde(default)]
    pub tolerance_s: Option<f64>,
    #[serde(default)]
    pub delta_timestamps: Option<DeltaTimestamps>,
}

impl BufferConfig {
    pub fn new(storage_dir: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            capacity,
            fields: BTreeMap::new(),
            fps: None,
            tolerance_s: None,
            delta_timestamps: None,
        }
    }

    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    pub fn fps(mut self, fps: f64) -> Self {
        self.fps = Some(fps);
        self
    }

    pub fn tolerance_s(mut self, tolerance_s: f64) -> Self {
        self.tolerance_s = Some(tolerance_s);
        self
    }

    pub fn delta_timestamps(mut self, delta_timestamps: DeltaTimestamps) -> Self {
        self.delta_timestamps = Some(delta_timestamps);
        self
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::Invalid("capacity must be positive".to_string()));
        }
        if let Some(fps) = self.fps {
            if !fps.is_finite() || fps <= 0.0 {
                return Err(ConfigError::Invalid(format!("fps must be positive, got {}", fps)));
            }
        }
        if let Some(tolerance) = self.tolerance_s {
            if !tolerance.is_finite() || tolerance < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "tolerance_s must be non-negative, got {}",
                    tolerance
                )));
            }
        }
        if self.delta_timestamps.is_some() && self.fps.is_none() {
            return Err(ConfigError::Invalid("delta_timestamps requires fps".to_string()));
        }
        Ok(())
    }

    /// Tolerance used when matching offsets to frames at `fps`.
    pub fn default_tolerance(fps: f64) -> f64 {
        1.0 / fps - 1e-4
    }

    /// Explicit tolerance, else the fps-derived default.
    pub fn resolved_tolerance(&self) -> Option<f64> {
        self.tolerance_s
            .or_else(|| self.fps.map(Self::default_tolerance))
    }
}

/// Root directory under which default storage locations are derived.
///
/// Reads `EPISODE_BUFFER_ROOT` (a `.env` file is honoured), falling back to
/// the system temp directory.
pub fn storage_root() -> PathBuf {
    dotenv::dotenv().ok();
    match dotenv::var(STORAGE_ROOT_ENV) {
        Ok(root) if !root.is_empty() => PathBuf::from(root),
        _ => std::env::temp_dir(),
    }
}
