//! Fixed-capacity, persistent, multi-field ring buffer for episodic
//! time-series data, with time-offset window resolution and offline/online
//! sampler weights.

pub mod buffer;
pub mod config;
pub mod error;
pub mod sampler;
pub mod window;

pub use buffer::{
    DType, DataBuffer, DataSpec, EpisodeBatch, EpisodeSource, FieldArray, FieldSpec, Frame,
};
pub use config::BufferConfig;
pub use error::{BufferError, ConfigError, Result, SamplerError};
pub use sampler::{compute_sampler_weights, EpisodeDataIndex, MixingConfig, OfflinePool, SamplePool};
pub use window::{DeltaTimestamps, TemporalWindow};
