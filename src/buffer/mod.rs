//! Persistent, memory-mapped circular buffer of episodic frames.
//! One fixed-stride file per field plus a checksummed index file.

pub mod array;
pub mod column;
pub mod layout;
pub mod naming;
pub mod store;

pub use array::{Element, FieldArray};
pub use layout::{
    DType, DataSpec, FieldSpec, EPISODE_INDEX_KEY, FRAME_INDEX_KEY, INDEX_KEY, IS_PAD_POSTFIX,
    TIMESTAMP_KEY,
};
pub use naming::{content_fingerprint, default_storage_dir, EpisodeSource};
pub use store::{DataBuffer, EpisodeBatch, Frame};

#[cfg(test)]
mod tests;
