//! Default storage locations and materialize-or-reuse ingestion from an
//! external dataset source.

use crate::buffer::layout::{BufferIndex, DataSpec, FieldSpec};
use crate::buffer::store::{DataBuffer, EpisodeBatch};
use crate::config::{storage_root, BufferConfig};
use crate::error::{BufferError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// External collaborator yielding a whole dataset as raw arrays.
///
/// Fetching, decoding video and array conversion happen behind this trait.
pub trait EpisodeSource {
    /// Dataset identifier, e.g. `"lerobot/pusht"`.
    fn dataset_id(&self) -> &str;

    /// Fingerprint of the dataset content.
    fn fingerprint(&self) -> String;

    fn fps(&self) -> f64;

    /// Caller fields (reserved fields excluded) as they will be materialized.
    fn field_specs(&self, decode_video: bool) -> BTreeMap<String, FieldSpec>;

    /// Every frame of every episode, reserved fields included.
    fn load_episodes(&self, decode_video: bool) -> Result<EpisodeBatch>;
}

/// `<root>/<dataset_id>_<fingerprint>[_decoded]`.
pub fn default_storage_dir(
    root: &Path,
    dataset_id: &str,
    fingerprint: &str,
    decode_video: bool,
) -> PathBuf {
    let suffix = if decode_video { "_decoded" } else { "" };
    root.join(format!("{}_{}{}", dataset_id, fingerprint, suffix))
}

/// Stable hex fingerprint of a batch's names, specs and raw bytes.
pub fn content_fingerprint(batch: &EpisodeBatch) -> String {
    let mut hasher = blake3::Hasher::new();
    for (name, array) in batch.iter() {
        hasher.update(name.as_bytes());
        hasher.update(format!("{:?}{:?}", array.dtype(), array.shape()).as_bytes());
        hasher.update(array.as_bytes());
    }
    hasher.finalize().to_hex().as_str()[..16].to_string()
}

impl DataBuffer {
    /// Build a buffer holding all of `source`, or reuse a previously
    /// materialized one at the same location.
    ///
    /// `storage_dir` defaults to `default_storage_dir` under `storage_root()`.
    /// A fresh buffer is sized to exactly the source's frame count.
    pub fn from_source<S: EpisodeSource + ?Sized>(
        source: &S,
        decode_video: bool,
        storage_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let dir = storage_dir.unwrap_or_else(|| {
            default_storage_dir(
                &storage_root(),
                source.dataset_id(),
                &source.fingerprint(),
                decode_video,
            )
        });
        let fields = source.field_specs(decode_video);

        if BufferIndex::exists(&dir) {
            let reused = DataBuffer::open_existing(&dir)?;
            let expected = DataSpec::with_reserved(fields)?;
            if reused.data_spec() != &expected {
                return Err(BufferError::SchemaMismatch(format!(
                    "materialized buffer at {} has a different field spec",
                    dir.display()
                )));
            }
            if !reused.is_empty() {
                info!(dir = %dir.display(), frames = reused.len(), "Reusing materialized buffer");
                return Ok(reused);
            }
            // An empty store means a previous build died before its append committed.
            let batch = source.load_episodes(decode_video)?;
            reused.append_episodes(&batch)?;
            return Ok(reused);
        }

        let batch = source.load_episodes(decode_video)?;
        let n_frames = batch.num_frames();
        if n_frames == 0 {
            return Err(BufferError::InvalidConfig(format!(
                "dataset '{}' has no frames",
                source.dataset_id()
            )));
        }
        let mut config = BufferConfig::new(dir, n_frames).fps(source.fps());
        config.fields = fields;
        let buffer = DataBuffer::create_or_open(&config)?;
        buffer.append_episodes(&batch)?;
        info!(
            dataset = source.dataset_id(),
            dir = %buffer.storage_dir().display(),
            frames = n_frames,
            "Materialized dataset into buffer"
        );
        Ok(buffer)
    }
}
