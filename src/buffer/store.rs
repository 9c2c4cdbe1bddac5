//! Circular episodic store: append, flush, mmap, reopen.

use crate::buffer::array::FieldArray;
use crate::buffer::column::Column;
use crate::buffer::layout::{
    BufferIndex, DataSpec, FieldSpec, EPISODE_INDEX_KEY, LOCK_FILE, TIMESTAMP_KEY,
};
use crate::config::BufferConfig;
use crate::error::{BufferError, Result};
use crate::window::{DeltaTimestamps, FrameSource, TemporalWindow};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// One item read from the buffer: field name to value.
pub type Frame = BTreeMap<String, FieldArray>;

/// Whole episodes' worth of frames for every field, leading axis = frames.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpisodeBatch {
    fields: BTreeMap<String, FieldArray>,
}

impl EpisodeBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: impl Into<String>, array: FieldArray) -> Self {
        self.insert(name, array);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, array: FieldArray) -> Option<FieldArray> {
        self.fields.insert(name.into(), array)
    }

    pub fn get(&self, name: &str) -> Option<&FieldArray> {
        self.fields.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut FieldArray> {
        self.fields.get_mut(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldArray)> {
        self.fields.iter()
    }

    /// Frame count of the batch, taken from the episode index column.
    pub fn num_frames(&self) -> usize {
        self.fields
            .get(EPISODE_INDEX_KEY)
            .or_else(|| self.fields.values().next())
            .map(FieldArray::num_frames)
            .unwrap_or(0)
    }
}

/// Exclusive ownership marker of a storage directory, holding the owner's
/// PID. Removed on drop; a marker left by a process that no longer runs is
/// reclaimed on the next open.
struct DirLock {
    path: PathBuf,
}

impl DirLock {
    fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE);
        if !Self::create(&path)? && !(Self::break_if_stale(&path)? && Self::create(&path)?) {
            return Err(BufferError::StorageLocked(dir.to_path_buf()));
        }
        Ok(Self { path })
    }

    /// Atomically create the marker. `false` if one already exists.
    fn create(path: &Path) -> Result<bool> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;
        Ok(true)
    }

    /// Remove a marker whose owner is gone. An unreadable PID counts as gone.
    fn break_if_stale(path: &Path) -> Result<bool> {
        let owner = match fs::read_to_string(path) {
            Ok(content) => content.trim().parse::<u32>().ok(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        };
        if owner.map_or(false, pid_alive) {
            return Ok(false);
        }
        warn!(path = %path.display(), owner = ?owner, "Reclaiming stale storage lock");
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let ours = fs::read_to_string(&self.path)
            .map(|content| content.trim() == std::process::id().to_string())
            .unwrap_or(false);
        if ours {
            let _ = fs::remove_file(&self.path);
        }
    }
}

#[cfg(target_os = "linux")]
fn pid_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

// No portable liveness check; never reclaim.
#[cfg(not(target_os = "linux"))]
fn pid_alive(_pid: u32) -> bool {
    true
}

/// Mutable part of the buffer, guarded as a unit.
pub(crate) struct BufferState {
    index: BufferIndex,
    columns: BTreeMap<String, Column>,
}

impl BufferState {
    fn len(&self) -> usize {
        self.index.occupancy
    }

    fn capacity(&self) -> usize {
        self.index.capacity
    }

    /// Physical slot of the oldest valid frame.
    fn start_slot(&self) -> usize {
        let oldest = self.index.write_cursor - self.index.occupancy as u64;
        (oldest % self.capacity() as u64) as usize
    }

    fn physical(&self, logical: usize) -> usize {
        (self.start_slot() + logical) % self.capacity()
    }

    /// Normalise a possibly negative logical index.
    fn resolve_index(&self, index: i64) -> Result<usize> {
        let len = self.len();
        let resolved = if index < 0 { index + len as i64 } else { index };
        if resolved < 0 || resolved >= len as i64 {
            return Err(BufferError::Index { index, len });
        }
        Ok(resolved as usize)
    }

    fn column(&self, name: &str) -> Result<&Column> {
        self.columns
            .get(name)
            .ok_or_else(|| BufferError::UnknownField(name.to_string()))
    }

    fn frame_field(&self, name: &str, logical: usize) -> Result<FieldArray> {
        let column = self.column(name)?;
        let spec = column.spec();
        FieldArray::from_bytes(
            spec.dtype,
            spec.shape.clone(),
            column.slot(self.physical(logical)).to_vec(),
        )
    }

    fn read_column(&self, name: &str) -> Result<FieldArray> {
        let column = self.column(name)?;
        let spec = column.spec();
        let len = self.len();
        let start = self.start_slot();
        let head = len.min(self.capacity() - start);

        let mut data = Vec::with_capacity(len * spec.stride());
        data.extend_from_slice(column.slots(start, head));
        data.extend_from_slice(column.slots(0, len - head));

        let mut shape = Vec::with_capacity(spec.shape.len() + 1);
        shape.push(len);
        shape.extend_from_slice(&spec.shape);
        FieldArray::from_bytes(spec.dtype, shape, data)
    }

    fn scalar_i64(&self, name: &str, logical: usize) -> Result<i64> {
        let bytes = self.column(name)?.slot(self.physical(logical));
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(i64::from_le_bytes(buf))
    }

    fn scalar_f64(&self, name: &str, logical: usize) -> Result<f64> {
        let bytes = self.column(name)?.slot(self.physical(logical));
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(f64::from_le_bytes(buf))
    }

    /// Maximal runs of equal `episode_index`, in logical order.
    fn episode_ranges(&self) -> Result<Vec<Range<usize>>> {
        let mut ranges = Vec::new();
        let mut start = 0;
        let mut current: Option<i64> = None;
        for i in 0..self.len() {
            let ep = self.scalar_i64(EPISODE_INDEX_KEY, i)?;
            match current {
                Some(prev) if prev == ep => {}
                Some(_) => {
                    ranges.push(start..i);
                    start = i;
                }
                None => {}
            }
            current = Some(ep);
        }
        if current.is_some() {
            ranges.push(start..self.len());
        }
        Ok(ranges)
    }

    fn read_frame(&self, logical: usize, window: Option<&TemporalWindow>) -> Result<Frame> {
        let mut frame = Frame::new();
        for name in self.columns.keys() {
            frame.insert(name.clone(), self.frame_field(name, logical)?);
        }
        if let Some(window) = window {
            frame.extend(window.resolve(&BufferView { state: self }, logical)?);
        }
        Ok(frame)
    }
}

/// Read-only view of a locked buffer state, fed to the window resolver.
struct BufferView<'a> {
    state: &'a BufferState,
}

impl FrameSource for BufferView<'_> {
    fn len(&self) -> usize {
        self.state.len()
    }

    fn episode_index(&self, logical: usize) -> Result<i64> {
        self.state.scalar_i64(EPISODE_INDEX_KEY, logical)
    }

    fn timestamp(&self, logical: usize) -> Result<f64> {
        self.state.scalar_f64(TIMESTAMP_KEY, logical)
    }

    fn field_spec(&self, field: &str) -> Option<FieldSpec> {
        self.state.columns.get(field).map(|c| c.spec().clone())
    }

    fn frame_field(&self, field: &str, logical: usize) -> Result<FieldArray> {
        self.state.frame_field(field, logical)
    }
}

/// Fixed-capacity, persistent, multi-field circular buffer of episodic frames.
///
/// Appends take an internal write lock covering both the field writes and
/// the cursor advance, so concurrent readers never observe a partial append.
/// The storage directory is exclusively owned through a `LOCK` file.
pub struct DataBuffer {
    dir: PathBuf,
    data_spec: DataSpec,
    fps: Option<f64>,
    window: Option<TemporalWindow>,
    state: RwLock<BufferState>,
    _lock: DirLock,
}

impl DataBuffer {
    /// Create a buffer at `config.storage_dir`, or reopen the one already there.
    ///
    /// Reopening verifies the persisted field spec and capacity against the
    /// configuration and fails with `SchemaMismatch` on any difference.
    pub fn create_or_open(config: &BufferConfig) -> Result<Self> {
        config.validate()?;
        let data_spec = DataSpec::with_reserved(config.fields.clone())?;
        if data_spec.iter().any(|(_, spec)| spec.stride() == 0) {
            return Err(BufferError::InvalidConfig(
                "fields must hold at least one element per frame".to_string(),
            ));
        }
        let dir = config.storage_dir.clone();
        fs::create_dir_all(&dir)?;
        let lock = DirLock::acquire(&dir)?;

        let (index, columns) = if BufferIndex::exists(&dir) {
            let index = BufferIndex::load(&dir)?;
            if index.fields != data_spec {
                return Err(BufferError::SchemaMismatch(format!(
                    "stored field spec {:?} differs from requested {:?}",
                    index.fields, data_spec
                )));
            }
            if index.capacity != config.capacity {
                return Err(BufferError::SchemaMismatch(format!(
                    "stored capacity {} differs from requested {}",
                    index.capacity, config.capacity
                )));
            }
            if let (Some(stored), Some(requested)) = (index.fps, config.fps) {
                if stored != requested {
                    return Err(BufferError::SchemaMismatch(format!(
                        "stored fps {} differs from requested {}",
                        stored, requested
                    )));
                }
            }
            let columns = Self::open_columns(&dir, &index)?;
            info!(
                dir = %dir.display(),
                occupancy = index.occupancy,
                capacity = index.capacity,
                "Reopened data buffer"
            );
            (index, columns)
        } else {
            let index = BufferIndex {
                capacity: config.capacity,
                fields: data_spec.clone(),
                write_cursor: 0,
                occupancy: 0,
                fps: config.fps,
            };
            let mut columns = BTreeMap::new();
            for (name, spec) in data_spec.iter() {
                columns.insert(name.clone(), Column::create(&dir, name, spec, index.capacity)?);
            }
            index.store(&dir)?;
            info!(dir = %dir.display(), capacity = index.capacity, "Created data buffer");
            (index, columns)
        };

        let fps = index.fps.or(config.fps);
        let window = match &config.delta_timestamps {
            Some(delta) => {
                let tolerance = config.resolved_tolerance().ok_or_else(|| {
                    BufferError::InvalidConfig("delta_timestamps requires fps".to_string())
                })?;
                Some(Self::make_window(&data_spec, delta.clone(), tolerance)?)
            }
            None => None,
        };

        Ok(Self {
            dir,
            data_spec,
            fps,
            window,
            state: RwLock::new(BufferState { index, columns }),
            _lock: lock,
        })
    }

    /// Reopen a buffer from its self-describing layout alone.
    pub fn open_existing(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !BufferIndex::exists(&dir) {
            return Err(BufferError::Io(std::io::Error::new(
                ErrorKind::NotFound,
                format!("no data buffer at {}", dir.display()),
            )));
        }
        let lock = DirLock::acquire(&dir)?;
        let index = BufferIndex::load(&dir)?;
        let columns = Self::open_columns(&dir, &index)?;
        info!(dir = %dir.display(), occupancy = index.occupancy, "Reopened data buffer");
        Ok(Self {
            dir,
            data_spec: index.fields.clone(),
            fps: index.fps,
            window: None,
            state: RwLock::new(BufferState { index, columns }),
            _lock: lock,
        })
    }

    fn open_columns(dir: &Path, index: &BufferIndex) -> Result<BTreeMap<String, Column>> {
        let mut columns = BTreeMap::new();
        for (name, spec) in index.fields.iter() {
            columns.insert(name.clone(), Column::open(dir, name, spec, index.capacity)?);
        }
        Ok(columns)
    }

    fn make_window(
        data_spec: &DataSpec,
        delta_timestamps: DeltaTimestamps,
        tolerance_s: f64,
    ) -> Result<TemporalWindow> {
        if let Some(unknown) = delta_timestamps.keys().find(|k| !data_spec.contains(k)) {
            return Err(BufferError::UnknownField(unknown.clone()));
        }
        TemporalWindow::new(delta_timestamps, tolerance_s)
    }

    /// Configure (or replace) time-offset windows applied by `read_frame`.
    pub fn set_delta_timestamps(
        &mut self,
        delta_timestamps: DeltaTimestamps,
        tolerance_s: Option<f64>,
    ) -> Result<()> {
        let tolerance = match (tolerance_s, self.fps) {
            (Some(t), _) => t,
            (None, Some(fps)) => BufferConfig::default_tolerance(fps),
            (None, None) => {
                return Err(BufferError::InvalidConfig(
                    "delta_timestamps requires fps or an explicit tolerance".to_string(),
                ))
            }
        };
        self.window = Some(Self::make_window(&self.data_spec, delta_timestamps, tolerance)?);
        Ok(())
    }

    pub fn clear_delta_timestamps(&mut self) {
        self.window = None;
    }

    pub fn tolerance_s(&self) -> Option<f64> {
        self.window.as_ref().map(TemporalWindow::tolerance_s)
    }

    /// Adjust the matching tolerance of the configured windows.
    pub fn set_tolerance_s(&mut self, tolerance_s: f64) -> Result<()> {
        match self.window.as_mut() {
            Some(window) => window.set_tolerance_s(tolerance_s),
            None => Err(BufferError::InvalidConfig(
                "no delta_timestamps configured".to_string(),
            )),
        }
    }

    pub fn delta_timestamps(&self) -> Option<&DeltaTimestamps> {
        self.window.as_ref().map(TemporalWindow::delta_timestamps)
    }

    pub fn storage_dir(&self) -> &Path {
        &self.dir
    }

    pub fn data_spec(&self) -> &DataSpec {
        &self.data_spec
    }

    pub fn fps(&self) -> Option<f64> {
        self.fps
    }

    pub fn capacity(&self) -> usize {
        self.read_state().capacity()
    }

    /// Number of valid frames.
    pub fn len(&self) -> usize {
        self.read_state().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_state(&self) -> RwLockReadGuard<'_, BufferState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, BufferState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn validate_batch(&self, batch: &EpisodeBatch) -> Result<usize> {
        for name in self.data_spec.names() {
            if batch.get(name).is_none() {
                return Err(BufferError::SchemaMismatch(format!("missing field '{}'", name)));
            }
        }
        let mut n_frames = None;
        for (name, array) in batch.iter() {
            let spec = self.data_spec.get(name).ok_or_else(|| {
                BufferError::SchemaMismatch(format!("unexpected field '{}'", name))
            })?;
            if !array.matches_frames_of(spec) {
                return Err(BufferError::SchemaMismatch(format!(
                    "field '{}' is {:?} {:?}, expected {:?} [n, {:?}]",
                    name,
                    array.dtype(),
                    array.shape(),
                    spec.dtype,
                    spec.shape
                )));
            }
            match n_frames {
                None => n_frames = Some(array.num_frames()),
                Some(n) if n != array.num_frames() => {
                    return Err(BufferError::SchemaMismatch(format!(
                        "field '{}' has {} frames, other fields have {}",
                        name,
                        array.num_frames(),
                        n
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(n_frames.unwrap_or(0))
    }

    /// Append whole episodes. The batch is copied into storage; the caller
    /// keeps ownership of its buffers. Validation runs before any write.
    pub fn append_episodes(&self, batch: &EpisodeBatch) -> Result<()> {
        let n_frames = self.validate_batch(batch)?;
        if n_frames == 0 {
            return Ok(());
        }

        let mut state = self.write_state();
        let capacity = state.capacity();
        let cursor = state.index.write_cursor;
        // Frames that would be overwritten within this same batch are skipped.
        let skip = n_frames.saturating_sub(capacity);
        let written = n_frames - skip;
        let first_slot = ((cursor + skip as u64) % capacity as u64) as usize;

        // Evict the frames whose slots are about to be overwritten before
        // touching them, so a failure below never exposes mixed old/new data.
        let previous = state.index.occupancy;
        let overwritten = written.saturating_sub(capacity - previous);
        if overwritten > 0 {
            let mut evicted = state.index.clone();
            evicted.occupancy = previous - overwritten;
            evicted.store(&self.dir)?;
            state.index = evicted;
        }

        for (name, array) in batch.iter() {
            let column = state
                .columns
                .get_mut(name)
                .ok_or_else(|| BufferError::UnknownField(name.clone()))?;
            let stride = column.spec().stride();
            for i in 0..written {
                let slot = (first_slot + i) % capacity;
                column.write_slot(slot, array.frame_bytes(skip + i, stride));
            }
        }
        for column in state.columns.values() {
            column.flush()?;
        }

        let mut index = state.index.clone();
        index.write_cursor = cursor + n_frames as u64;
        index.occupancy = (previous + n_frames).min(capacity);
        index.store(&self.dir)?;

        debug!(
            frames = n_frames,
            cursor = index.write_cursor,
            occupancy = index.occupancy,
            evicted = previous + n_frames - index.occupancy,
            "Appended episodes"
        );
        state.index = index;
        Ok(())
    }

    /// Item at `index` (negative counts from the newest frame), with the
    /// configured time-offset windows applied.
    pub fn read_frame(&self, index: i64) -> Result<Frame> {
        let state = self.read_state();
        let logical = state.resolve_index(index)?;
        state.read_frame(logical, self.window.as_ref())
    }

    /// Values of one field over all valid frames, oldest first.
    pub fn read_column(&self, field: &str) -> Result<FieldArray> {
        self.read_state().read_column(field)
    }

    /// Iterate every item in logical order.
    pub fn iter(&self) -> impl Iterator<Item = Result<Frame>> + '_ {
        (0..self.len() as i64).map(move |i| self.read_frame(i))
    }

    /// Contiguous logical ranges of frames sharing an episode index.
    pub fn episode_ranges(&self) -> Result<Vec<Range<usize>>> {
        self.read_state().episode_ranges()
    }

    /// Distinct episode indices currently held, ascending.
    pub fn unique_episode_indices(&self) -> Result<Vec<i64>> {
        let mut indices = self.read_column(EPISODE_INDEX_KEY)?.to_vec::<i64>()?;
        indices.sort_unstable();
        indices.dedup();
        Ok(indices)
    }

    pub fn num_episodes(&self) -> Result<usize> {
        Ok(self.unique_episode_indices()?.len())
    }
}

impl std::fmt::Debug for DataBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read_state();
        f.debug_struct("DataBuffer")
            .field("dir", &self.dir)
            .field("capacity", &state.capacity())
            .field("occupancy", &state.len())
            .field("write_cursor", &state.index.write_cursor)
            .field("fields", &self.data_spec)
            .finish()
    }
}
