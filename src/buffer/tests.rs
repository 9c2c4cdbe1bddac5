//! Unit + integration tests for the data buffer.

use super::*;
use crate::config::BufferConfig;
use crate::error::BufferError;
use crate::window::DeltaTimestamps;
use std::collections::BTreeMap;
use std::path::Path;
use tempfile::tempdir;

const DATA_KEY: &str = "data";
const DATA_SHAPE: [usize; 2] = [2, 3];
const CAPACITY: usize = 100;
const FPS: f64 = 10.0;

fn config(dir: &Path) -> BufferConfig {
    BufferConfig::new(dir, CAPACITY).field(
        DATA_KEY,
        FieldSpec::new(DATA_SHAPE.to_vec(), DType::Float32),
    )
}

fn make_buffer(dir: &Path) -> DataBuffer {
    DataBuffer::create_or_open(&config(dir)).unwrap()
}

fn make_windowed_buffer(dir: &Path, offsets: &[f64]) -> DataBuffer {
    let mut delta = DeltaTimestamps::new();
    delta.insert(INDEX_KEY.to_string(), offsets.to_vec());
    DataBuffer::create_or_open(&config(dir).fps(FPS).delta_timestamps(delta)).unwrap()
}

/// `n_episodes` episodes of `frames_per_episode` frames at `FPS`; data values
/// count up from `offset`.
fn spoof_frames(n_episodes: usize, frames_per_episode: usize, offset: f32) -> EpisodeBatch {
    let n = n_episodes * frames_per_episode;
    let per_frame: usize = DATA_SHAPE.iter().product();
    let data: Vec<f32> = (0..n * per_frame).map(|v| v as f32 + offset).collect();
    let index: Vec<i64> = (0..n as i64).collect();
    let episode_index: Vec<i64> = (0..n).map(|i| (i / frames_per_episode) as i64).collect();
    let frame_index: Vec<i64> = (0..n).map(|i| (i % frames_per_episode) as i64).collect();
    let timestamp: Vec<f64> = (0..n)
        .map(|i| (i % frames_per_episode) as f64 / FPS)
        .collect();

    EpisodeBatch::new()
        .with_field(
            DATA_KEY,
            FieldArray::from_slice(vec![n, DATA_SHAPE[0], DATA_SHAPE[1]], &data).unwrap(),
        )
        .with_field(INDEX_KEY, FieldArray::from_vec(index))
        .with_field(EPISODE_INDEX_KEY, FieldArray::from_vec(episode_index))
        .with_field(FRAME_INDEX_KEY, FieldArray::from_vec(frame_index))
        .with_field(TIMESTAMP_KEY, FieldArray::from_vec(timestamp))
}

/// Frame `i` of `batch[DATA_KEY]` as f32 values.
fn data_frame(batch: &EpisodeBatch, i: usize) -> Vec<f32> {
    let per_frame: usize = DATA_SHAPE.iter().product();
    let values = batch.get(DATA_KEY).unwrap().to_vec::<f32>().unwrap();
    values[i * per_frame..(i + 1) * per_frame].to_vec()
}

#[test]
fn append_copies_its_input() {
    let dir = tempdir().unwrap();
    let buffer = make_buffer(dir.path());
    let mut batch = spoof_frames(2, CAPACITY / 4, 0.0);
    let original = batch.clone();
    buffer.append_episodes(&batch).unwrap();

    for byte in batch.get_mut(DATA_KEY).unwrap().as_bytes_mut() {
        *byte = byte.wrapping_add(1);
    }

    assert_eq!(buffer.read_column(DATA_KEY).unwrap(), *original.get(DATA_KEY).unwrap());
    let first = buffer.read_frame(0).unwrap();
    assert_eq!(first[DATA_KEY].to_vec::<f32>().unwrap(), data_frame(&original, 0));
}

#[test]
fn index_error_without_data() {
    let dir = tempdir().unwrap();
    let buffer = make_buffer(dir.path());
    for i in [0, 1, -1] {
        assert!(matches!(
            buffer.read_frame(i),
            Err(BufferError::Index { len: 0, .. })
        ));
    }
}

#[test]
fn index_error_with_data() {
    let dir = tempdir().unwrap();
    let buffer = make_buffer(dir.path());
    let n = CAPACITY / 2;
    buffer.append_episodes(&spoof_frames(1, n, 0.0)).unwrap();
    assert!(matches!(buffer.read_frame(n as i64), Err(BufferError::Index { .. })));
    assert!(matches!(buffer.read_frame(-(n as i64) - 1), Err(BufferError::Index { .. })));
    let newest = buffer.read_frame(-1).unwrap();
    assert_eq!(newest[INDEX_KEY].to_vec::<i64>().unwrap(), vec![n as i64 - 1]);
}

fn check_write_read(reload: bool) {
    let dir = tempdir().unwrap();
    let batch = spoof_frames(2, CAPACITY / 4, 0.0);
    let mut buffer = make_buffer(dir.path());
    buffer.append_episodes(&batch).unwrap();

    if reload {
        drop(buffer);
        buffer = make_buffer(dir.path());
    }

    assert_eq!(buffer.len(), CAPACITY / 2);
    for (i, item) in buffer.iter().enumerate() {
        let item = item.unwrap();
        assert_eq!(item[DATA_KEY].shape(), &DATA_SHAPE);
        assert_eq!(item[DATA_KEY].to_vec::<f32>().unwrap(), data_frame(&batch, i));
        assert_eq!(item[INDEX_KEY].to_vec::<i64>().unwrap(), vec![i as i64]);
    }
}

#[test]
fn write_read() {
    check_write_read(false);
}

#[test]
fn write_read_after_reload() {
    check_write_read(true);
}

#[test]
fn read_column_in_insertion_order() {
    let dir = tempdir().unwrap();
    let buffer = make_buffer(dir.path());
    let batch = spoof_frames(2, CAPACITY / 4, 0.0);
    buffer.append_episodes(&batch).unwrap();

    let column = buffer.read_column(DATA_KEY).unwrap();
    assert_eq!(column.shape(), &[CAPACITY / 2, 2, 3]);
    assert_eq!(column, *batch.get(DATA_KEY).unwrap());
    assert!(matches!(
        buffer.read_column("nope"),
        Err(BufferError::UnknownField(name)) if name == "nope"
    ));
}

fn check_fifo(reload: bool) {
    let dir = tempdir().unwrap();
    let frames_per_episode = CAPACITY / 4;
    let first = spoof_frames(3, frames_per_episode, 0.0);
    let second = spoof_frames(2, frames_per_episode, 10_000.0);
    assert!(5 * frames_per_episode > CAPACITY);

    let mut buffer = make_buffer(dir.path());
    buffer.append_episodes(&first).unwrap();
    buffer.append_episodes(&second).unwrap();
    if reload {
        drop(buffer);
        buffer = make_buffer(dir.path());
    }
    assert_eq!(buffer.len(), CAPACITY);

    // Oldest 25 frames of `first` are evicted; the rest follow in order.
    let total = 5 * frames_per_episode;
    let evicted = total - CAPACITY;
    for logical in 0..CAPACITY {
        let source = logical + evicted;
        let expected = if source < first.num_frames() {
            data_frame(&first, source)
        } else {
            data_frame(&second, source - first.num_frames())
        };
        let item = buffer.read_frame(logical as i64).unwrap();
        assert_eq!(item[DATA_KEY].to_vec::<f32>().unwrap(), expected);
    }

    let episodes = buffer.read_column(EPISODE_INDEX_KEY).unwrap().to_vec::<i64>().unwrap();
    assert_eq!(episodes[0], 1);
    assert_eq!(episodes[CAPACITY - 1], 1);
}

#[test]
fn fifo() {
    check_fifo(false);
}

#[test]
fn fifo_after_reload() {
    check_fifo(true);
}

#[test]
fn single_append_larger_than_capacity_keeps_the_tail() {
    let dir = tempdir().unwrap();
    let buffer = make_buffer(dir.path());
    buffer.append_episodes(&spoof_frames(1, 10, 0.0)).unwrap();
    let big = spoof_frames(5, 50, 0.0);
    buffer.append_episodes(&big).unwrap();

    assert_eq!(buffer.len(), CAPACITY);
    let index = buffer.read_column(INDEX_KEY).unwrap().to_vec::<i64>().unwrap();
    assert_eq!(index, (150..250).collect::<Vec<i64>>());
}

#[test]
fn eviction_is_not_episode_aligned() {
    let dir = tempdir().unwrap();
    let buffer = make_buffer(dir.path());
    buffer.append_episodes(&spoof_frames(3, 40, 0.0)).unwrap();

    let ranges = buffer.episode_ranges().unwrap();
    // 20 frames of episode 0 evicted, its remaining 20 stay.
    assert_eq!(ranges, vec![0..20, 20..60, 60..100]);
    let frame_index = buffer.read_frame(0).unwrap()[FRAME_INDEX_KEY].to_vec::<i64>().unwrap();
    assert_eq!(frame_index, vec![20]);
    assert_eq!(buffer.unique_episode_indices().unwrap(), vec![0, 1, 2]);
    assert_eq!(buffer.num_episodes().unwrap(), 3);
}

#[test]
fn schema_mismatch_on_append_writes_nothing() {
    let dir = tempdir().unwrap();
    let buffer = make_buffer(dir.path());

    let full = spoof_frames(1, 4, 0.0);
    let missing = EpisodeBatch::new()
        .with_field(INDEX_KEY, full.get(INDEX_KEY).unwrap().clone())
        .with_field(DATA_KEY, full.get(DATA_KEY).unwrap().clone());
    assert!(matches!(
        buffer.append_episodes(&missing),
        Err(BufferError::SchemaMismatch(_))
    ));

    let extra = spoof_frames(1, 4, 0.0).with_field("extra", FieldArray::from_vec(vec![1i64; 4]));
    assert!(matches!(
        buffer.append_episodes(&extra),
        Err(BufferError::SchemaMismatch(_))
    ));

    let wrong_dtype = spoof_frames(1, 4, 0.0)
        .with_field(DATA_KEY, FieldArray::from_slice(vec![4usize, 2, 3], &[0f64; 24]).unwrap());
    assert!(matches!(
        buffer.append_episodes(&wrong_dtype),
        Err(BufferError::SchemaMismatch(_))
    ));

    let wrong_shape = spoof_frames(1, 4, 0.0)
        .with_field(DATA_KEY, FieldArray::from_slice(vec![4usize, 3, 2], &[0f32; 24]).unwrap());
    assert!(matches!(
        buffer.append_episodes(&wrong_shape),
        Err(BufferError::SchemaMismatch(_))
    ));

    let ragged = spoof_frames(1, 4, 0.0).with_field(INDEX_KEY, FieldArray::from_vec(vec![0i64; 3]));
    assert!(matches!(
        buffer.append_episodes(&ragged),
        Err(BufferError::SchemaMismatch(_))
    ));

    assert!(buffer.is_empty());
}

#[test]
fn reopen_with_mismatched_spec_fails() {
    let dir = tempdir().unwrap();
    drop(make_buffer(dir.path()));

    let other_shape = BufferConfig::new(dir.path(), CAPACITY)
        .field(DATA_KEY, FieldSpec::new(vec![3usize, 2], DType::Float32));
    assert!(matches!(
        DataBuffer::create_or_open(&other_shape),
        Err(BufferError::SchemaMismatch(_))
    ));

    let other_capacity = BufferConfig::new(dir.path(), CAPACITY + 1)
        .field(DATA_KEY, FieldSpec::new(DATA_SHAPE.to_vec(), DType::Float32));
    assert!(matches!(
        DataBuffer::create_or_open(&other_capacity),
        Err(BufferError::SchemaMismatch(_))
    ));

    // The failed attempts must not leave the directory locked.
    make_buffer(dir.path());
}

#[test]
fn open_existing_is_self_describing() {
    let dir = tempdir().unwrap();
    let batch = spoof_frames(2, 30, 0.0);
    {
        let buffer = make_buffer(dir.path());
        buffer.append_episodes(&batch).unwrap();
        buffer.append_episodes(&spoof_frames(2, 30, 500.0)).unwrap();
    }
    let reopened = DataBuffer::open_existing(dir.path()).unwrap();
    assert_eq!(reopened.capacity(), CAPACITY);
    assert_eq!(reopened.len(), CAPACITY);
    assert_eq!(
        reopened.data_spec().get(DATA_KEY),
        Some(&FieldSpec::new(DATA_SHAPE.to_vec(), DType::Float32))
    );
    assert_eq!(
        reopened.read_frame(0).unwrap()[DATA_KEY].to_vec::<f32>().unwrap(),
        data_frame(&batch, 20)
    );
}

#[test]
fn storage_dir_is_exclusively_owned() {
    let dir = tempdir().unwrap();
    let buffer = make_buffer(dir.path());
    assert!(matches!(
        DataBuffer::create_or_open(&config(dir.path())),
        Err(BufferError::StorageLocked(_))
    ));
    drop(buffer);
    make_buffer(dir.path());
}

#[cfg(target_os = "linux")]
#[test]
fn lock_left_by_a_dead_process_is_reclaimed() {
    let dir = tempdir().unwrap();
    let batch = spoof_frames(2, 10, 0.0);
    make_buffer(dir.path()).append_episodes(&batch).unwrap();

    let lock = dir.path().join(layout::LOCK_FILE);
    for leftover in ["4294967295\n", "", "not a pid"] {
        std::fs::write(&lock, leftover).unwrap();
        let buffer = make_buffer(dir.path());
        assert_eq!(buffer.len(), 20);
        assert_eq!(
            buffer.read_frame(0).unwrap()[DATA_KEY].to_vec::<f32>().unwrap(),
            data_frame(&batch, 0)
        );
    }

    // A live owner keeps the directory.
    std::fs::write(&lock, format!("{}\n", std::process::id())).unwrap();
    assert!(matches!(
        DataBuffer::open_existing(dir.path()),
        Err(BufferError::StorageLocked(_))
    ));
}

#[test]
fn failed_commit_leaves_committed_frames_intact() {
    let dir = tempdir().unwrap();
    let buffer = make_buffer(dir.path());
    let full = spoof_frames(4, CAPACITY / 4, 0.0);
    buffer.append_episodes(&full).unwrap();

    let blocker = dir.path().join(format!("{}.tmp", layout::INDEX_FILE));
    std::fs::create_dir(&blocker).unwrap();
    let result = buffer.append_episodes(&spoof_frames(1, 10, 10_000.0));
    assert!(matches!(result, Err(BufferError::Io(_))));
    assert_eq!(buffer.len(), CAPACITY);
    for i in [0, CAPACITY - 1] {
        let item = buffer.read_frame(i as i64).unwrap();
        assert_eq!(item[DATA_KEY].to_vec::<f32>().unwrap(), data_frame(&full, i));
    }

    std::fs::remove_dir(&blocker).unwrap();
    let next = spoof_frames(1, 10, 10_000.0);
    buffer.append_episodes(&next).unwrap();
    assert_eq!(
        buffer.read_frame(0).unwrap()[DATA_KEY].to_vec::<f32>().unwrap(),
        data_frame(&full, 10)
    );
    assert_eq!(
        buffer.read_frame(-1).unwrap()[DATA_KEY].to_vec::<f32>().unwrap(),
        data_frame(&next, 9)
    );
}

#[test]
fn eviction_committed_ahead_of_writes_reopens_cleanly() {
    let dir = tempdir().unwrap();
    let full = spoof_frames(4, CAPACITY / 4, 0.0);
    make_buffer(dir.path()).append_episodes(&full).unwrap();

    // State after the eviction commit of a 10-frame append, before its writes.
    let mut index = layout::BufferIndex::load(dir.path()).unwrap();
    index.occupancy -= 10;
    index.store(dir.path()).unwrap();

    let buffer = make_buffer(dir.path());
    assert_eq!(buffer.len(), CAPACITY - 10);
    assert_eq!(
        buffer.read_frame(0).unwrap()[DATA_KEY].to_vec::<f32>().unwrap(),
        data_frame(&full, 10)
    );

    let next = spoof_frames(1, 10, 10_000.0);
    buffer.append_episodes(&next).unwrap();
    assert_eq!(buffer.len(), CAPACITY);
    assert_eq!(
        buffer.read_frame(0).unwrap()[DATA_KEY].to_vec::<f32>().unwrap(),
        data_frame(&full, 10)
    );
}

#[test]
fn corrupt_index_is_rejected() {
    let dir = tempdir().unwrap();
    drop(make_buffer(dir.path()));
    let path = dir.path().join(layout::INDEX_FILE);
    let mut bytes = std::fs::read(&path).unwrap();
    let last = bytes.len() - 2;
    bytes[last] ^= 0xff;
    std::fs::write(&path, bytes).unwrap();
    assert!(matches!(
        DataBuffer::open_existing(dir.path()),
        Err(BufferError::CorruptIndex(_))
    ));
}

#[test]
fn reserved_fields_cannot_be_redefined() {
    let dir = tempdir().unwrap();
    let config = BufferConfig::new(dir.path(), CAPACITY)
        .field(TIMESTAMP_KEY, FieldSpec::scalar(DType::Float32));
    assert!(matches!(
        DataBuffer::create_or_open(&config),
        Err(BufferError::InvalidConfig(_))
    ));
}

#[test]
fn delta_timestamps_within_tolerance() {
    let dir = tempdir().unwrap();
    let mut buffer = make_windowed_buffer(dir.path(), &[-0.2, 0.0, 0.139]);
    buffer.append_episodes(&spoof_frames(1, 5, 0.0)).unwrap();
    buffer.set_tolerance_s(0.04).unwrap();

    let item = buffer.read_frame(2).unwrap();
    assert_eq!(item[INDEX_KEY].to_vec::<i64>().unwrap(), vec![0, 2, 3]);
    assert_eq!(item["index_is_pad"].to_vec::<bool>().unwrap(), vec![false; 3]);
    // Unwindowed fields stay single-frame.
    assert_eq!(item[DATA_KEY].shape(), &DATA_SHAPE);
}

#[test]
fn delta_timestamps_outside_tolerance_inside_episode_range() {
    let dir = tempdir().unwrap();
    let mut buffer = make_windowed_buffer(dir.path(), &[-0.2, 0.0, 0.141]);
    buffer.append_episodes(&spoof_frames(1, 5, 0.0)).unwrap();
    buffer.set_tolerance_s(0.04).unwrap();
    assert!(matches!(
        buffer.read_frame(2),
        Err(BufferError::TimestampOutsideTolerance { .. })
    ));
}

#[test]
fn delta_timestamps_outside_tolerance_outside_episode_range() {
    let dir = tempdir().unwrap();
    let mut buffer = make_windowed_buffer(dir.path(), &[-0.3, -0.24, 0.0, 0.26, 0.3]);
    buffer.append_episodes(&spoof_frames(1, 5, 0.0)).unwrap();
    buffer.set_tolerance_s(0.04).unwrap();

    let item = buffer.read_frame(2).unwrap();
    assert_eq!(item[INDEX_KEY].to_vec::<i64>().unwrap(), vec![0, 0, 2, 4, 4]);
    assert_eq!(
        item["index_is_pad"].to_vec::<bool>().unwrap(),
        vec![true, false, false, true, true]
    );
}

#[test]
fn default_tolerance_follows_fps() {
    let dir = tempdir().unwrap();
    let buffer = make_windowed_buffer(dir.path(), &[0.0]);
    assert!((buffer.tolerance_s().unwrap() - (1.0 / FPS - 1e-4)).abs() < 1e-12);
}

#[test]
fn windows_of_unknown_fields_are_rejected() {
    let dir = tempdir().unwrap();
    let mut delta = DeltaTimestamps::new();
    delta.insert("missing".to_string(), vec![0.0]);
    assert!(matches!(
        DataBuffer::create_or_open(&config(dir.path()).fps(FPS).delta_timestamps(delta)),
        Err(BufferError::UnknownField(_))
    ));
}

#[test]
fn windowed_reads_through_wraparound() {
    let dir = tempdir().unwrap();
    let mut delta = DeltaTimestamps::new();
    delta.insert(DATA_KEY.to_string(), vec![-0.1, 0.0]);
    let buffer =
        DataBuffer::create_or_open(&config(dir.path()).fps(FPS).delta_timestamps(delta)).unwrap();
    buffer.append_episodes(&spoof_frames(3, 30, 0.0)).unwrap();
    buffer.append_episodes(&spoof_frames(1, 30, 1000.0)).unwrap();

    // Newest frame: second-to-last and last frame of the latest episode.
    let batch = spoof_frames(1, 30, 1000.0);
    let item = buffer.read_frame(-1).unwrap();
    let mut expected = data_frame(&batch, 28);
    expected.extend(data_frame(&batch, 29));
    assert_eq!(item[DATA_KEY].shape(), &[2, 2, 3]);
    assert_eq!(item[DATA_KEY].to_vec::<f32>().unwrap(), expected);
    assert_eq!(item["data_is_pad"].to_vec::<bool>().unwrap(), vec![false, false]);

    // Oldest surviving frame is mid-episode; looking back pads onto it.
    let item = buffer.read_frame(0).unwrap();
    assert_eq!(item["data_is_pad"].to_vec::<bool>().unwrap(), vec![true, false]);
}

struct SpoofSource {
    batch: EpisodeBatch,
    loads: std::cell::Cell<usize>,
}

impl EpisodeSource for SpoofSource {
    fn dataset_id(&self) -> &str {
        "lerobot/spoof"
    }

    fn fingerprint(&self) -> String {
        content_fingerprint(&self.batch)
    }

    fn fps(&self) -> f64 {
        FPS
    }

    fn field_specs(&self, _decode_video: bool) -> BTreeMap<String, FieldSpec> {
        let mut fields = BTreeMap::new();
        fields.insert(DATA_KEY.to_string(), FieldSpec::new(DATA_SHAPE.to_vec(), DType::Float32));
        fields
    }

    fn load_episodes(&self, _decode_video: bool) -> crate::error::Result<EpisodeBatch> {
        self.loads.set(self.loads.get() + 1);
        Ok(self.batch.clone())
    }
}

#[test]
fn from_source_materializes_then_reuses() {
    let root = tempdir().unwrap();
    let source = SpoofSource {
        batch: spoof_frames(3, 7, 0.0),
        loads: std::cell::Cell::new(0),
    };
    let dir = default_storage_dir(root.path(), source.dataset_id(), &source.fingerprint(), true);
    assert!(dir.ends_with(format!("spoof_{}_decoded", source.fingerprint())));

    for _ in 0..2 {
        let buffer = DataBuffer::from_source(&source, true, Some(dir.clone())).unwrap();
        assert_eq!(buffer.len(), 21);
        assert_eq!(buffer.capacity(), 21);
        assert_eq!(buffer.fps(), Some(FPS));
        assert_eq!(buffer.read_column(DATA_KEY).unwrap(), *source.batch.get(DATA_KEY).unwrap());
    }
    assert_eq!(source.loads.get(), 1);
}

#[test]
fn default_storage_dir_naming() {
    let root = Path::new("/tmp");
    assert_eq!(
        default_storage_dir(root, "lerobot/pusht", "abc", false),
        Path::new("/tmp/lerobot/pusht_abc")
    );
    assert_eq!(
        default_storage_dir(root, "lerobot/pusht", "abc", true),
        Path::new("/tmp/lerobot/pusht_abc_decoded")
    );
}

#[test]
fn content_fingerprint_tracks_content() {
    let a = spoof_frames(1, 4, 0.0);
    let b = spoof_frames(1, 4, 1.0);
    assert_eq!(content_fingerprint(&a), content_fingerprint(&a.clone()));
    assert_ne!(content_fingerprint(&a), content_fingerprint(&b));
    assert_eq!(content_fingerprint(&a).len(), 16);
}
