//! On-disk format definitions: field specs, reserved fields and the index file.

use crate::error::{BufferError, Result};
use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::mem::size_of;
use std::path::Path;
use tracing::warn;

pub const INDEX_KEY: &str = "index";
pub const EPISODE_INDEX_KEY: &str = "episode_index";
pub const FRAME_INDEX_KEY: &str = "frame_index";
pub const TIMESTAMP_KEY: &str = "timestamp";

/// Postfix of the pad-mask key emitted next to every windowed field.
pub const IS_PAD_POSTFIX: &str = "_is_pad";

pub const INDEX_FILE: &str = "index.meta";
pub const LOCK_FILE: &str = "LOCK";
pub const COLUMN_EXTENSION: &str = "col";

/// Element type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Bool,
    Uint8,
    Uint16,
    Int32,
    Int64,
    Float32,
    Float64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            DType::Bool | DType::Uint8 => 1,
            DType::Uint16 => 2,
            DType::Int32 | DType::Float32 => 4,
            DType::Int64 | DType::Float64 => 8,
        }
    }
}

/// Fixed per-frame shape and element type of one named field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub shape: Vec<usize>,
    pub dtype: DType,
}

impl FieldSpec {
    pub fn new(shape: impl Into<Vec<usize>>, dtype: DType) -> Self {
        Self {
            shape: shape.into(),
            dtype,
        }
    }

    /// A scalar-per-frame field.
    pub fn scalar(dtype: DType) -> Self {
        Self::new(Vec::new(), dtype)
    }

    /// Number of elements in one frame.
    pub fn frame_len(&self) -> usize {
        self.shape.iter().product()
    }

    /// Number of bytes in one frame.
    pub fn stride(&self) -> usize {
        self.frame_len() * self.dtype.size()
    }
}

/// Field registry of a buffer, reserved fields included.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataSpec {
    fields: BTreeMap<String, FieldSpec>,
}

impl DataSpec {
    /// Specs every buffer carries regardless of what the caller declares.
    pub fn reserved() -> BTreeMap<String, FieldSpec> {
        let mut fields = BTreeMap::new();
        fields.insert(INDEX_KEY.to_string(), FieldSpec::scalar(DType::Int64));
        fields.insert(EPISODE_INDEX_KEY.to_string(), FieldSpec::scalar(DType::Int64));
        fields.insert(FRAME_INDEX_KEY.to_string(), FieldSpec::scalar(DType::Int64));
        fields.insert(TIMESTAMP_KEY.to_string(), FieldSpec::scalar(DType::Float64));
        fields
    }

    pub fn is_reserved(name: &str) -> bool {
        matches!(
            name,
            INDEX_KEY | EPISODE_INDEX_KEY | FRAME_INDEX_KEY | TIMESTAMP_KEY
        )
    }

    /// Merge user fields with the reserved ones.
    ///
    /// A user field may restate a reserved field only with the identical spec.
    pub fn with_reserved(user: BTreeMap<String, FieldSpec>) -> Result<Self> {
        let mut fields = Self::reserved();
        for (name, spec) in user {
            if name.is_empty() || name.ends_with(IS_PAD_POSTFIX) {
                return Err(BufferError::InvalidConfig(format!(
                    "invalid field name '{}'",
                    name
                )));
            }
            if !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            {
                return Err(BufferError::InvalidConfig(format!(
                    "field name '{}' must be ASCII alphanumeric, '_', '-' or '.'",
                    name
                )));
            }
            if let Some(reserved) = fields.get(&name) {
                if *reserved != spec {
                    return Err(BufferError::InvalidConfig(format!(
                        "reserved field '{}' must be {:?}, got {:?}",
                        name, reserved, spec
                    )));
                }
                continue;
            }
            fields.insert(name, spec);
        }
        Ok(Self { fields })
    }

    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldSpec)> {
        self.fields.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Persisted buffer state. Everything needed to reopen without the
/// construction parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferIndex {
    pub capacity: usize,
    pub fields: DataSpec,
    /// Total frames ever appended; the next physical slot is `write_cursor % capacity`.
    pub write_cursor: u64,
    pub occupancy: usize,
    pub fps: Option<f64>,
}

/// Fixed-size header in front of the JSON body of the index file.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct IndexHeader {
    pub magic: u32,    // b"EPB0"
    pub version: u32,  // 1
    pub checksum: u32, // crc32 of the body
    pub body_len: u32,
}

impl IndexHeader {
    pub const MAGIC: u32 = u32::from_le_bytes(*b"EPB0");
    pub const VERSION: u32 = 1;
    pub const SIZE: usize = size_of::<Self>();

    fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buf[12..16].copy_from_slice(&self.body_len.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8; Self::SIZE]) -> Self {
        let word = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Self {
            magic: word(0),
            version: word(4),
            checksum: word(8),
            body_len: word(12),
        }
    }
}

impl BufferIndex {
    /// Atomically replace the index file in `dir`.
    pub fn store(&self, dir: &Path) -> Result<()> {
        let body = serde_json::to_vec(self)?;
        let mut hasher = Crc32::new();
        hasher.update(&body);
        let header = IndexHeader {
            magic: IndexHeader::MAGIC,
            version: IndexHeader::VERSION,
            checksum: hasher.finalize(),
            body_len: body.len() as u32,
        };

        let tmp_path = dir.join(format!("{}.tmp", INDEX_FILE));
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            file.write_all(&header.to_bytes())?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, dir.join(INDEX_FILE))?;
        Ok(())
    }

    /// Load and verify the index file in `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        Self::read_verified(&dir.join(INDEX_FILE)).map_err(|e| {
            if matches!(e, BufferError::CorruptIndex(_) | BufferError::Serialization(_)) {
                warn!(dir = %dir.display(), error = %e, "Rejected buffer index");
            }
            e
        })
    }

    fn read_verified(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut header_buf = [0u8; IndexHeader::SIZE];
        file.read_exact(&mut header_buf)
            .map_err(|e| BufferError::CorruptIndex(format!("truncated header: {}", e)))?;
        let header = IndexHeader::from_bytes(&header_buf);

        if header.magic != IndexHeader::MAGIC {
            return Err(BufferError::CorruptIndex("bad magic".to_string()));
        }
        if header.version != IndexHeader::VERSION {
            return Err(BufferError::CorruptIndex(format!(
                "unsupported version {}",
                header.version
            )));
        }

        let mut body = vec![0u8; header.body_len as usize];
        file.read_exact(&mut body)
            .map_err(|e| BufferError::CorruptIndex(format!("truncated body: {}", e)))?;
        let mut hasher = Crc32::new();
        hasher.update(&body);
        if hasher.finalize() != header.checksum {
            return Err(BufferError::CorruptIndex("checksum mismatch".to_string()));
        }

        let index: BufferIndex = serde_json::from_slice(&body)?;
        index.validate()?;
        Ok(index)
    }

    pub fn exists(dir: &Path) -> bool {
        dir.join(INDEX_FILE).is_file()
    }

    fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(BufferError::CorruptIndex("zero capacity".to_string()));
        }
        // Below the cursor bound only while an append's eviction is committed
        // ahead of its writes.
        let bound = self.write_cursor.min(self.capacity as u64) as usize;
        if self.occupancy > bound {
            return Err(BufferError::CorruptIndex(format!(
                "occupancy {} inconsistent with cursor {} and capacity {}",
                self.occupancy, self.write_cursor, self.capacity
            )));
        }
        for (name, _) in DataSpec::reserved() {
            if !self.fields.contains(&name) {
                return Err(BufferError::CorruptIndex(format!(
                    "reserved field '{}' missing",
                    name
                )));
            }
        }
        Ok(())
    }
}
