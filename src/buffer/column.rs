//! Field storage: one memory-mapped, fixed-stride file per field.

use crate::buffer::layout::{FieldSpec, COLUMN_EXTENSION};
use crate::error::{BufferError, Result};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

pub struct Column {
    spec: FieldSpec,
    capacity: usize,
    mmap: MmapMut,
    // Keeps the descriptor alive for the lifetime of the mapping.
    _file: File,
}

impl Column {
    pub fn path_for(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{}.{}", name, COLUMN_EXTENSION))
    }

    /// Create a zero-filled column file sized for `capacity` frames.
    pub fn create(dir: &Path, name: &str, spec: &FieldSpec, capacity: usize) -> Result<Self> {
        let path = Self::path_for(dir, name);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        file.set_len((spec.stride() * capacity) as u64)?;
        Self::map(file, spec, capacity)
    }

    /// Open an existing column file, checking its size against the spec.
    pub fn open(dir: &Path, name: &str, spec: &FieldSpec, capacity: usize) -> Result<Self> {
        let path = Self::path_for(dir, name);
        let file = OpenOptions::new().read(true).write(true).open(&path).map_err(|e| {
            BufferError::SchemaMismatch(format!("column '{}' unavailable: {}", name, e))
        })?;
        let expected = (spec.stride() * capacity) as u64;
        let found = file.metadata()?.len();
        if found != expected {
            return Err(BufferError::SchemaMismatch(format!(
                "column '{}' is {} bytes, expected {}",
                name, found, expected
            )));
        }
        Self::map(file, spec, capacity)
    }

    fn map(file: File, spec: &FieldSpec, capacity: usize) -> Result<Self> {
        // SAFETY: the owning buffer holds the directory lock, so no other
        // handle in this process or a cooperating one resizes or writes the file.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            spec: spec.clone(),
            capacity,
            mmap,
            _file: file,
        })
    }

    pub fn spec(&self) -> &FieldSpec {
        &self.spec
    }

    /// Bytes of the frame in physical `slot`.
    pub fn slot(&self, slot: usize) -> &[u8] {
        debug_assert!(slot < self.capacity);
        let stride = self.spec.stride();
        &self.mmap[slot * stride..(slot + 1) * stride]
    }

    /// Copy one frame into physical `slot`.
    pub fn write_slot(&mut self, slot: usize, bytes: &[u8]) {
        debug_assert!(slot < self.capacity);
        let stride = self.spec.stride();
        self.mmap[slot * stride..(slot + 1) * stride].copy_from_slice(bytes);
    }

    /// Bytes of `count` consecutive slots starting at `start` (no wrap).
    pub fn slots(&self, start: usize, count: usize) -> &[u8] {
        let stride = self.spec.stride();
        &self.mmap[start * stride..(start + count) * stride]
    }

    /// Flush dirty pages to disk.
    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }
}
