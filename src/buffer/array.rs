//! `FieldArray`: a framework-agnostic, typed n-d array carried in little-endian bytes.

use crate::buffer::layout::{DType, FieldSpec};
use crate::error::{BufferError, Result};

/// Primitive element types that can live in a field.
pub trait Element: Copy + PartialEq + std::fmt::Debug {
    const DTYPE: DType;

    fn write_le(self, out: &mut Vec<u8>);

    /// `bytes` is exactly `DTYPE.size()` long.
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($ty:ty, $dtype:expr, $n:expr) => {
        impl Element for $ty {
            const DTYPE: DType = $dtype;

            #[inline]
            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            #[inline]
            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; $n];
                buf.copy_from_slice(bytes);
                <$ty>::from_le_bytes(buf)
            }
        }
    };
}

impl_element!(u8, DType::Uint8, 1);
impl_element!(u16, DType::Uint16, 2);
impl_element!(i32, DType::Int32, 4);
impl_element!(i64, DType::Int64, 8);
impl_element!(f32, DType::Float32, 4);
impl_element!(f64, DType::Float64, 8);

impl Element for bool {
    const DTYPE: DType = DType::Bool;

    #[inline]
    fn write_le(self, out: &mut Vec<u8>) {
        out.push(self as u8);
    }

    #[inline]
    fn read_le(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

/// Dense row-major array. `shape` includes every axis, the leading one
/// being the frame axis for batches and columns.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldArray {
    dtype: DType,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl FieldArray {
    /// Build from typed values. Fails when `values.len()` does not match `shape`.
    pub fn from_slice<T: Element>(shape: impl Into<Vec<usize>>, values: &[T]) -> Result<Self> {
        let shape = shape.into();
        let expected: usize = shape.iter().product();
        if expected != values.len() {
            return Err(BufferError::SchemaMismatch(format!(
                "shape {:?} holds {} elements, got {}",
                shape,
                expected,
                values.len()
            )));
        }
        let mut data = Vec::with_capacity(values.len() * T::DTYPE.size());
        for &v in values {
            v.write_le(&mut data);
        }
        Ok(Self {
            dtype: T::DTYPE,
            shape,
            data,
        })
    }

    /// One-dimensional array of `values`.
    pub fn from_vec<T: Element>(values: Vec<T>) -> Self {
        let mut data = Vec::with_capacity(values.len() * T::DTYPE.size());
        for &v in &values {
            v.write_le(&mut data);
        }
        Self {
            dtype: T::DTYPE,
            shape: vec![values.len()],
            data,
        }
    }

    /// Wrap raw little-endian bytes.
    pub fn from_bytes(dtype: DType, shape: impl Into<Vec<usize>>, data: Vec<u8>) -> Result<Self> {
        let shape = shape.into();
        let expected = shape.iter().product::<usize>() * dtype.size();
        if expected != data.len() {
            return Err(BufferError::SchemaMismatch(format!(
                "shape {:?} of {:?} needs {} bytes, got {}",
                shape,
                dtype,
                expected,
                data.len()
            )));
        }
        Ok(Self { dtype, shape, data })
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Raw little-endian payload.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Mutable raw payload. Shape and dtype stay fixed.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Extent of the leading axis; a 0-d array counts as one frame.
    pub fn num_frames(&self) -> usize {
        self.shape.first().copied().unwrap_or(1)
    }

    /// Decode into typed values. Fails when `T` is not the stored dtype.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if T::DTYPE != self.dtype {
            return Err(BufferError::SchemaMismatch(format!(
                "requested {:?}, array holds {:?}",
                T::DTYPE,
                self.dtype
            )));
        }
        Ok(self
            .data
            .chunks_exact(self.dtype.size())
            .map(T::read_le)
            .collect())
    }

    /// Whether this array is a stack of frames matching `spec`.
    pub(crate) fn matches_frames_of(&self, spec: &FieldSpec) -> bool {
        self.dtype == spec.dtype
            && self.shape.len() == spec.shape.len() + 1
            && self.shape[1..] == spec.shape[..]
    }

    /// Bytes of the `i`-th frame along the leading axis.
    pub(crate) fn frame_bytes(&self, i: usize, stride: usize) -> &[u8] {
        &self.data[i * stride..(i + 1) * stride]
    }
}
