pub mod arena;
pub mod ops;
pub mod quant;

pub use arena::{Frame, ScratchArena};

use crate::core::{NerError, Result};
use std::fmt;

/// Element encoding of a stored tensor. The discriminants are the on-disk tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F16,
    Q4_0,
}

impl DType {
    pub fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            0 => Some(DType::F32),
            1 => Some(DType::F16),
            2 => Some(DType::Q4_0),
            _ => None,
        }
    }

    pub fn tag(&self) -> i32 {
        match self {
            DType::F32 => 0,
            DType::F16 => 1,
            DType::Q4_0 => 2,
        }
    }

    /// Bytes used by one block of `block_size()` elements.
    pub fn type_size(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 => 2,
            DType::Q4_0 => quant::Q4_0_BLOCK_BYTES,
        }
    }

    pub fn block_size(&self) -> usize {
        match self {
            DType::F32 | DType::F16 => 1,
            DType::Q4_0 => quant::QK4_0,
        }
    }

    /// Byte length of one contiguous row of `ne0` elements. Saturates
    /// instead of wrapping; sizes from a file go through
    /// [`DType::checked_row_bytes`].
    pub fn row_bytes(&self, ne0: usize) -> usize {
        ne0.div_ceil(self.block_size()).saturating_mul(self.type_size())
    }

    pub fn checked_row_bytes(&self, ne0: usize) -> Option<usize> {
        ne0.div_ceil(self.block_size()).checked_mul(self.type_size())
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::Q4_0 => "q4_0",
        };
        f.write_str(name)
    }
}

/// Dimensions in ggml order: `dims[0]` is the contiguous axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Self { dims }
    }

    pub fn from_slice(dims: &[usize]) -> Self {
        Self { dims: dims.to_vec() }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn len(&self) -> usize {
        self.dims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dims.is_empty() || self.dims.iter().all(|&d| d == 0)
    }

    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn ne0(&self) -> usize {
        self.dims.first().copied().unwrap_or(1)
    }

    /// Number of contiguous rows (product of every axis but the first).
    pub fn rows(&self) -> usize {
        self.dims.iter().skip(1).product()
    }

    pub fn nbytes(&self, dtype: DType) -> usize {
        dtype.row_bytes(self.ne0()).saturating_mul(self.rows())
    }

    /// Storage size, or `None` if it does not fit in `usize`.
    pub fn checked_nbytes(&self, dtype: DType) -> Option<usize> {
        self.dims
            .iter()
            .skip(1)
            .try_fold(dtype.checked_row_bytes(self.ne0())?, |acc, &d| acc.checked_mul(d))
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.dims)
    }
}

/// A weight tensor: raw encoded bytes, row-major, allocated once and filled by the loader.
#[derive(Clone)]
pub struct Tensor {
    data: Vec<u8>,
    shape: Shape,
    dtype: DType,
}

impl Tensor {
    pub fn zeros(dtype: DType, shape: Shape) -> Self {
        let nbytes = shape.nbytes(dtype);
        Self {
            data: vec![0u8; nbytes],
            shape,
            dtype,
        }
    }

    /// Encodes f32 values into a new tensor of the given dtype.
    pub fn from_f32(dtype: DType, shape: Shape, values: &[f32]) -> Result<Self> {
        if values.len() != shape.numel() {
            return Err(NerError::BufferTooSmall {
                needed: shape.numel(),
                got: values.len(),
            });
        }
        let ne0 = shape.ne0();
        let mut data = Vec::with_capacity(shape.nbytes(dtype));
        for row in values.chunks(ne0.max(1)) {
            quant::encode_row(dtype, row, &mut data);
        }
        Ok(Self { data, shape, dtype })
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn nbytes(&self) -> usize {
        self.data.len()
    }

    pub fn ne0(&self) -> usize {
        self.shape.ne0()
    }

    pub fn rows(&self) -> usize {
        self.shape.rows()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Decodes row `row` into `out`, which must hold `ne0` values.
    pub fn dequantize_row(&self, row: usize, out: &mut [f32]) -> Result<()> {
        let ne0 = self.ne0();
        if out.len() < ne0 {
            return Err(NerError::BufferTooSmall {
                needed: ne0,
                got: out.len(),
            });
        }
        let row_bytes = self.dtype.row_bytes(ne0);
        let start = row * row_bytes;
        let bytes = self
            .data
            .get(start..start + row_bytes)
            .ok_or_else(|| NerError::format(format!("row {} out of range for shape {}", row, self.shape)))?;
        quant::decode_row(self.dtype, bytes, &mut out[..ne0]);
        Ok(())
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        let ne0 = self.ne0();
        let row_bytes = self.dtype.row_bytes(ne0);
        let mut out = vec![0.0f32; self.numel()];
        if ne0 == 0 {
            return out;
        }
        for (bytes, dst) in self.data.chunks(row_bytes).zip(out.chunks_mut(ne0)) {
            quant::decode_row(self.dtype, bytes, dst);
        }
        out
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor {{ shape: {}, dtype: {}, data: truncated }}", self.shape, self.dtype)
    }
}
