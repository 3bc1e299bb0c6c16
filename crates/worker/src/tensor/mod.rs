//! Tensor data structures
//!
//! Dense row-major tensors over the two element types that cross the wire:
//! `u8` (raw camera frames, quantized feature maps) and `f32`.

pub mod safetensors;

pub use safetensors::{SafeTensorBuffer, SafeTensorView, TensorDType};

use num_traits::NumCast;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use splitinfer_common::{Result, SplitInferError};
use std::fmt;

/// Tensor shape
pub type Shape = Vec<usize>;

/// Element type of a tensor on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    #[serde(rename = "uint8")]
    U8,
    #[serde(rename = "float32")]
    F32,
}

impl DType {
    /// Size in bytes of one element
    pub fn size(&self) -> usize {
        match self {
            DType::U8 => 1,
            DType::F32 => 4,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::U8 => f.write_str("uint8"),
            DType::F32 => f.write_str("float32"),
        }
    }
}

/// Scalar types a [`Tensor`] may hold
pub trait Element: Copy + Default + Send + Sync + NumCast + PartialOrd + 'static {
    const DTYPE: DType;

    /// Decode one element from its little-endian bytes
    fn from_le(bytes: &[u8]) -> Self;

    /// Append the little-endian bytes of this element
    fn extend_le(self, out: &mut Vec<u8>);
}

impl Element for u8 {
    const DTYPE: DType = DType::U8;

    fn from_le(bytes: &[u8]) -> Self {
        bytes[0]
    }

    fn extend_le(self, out: &mut Vec<u8>) {
        out.push(self);
    }
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;

    fn from_le(bytes: &[u8]) -> Self {
        f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    fn extend_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
}

/// Owned tensor with heap-allocated data
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T> {
    pub data: Vec<T>,
    pub shape: Shape,
}

impl<T> Tensor<T>
where
    T: Element,
{
    /// Create a new tensor from data and shape
    pub fn new(data: Vec<T>, shape: Shape) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(SplitInferError::tensor(format!(
                "shape {:?} needs {} elements, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { data, shape })
    }

    /// Get the total number of elements
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the tensor is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Reinterpret packed little-endian bytes as a tensor of this shape
    pub fn from_le_bytes(bytes: &[u8], shape: Shape) -> Result<Self> {
        let size = T::DTYPE.size();
        let expected = shape.iter().product::<usize>() * size;
        if bytes.len() != expected {
            return Err(SplitInferError::codec(format!(
                "expected {} bytes for {} tensor of shape {:?}, got {}",
                expected,
                T::DTYPE,
                shape,
                bytes.len()
            )));
        }

        let data = bytes.par_chunks_exact(size).map(T::from_le).collect();
        Ok(Self { data, shape })
    }

    /// Packed little-endian bytes of the tensor data
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len() * T::DTYPE.size());
        for &value in &self.data {
            value.extend_le(&mut out);
        }
        out
    }

    /// Numeric conversion to another element type (saturating)
    pub fn cast<U: Element>(&self) -> Tensor<U> {
        let data = self
            .data
            .par_iter()
            .map(|&v| saturating_cast::<T, U>(v))
            .collect();
        Tensor {
            data,
            shape: self.shape.clone(),
        }
    }
}

fn saturating_cast<T: Element, U: Element>(value: T) -> U {
    if let Some(v) = <U as NumCast>::from(value) {
        return v;
    }
    // Only reachable for float -> u8 out of range or NaN
    let v = value.to_f64().unwrap_or(0.0);
    if v.is_nan() || v < 0.0 {
        <U as NumCast>::from(0u8).unwrap_or_default()
    } else {
        <U as NumCast>::from(255u8).unwrap_or_default()
    }
}

impl<T> fmt::Display for Tensor<T>
where
    T: Element,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor<{}>(shape={:?}, size={})", T::DTYPE, self.shape, self.len())
    }
}

/// A tensor whose element type is only known at runtime
#[derive(Debug, Clone, PartialEq)]
pub enum DynTensor {
    U8(Tensor<u8>),
    F32(Tensor<f32>),
}

impl DynTensor {
    /// Reinterpret packed little-endian bytes with the given dtype
    pub fn from_le_bytes(bytes: &[u8], shape: Shape, dtype: DType) -> Result<Self> {
        Ok(match dtype {
            DType::U8 => DynTensor::U8(Tensor::from_le_bytes(bytes, shape)?),
            DType::F32 => DynTensor::F32(Tensor::from_le_bytes(bytes, shape)?),
        })
    }

    /// Convert a `u8` tensor into the given dtype
    pub fn from_u8(tensor: Tensor<u8>, dtype: DType) -> Self {
        match dtype {
            DType::U8 => DynTensor::U8(tensor),
            DType::F32 => DynTensor::F32(tensor.cast()),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            DynTensor::U8(_) => DType::U8,
            DynTensor::F32(_) => DType::F32,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            DynTensor::U8(t) => &t.shape,
            DynTensor::F32(t) => &t.shape,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            DynTensor::U8(t) => t.len(),
            DynTensor::F32(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Widen to `f32`, copying only when needed
    pub fn to_f32(&self) -> std::borrow::Cow<'_, Tensor<f32>> {
        match self {
            DynTensor::U8(t) => std::borrow::Cow::Owned(t.cast()),
            DynTensor::F32(t) => std::borrow::Cow::Borrowed(t),
        }
    }

    /// Packed little-endian bytes of the tensor data
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            DynTensor::U8(t) => t.to_le_bytes(),
            DynTensor::F32(t) => t.to_le_bytes(),
        }
    }

    /// Summary statistics used for monitor previews
    pub fn summary(&self) -> TensorSummary {
        let values = self.to_f32();
        let (min, max, sum) = values
            .data
            .par_iter()
            .fold(
                || (f32::INFINITY, f32::NEG_INFINITY, 0.0f64),
                |(lo, hi, s), &v| (lo.min(v), hi.max(v), s + v as f64),
            )
            .reduce(
                || (f32::INFINITY, f32::NEG_INFINITY, 0.0f64),
                |a, b| (a.0.min(b.0), a.1.max(b.1), a.2 + b.2),
            );

        let n = values.len();
        TensorSummary {
            shape: self.shape().to_vec(),
            dtype: self.dtype(),
            min: if n == 0 { 0.0 } else { min },
            max: if n == 0 { 0.0 } else { max },
            mean: if n == 0 { 0.0 } else { (sum / n as f64) as f32 },
        }
    }
}

impl From<Tensor<u8>> for DynTensor {
    fn from(t: Tensor<u8>) -> Self {
        DynTensor::U8(t)
    }
}

impl From<Tensor<f32>> for DynTensor {
    fn from(t: Tensor<f32>) -> Self {
        DynTensor::F32(t)
    }
}

/// Compact description of a tensor's contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorSummary {
    pub shape: Shape,
    pub dtype: DType,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
}
