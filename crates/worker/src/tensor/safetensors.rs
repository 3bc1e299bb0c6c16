//! SafeTensor format support with memory-mapped files
//!
//! Used to read classifier-head weights shipped next to model descriptors.
//! The file is mapped, not read, so only the pages actually touched are loaded.

use memmap2::Mmap;
use serde::Deserialize;
use splitinfer_common::{Result, SplitInferError};
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

/// Data type for SafeTensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorDType {
    /// Float32
    F32,
    /// Float16
    F16,
    /// UInt8
    U8,
}

impl TensorDType {
    /// Get the size in bytes for this dtype
    pub fn size(&self) -> usize {
        match self {
            TensorDType::F32 => 4,
            TensorDType::F16 => 2,
            TensorDType::U8 => 1,
        }
    }

    /// Parse from the header's dtype string
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "F32" => Some(TensorDType::F32),
            "F16" => Some(TensorDType::F16),
            "U8" => Some(TensorDType::U8),
            _ => None,
        }
    }
}

/// Information about a single tensor
#[derive(Debug, Clone, Deserialize)]
pub struct TensorInfo {
    pub dtype: String,
    pub shape: Vec<usize>,
    pub data_offsets: [usize; 2],
}

/// Memory-mapped SafeTensor buffer
pub struct SafeTensorBuffer {
    /// Memory-mapped file
    mmap: Mmap,

    /// Tensor entries from the header, `__metadata__` excluded
    tensors: HashMap<String, TensorInfo>,

    /// Offset of the data section
    data_start: usize,
}

impl SafeTensorBuffer {
    /// Open a SafeTensor file with memory mapping
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = File::open(path).map_err(|e| {
            SplitInferError::MemoryMap(format!("Failed to open file {}: {}", path.display(), e))
        })?;

        // SAFETY: the mapping is read-only and the buffer owns it for its whole lifetime
        let mmap = unsafe {
            Mmap::map(&file).map_err(|e| {
                SplitInferError::MemoryMap(format!("Failed to mmap file {}: {}", path.display(), e))
            })?
        };

        if mmap.len() < 8 {
            return Err(SplitInferError::MemoryMap(
                "File too small to contain header".to_string(),
            ));
        }

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&mmap[..8]);
        let header_len = u64::from_le_bytes(len_bytes) as usize;

        let data_start = 8usize
            .checked_add(header_len)
            .filter(|&end| end <= mmap.len())
            .ok_or_else(|| {
                SplitInferError::MemoryMap(
                    "File truncated: header length exceeds file size".to_string(),
                )
            })?;

        let mut raw: HashMap<String, serde_json::Value> = serde_json::from_slice(&mmap[8..data_start])
            .map_err(|e| SplitInferError::MemoryMap(format!("Failed to parse header JSON: {}", e)))?;
        raw.remove("__metadata__");

        let mut tensors = HashMap::with_capacity(raw.len());
        for (name, value) in raw {
            let info: TensorInfo = serde_json::from_value(value).map_err(|e| {
                SplitInferError::MemoryMap(format!("Bad header entry for {}: {}", name, e))
            })?;
            tensors.insert(name, info);
        }

        Ok(Self {
            mmap,
            tensors,
            data_start,
        })
    }

    /// Get tensor names
    pub fn tensor_names(&self) -> impl Iterator<Item = &String> {
        self.tensors.keys()
    }

    /// Get a zero-copy view of a tensor
    pub fn get_tensor(&self, name: &str) -> Option<SafeTensorView<'_>> {
        let info = self.tensors.get(name)?;
        let dtype = TensorDType::parse(&info.dtype)?;

        let start = self.data_start.checked_add(info.data_offsets[0])?;
        let end = self.data_start.checked_add(info.data_offsets[1])?;
        if start > end || end > self.mmap.len() {
            return None;
        }

        let elements: usize = info.shape.iter().product();
        if elements * dtype.size() != end - start {
            return None;
        }

        Some(SafeTensorView {
            data: &self.mmap[start..end],
            shape: info.shape.clone(),
            dtype,
        })
    }
}

/// Zero-copy view into a SafeTensor
pub struct SafeTensorView<'a> {
    data: &'a [u8],
    shape: Vec<usize>,
    dtype: TensorDType,
}

impl<'a> SafeTensorView<'a> {
    /// Get the tensor shape
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Get the tensor dtype
    pub fn dtype(&self) -> TensorDType {
        self.dtype
    }

    /// Get the number of elements
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    /// Check if the tensor is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the elements out, widened to `f32`
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self.dtype {
            TensorDType::F32 => self
                .data
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
            TensorDType::F16 => self
                .data
                .chunks_exact(2)
                .map(|b| half::f16::from_le_bytes([b[0], b[1]]).to_f32())
                .collect(),
            TensorDType::U8 => self.data.iter().map(|&b| b as f32).collect(),
        }
    }
}

/// Serialize named `f32` tensors into SafeTensor bytes
pub fn serialize_f32(tensors: &[(&str, &[usize], &[f32])]) -> Result<Vec<u8>> {
    let mut header = serde_json::Map::new();
    let mut data = Vec::new();

    for (name, shape, values) in tensors {
        let start = data.len();
        for v in values.iter() {
            data.extend_from_slice(&v.to_le_bytes());
        }
        header.insert(
            name.to_string(),
            serde_json::json!({
                "dtype": "F32",
                "shape": shape,
                "data_offsets": [start, data.len()],
            }),
        );
    }

    let header = serde_json::to_vec(&header)?;
    let mut out = Vec::with_capacity(8 + header.len() + data.len());
    out.extend_from_slice(&(header.len() as u64).to_le_bytes());
    out.extend_from_slice(&header);
    out.extend_from_slice(&data);
    Ok(out)
}
