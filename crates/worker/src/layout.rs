//! Tensor and tiled-grid layouts
//!
//! A [`TiledArrayLayout`] is derived from a [`TensorLayout`] with
//! [`determine_tile_layout`]. Encoder and decoder compute it independently,
//! so the derivation must stay a pure function of the channel count and
//! spatial size.

use crate::tensor::{DType, Shape};
use serde::{Deserialize, Serialize};
use splitinfer_common::{Result, SplitInferError};
use std::fmt;

/// Order of the three tensor axes in memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AxisOrder {
    /// Height, width, channels (channels-last)
    #[default]
    Hwc,
    /// Channels, height, width (channels-first)
    Chw,
}

/// Shape, element type and axis order of a feature map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorLayout {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub dtype: DType,
    #[serde(default)]
    pub order: AxisOrder,
}

impl TensorLayout {
    pub fn new(
        channels: usize,
        height: usize,
        width: usize,
        dtype: DType,
        order: AxisOrder,
    ) -> Result<Self> {
        let layout = Self {
            channels,
            height,
            width,
            dtype,
            order,
        };
        layout.validate()?;
        Ok(layout)
    }

    /// Build a layout from a 3-D shape read in the given axis order
    pub fn from_shape(shape: &[usize], dtype: DType, order: AxisOrder) -> Result<Self> {
        let [a, b, c] = <[usize; 3]>::try_from(shape).map_err(|_| {
            SplitInferError::tensor(format!("expected a 3-D shape, got {:?}", shape))
        })?;
        match order {
            AxisOrder::Hwc => Self::new(c, a, b, dtype, order),
            AxisOrder::Chw => Self::new(a, b, c, dtype, order),
        }
    }

    /// Reject degenerate dimensions
    pub fn validate(&self) -> Result<()> {
        if self.channels == 0 || self.height == 0 || self.width == 0 {
            return Err(SplitInferError::tensor(format!(
                "layout dimensions must be non-zero: {}",
                self
            )));
        }
        Ok(())
    }

    /// Shape in memory order
    pub fn shape(&self) -> Shape {
        match self.order {
            AxisOrder::Hwc => vec![self.height, self.width, self.channels],
            AxisOrder::Chw => vec![self.channels, self.height, self.width],
        }
    }

    pub fn element_count(&self) -> usize {
        self.channels * self.height * self.width
    }

    /// Bytes needed to hold a packed tensor of this layout
    pub fn byte_len(&self) -> usize {
        self.element_count() * self.dtype.size()
    }

    /// Same geometry with a different element type
    pub fn with_dtype(&self, dtype: DType) -> Self {
        Self { dtype, ..*self }
    }

    /// Flat offset of element `(c, y, x)`
    #[inline]
    pub fn index(&self, c: usize, y: usize, x: usize) -> usize {
        match self.order {
            AxisOrder::Hwc => (y * self.width + x) * self.channels + c,
            AxisOrder::Chw => (c * self.height + y) * self.width + x,
        }
    }
}

impl fmt::Display for TensorLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}x{} {} ({:?})",
            self.channels, self.height, self.width, self.dtype, self.order
        )
    }
}

/// Placement of channels on a 2-D grid of `tile_rows x tile_cols` tiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TiledArrayLayout {
    pub tile_rows: usize,
    pub tile_cols: usize,
    pub tile_height: usize,
    pub tile_width: usize,
}

impl TiledArrayLayout {
    /// Height of the whole grid image in pixels
    pub fn grid_height(&self) -> usize {
        self.tile_rows * self.tile_height
    }

    /// Width of the whole grid image in pixels
    pub fn grid_width(&self) -> usize {
        self.tile_cols * self.tile_width
    }

    /// Number of tiles, padding included
    pub fn slots(&self) -> usize {
        self.tile_rows * self.tile_cols
    }

    /// Grid position of channel `k`
    #[inline]
    pub fn tile_of(&self, k: usize) -> (usize, usize) {
        (k / self.tile_cols, k % self.tile_cols)
    }
}

/// Choose the near-square grid for a layout.
///
/// `tile_rows = ceil(sqrt(C))`, `tile_cols = ceil(C / tile_rows)`.
pub fn determine_tile_layout(layout: &TensorLayout) -> TiledArrayLayout {
    let channels = layout.channels.max(1);
    let tile_rows = ceil_sqrt(channels);
    let tile_cols = channels.div_ceil(tile_rows);

    TiledArrayLayout {
        tile_rows,
        tile_cols,
        tile_height: layout.height,
        tile_width: layout.width,
    }
}

/// Smallest `r` with `r * r >= n`
fn ceil_sqrt(n: usize) -> usize {
    let mut r = (n as f64).sqrt() as usize;
    while r * r < n {
        r += 1;
    }
    while r > 1 && (r - 1) * (r - 1) >= n {
        r -= 1;
    }
    r.max(1)
}
