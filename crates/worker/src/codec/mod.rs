//! Codec family: bytes <-> tensors
//!
//! Predecoders turn a received payload into the tensor the model expects.
//! Postencoders do the reverse for the sending side. Which variant applies is
//! decided by [`select_predecoder`] / [`select_postencoder`] from the
//! `(layer, encoder, postencoder)` triple.

pub mod jpeg2000;
pub mod postencode;
pub mod predecode;
pub mod quantize;
pub mod select;

pub use postencode::{ImageEncoding, Postencoder};
pub use predecode::{
    DecodePipeline, JpegRgbPredecoder, Predecoder, RgbPredecoder, SimplePredecoder,
    TiledImagePredecoder,
};
pub use quantize::UniformQuantizer;
pub use select::{select_postencoder, select_predecoder};

use crate::layout::{AxisOrder, TensorLayout};
use crate::tensor::Tensor;
use image::ImageFormat;
use splitinfer_common::{Result, SplitInferError};

/// Image container used to carry a tiled or RGB tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageCodec {
    Jpeg,
    Png,
    Jpeg2000,
}

impl ImageCodec {
    pub fn name(&self) -> &'static str {
        match self {
            ImageCodec::Jpeg => "jpeg",
            ImageCodec::Png => "png",
            ImageCodec::Jpeg2000 => "jpeg2000",
        }
    }

    /// Decode to 8-bit grayscale as `(width, height, pixels)`
    pub fn decode_luma(&self, bytes: &[u8]) -> Result<(usize, usize, Vec<u8>)> {
        let format = match self {
            ImageCodec::Jpeg => ImageFormat::Jpeg,
            ImageCodec::Png => ImageFormat::Png,
            ImageCodec::Jpeg2000 => return jpeg2000::decode_gray(bytes),
        };

        let image = image::load_from_memory_with_format(bytes, format)
            .map_err(|e| SplitInferError::codec(format!("{} decode failed: {}", self.name(), e)))?
            .to_luma8();
        Ok((image.width() as usize, image.height() as usize, image.into_raw()))
    }
}

/// Rearrange interleaved RGB pixels into `layout`'s axis order
pub(crate) fn from_hwc(pixels: Vec<u8>, layout: &TensorLayout) -> Result<Tensor<u8>> {
    if pixels.len() != layout.element_count() {
        return Err(SplitInferError::codec(format!(
            "expected {} pixel bytes for {}, got {}",
            layout.element_count(),
            layout,
            pixels.len()
        )));
    }

    match layout.order {
        AxisOrder::Hwc => Tensor::new(pixels, layout.shape()),
        AxisOrder::Chw => {
            let mut data = vec![0u8; pixels.len()];
            for (i, &v) in pixels.iter().enumerate() {
                let c = i % layout.channels;
                let x = (i / layout.channels) % layout.width;
                let y = i / (layout.channels * layout.width);
                data[layout.index(c, y, x)] = v;
            }
            Tensor::new(data, layout.shape())
        }
    }
}

/// Interleave a tensor in `layout`'s axis order into RGB pixel order
pub(crate) fn to_hwc(tensor: &Tensor<u8>, layout: &TensorLayout) -> Vec<u8> {
    match layout.order {
        AxisOrder::Hwc => tensor.data.clone(),
        AxisOrder::Chw => {
            let mut pixels = Vec::with_capacity(tensor.len());
            for y in 0..layout.height {
                for x in 0..layout.width {
                    for c in 0..layout.channels {
                        pixels.push(tensor.data[layout.index(c, y, x)]);
                    }
                }
            }
            pixels
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DType;

    #[test]
    fn test_hwc_reorder_roundtrip() {
        let layout = TensorLayout::new(3, 2, 2, DType::U8, AxisOrder::Chw).unwrap();
        let pixels: Vec<u8> = (0..12).collect();

        let tensor = from_hwc(pixels.clone(), &layout).unwrap();
        // red plane first
        assert_eq!(&tensor.data[..4], &[0, 3, 6, 9]);
        assert_eq!(to_hwc(&tensor, &layout), pixels);
    }
}
