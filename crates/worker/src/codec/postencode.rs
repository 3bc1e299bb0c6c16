//! Postencoders: tensor -> bytes to send
//!
//! The mirror image of the predecoders. Float tensors are quantized to 8 bits
//! first where the scheme needs it, then tiled and pushed through an image
//! encoder.

use super::{jpeg2000, to_hwc, ImageCodec, UniformQuantizer};
use crate::layout::{TensorLayout, TiledArrayLayout};
use crate::tensor::{DynTensor, Tensor};
use crate::tiling::tile;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};
use splitinfer_common::{Result, SplitInferError};
use std::borrow::Cow;
use tracing::debug;

/// Image encoder settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageEncoding {
    /// JPEG at a fixed quality, or the best quality that fits `target_bytes`
    Jpeg {
        quality: u8,
        target_bytes: Option<usize>,
    },
    Png,
    /// Grayscale only; lossless unless `target_bytes` asks for a ratio
    Jpeg2000 { target_bytes: Option<usize> },
}

impl ImageEncoding {
    pub fn codec(&self) -> ImageCodec {
        match self {
            ImageEncoding::Jpeg { .. } => ImageCodec::Jpeg,
            ImageEncoding::Png => ImageCodec::Png,
            ImageEncoding::Jpeg2000 { .. } => ImageCodec::Jpeg2000,
        }
    }

    /// Encode an 8-bit image of `color` channels
    pub fn encode(
        &self,
        pixels: &[u8],
        width: usize,
        height: usize,
        color: ExtendedColorType,
    ) -> Result<Vec<u8>> {
        match *self {
            ImageEncoding::Png => {
                let (width, height) = image_dims(width, height)?;
                let mut out = Vec::new();
                PngEncoder::new(&mut out)
                    .write_image(pixels, width, height, color)
                    .map_err(|e| SplitInferError::codec(format!("png encode failed: {}", e)))?;
                Ok(out)
            }
            ImageEncoding::Jpeg {
                quality,
                target_bytes,
            } => {
                let (width, height) = image_dims(width, height)?;
                match target_bytes {
                    None => encode_jpeg(pixels, width, height, color, quality),
                    Some(target) => encode_jpeg_to_size(pixels, width, height, color, target),
                }
            }
            ImageEncoding::Jpeg2000 { target_bytes } => {
                if color != ExtendedColorType::L8 {
                    return Err(SplitInferError::codec(format!(
                        "jpeg2000 encodes grayscale only, got {:?}",
                        color
                    )));
                }
                jpeg2000::encode_gray(pixels, width, height, target_bytes)
            }
        }
    }
}

fn image_dims(width: usize, height: usize) -> Result<(u32, u32)> {
    match (u32::try_from(width), u32::try_from(height)) {
        (Ok(w), Ok(h)) => Ok((w, h)),
        _ => Err(SplitInferError::codec(format!(
            "image of {}x{} is too large to encode",
            height, width
        ))),
    }
}

fn encode_jpeg(
    pixels: &[u8],
    width: u32,
    height: u32,
    color: ExtendedColorType,
    quality: u8,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .write_image(pixels, width, height, color)
        .map_err(|e| SplitInferError::codec(format!("jpeg encode failed: {}", e)))?;
    Ok(out)
}

/// Binary search for the highest quality whose output fits `target` bytes.
/// Falls back to quality 1 when nothing fits.
fn encode_jpeg_to_size(
    pixels: &[u8],
    width: u32,
    height: u32,
    color: ExtendedColorType,
    target: usize,
) -> Result<Vec<u8>> {
    let (mut lo, mut hi) = (1u8, 100u8);
    let mut best: Option<(u8, Vec<u8>)> = None;

    while lo <= hi {
        let mid = lo + (hi - lo) / 2;
        let out = encode_jpeg(pixels, width, height, color, mid)?;
        if out.len() <= target {
            best = Some((mid, out));
            lo = mid + 1;
        } else if mid == 1 {
            break;
        } else {
            hi = mid - 1;
        }
    }

    match best {
        Some((quality, out)) => {
            debug!("Rate control picked quality {} ({} <= {} bytes)", quality, out.len(), target);
            Ok(out)
        }
        None => {
            debug!("Rate control cannot reach {} bytes, using quality 1", target);
            encode_jpeg(pixels, width, height, color, 1)
        }
    }
}

/// Closed set of postencoders
#[derive(Debug, Clone, PartialEq)]
pub enum Postencoder {
    /// Packed little-endian bytes, quantized first when a quantizer is set
    Raw { quantizer: Option<UniformQuantizer> },

    /// Quantize, tile into a grayscale grid, encode as an image
    Tiled {
        quantizer: Option<UniformQuantizer>,
        layout: TensorLayout,
        tiled: TiledArrayLayout,
        encoding: ImageEncoding,
    },

    /// Encode a 3-channel frame directly as an RGB image
    RgbImage {
        layout: TensorLayout,
        encoding: ImageEncoding,
    },
}

impl Postencoder {
    pub fn run(&self, tensor: &DynTensor) -> Result<Vec<u8>> {
        match self {
            Postencoder::Raw { quantizer: None } => Ok(tensor.to_le_bytes()),
            Postencoder::Raw {
                quantizer: Some(q),
            } => Ok(as_u8(tensor, Some(q))?.to_le_bytes()),
            Postencoder::Tiled {
                quantizer,
                layout,
                tiled,
                encoding,
            } => {
                let values = as_u8(tensor, quantizer.as_ref())?;
                let grid = tile(&*values, layout, tiled, 0)?;
                encoding.encode(
                    &grid.data,
                    tiled.grid_width(),
                    tiled.grid_height(),
                    ExtendedColorType::L8,
                )
            }
            Postencoder::RgbImage { layout, encoding } => {
                if layout.channels != 3 {
                    return Err(SplitInferError::codec(format!(
                        "rgb image needs 3 channels, layout is {}",
                        layout
                    )));
                }
                let pixels: Cow<'_, Tensor<u8>> = match tensor {
                    DynTensor::U8(t) => Cow::Borrowed(t),
                    DynTensor::F32(t) => Cow::Owned(t.cast()),
                };
                if pixels.shape != layout.shape() {
                    return Err(SplitInferError::tensor(format!(
                        "tensor shape {:?} does not match layout {}",
                        pixels.shape, layout
                    )));
                }
                encoding.encode(
                    &to_hwc(&*pixels, layout),
                    layout.width,
                    layout.height,
                    ExtendedColorType::Rgb8,
                )
            }
        }
    }
}

fn as_u8<'a>(tensor: &'a DynTensor, quantizer: Option<&UniformQuantizer>) -> Result<Cow<'a, Tensor<u8>>> {
    match (tensor, quantizer) {
        (DynTensor::U8(t), _) => Ok(Cow::Borrowed(t)),
        (DynTensor::F32(t), Some(q)) => Ok(Cow::Owned(q.quantize(t))),
        (DynTensor::F32(_), None) => Err(SplitInferError::codec(
            "float tensor needs a quantizer before 8-bit encoding",
        )),
    }
}
