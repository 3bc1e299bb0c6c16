//! Predecoders: received bytes -> tensor

use super::{from_hwc, ImageCodec, UniformQuantizer};
use crate::layout::{TensorLayout, TiledArrayLayout};
use crate::tensor::{DType, DynTensor, Shape, Tensor};
use crate::tiling::detile;
use splitinfer_common::{Result, SplitInferError};
use tracing::trace;

/// Packed little-endian buffer of a known shape and dtype
#[derive(Debug, Clone, PartialEq)]
pub struct SimplePredecoder {
    /// `None` accepts any whole number of elements as a flat vector
    pub shape: Option<Shape>,
    pub dtype: DType,
}

impl SimplePredecoder {
    pub fn run(&self, bytes: &[u8]) -> Result<DynTensor> {
        let shape = match &self.shape {
            Some(shape) => shape.clone(),
            None => {
                if bytes.len() % self.dtype.size() != 0 {
                    return Err(SplitInferError::codec(format!(
                        "{} bytes is not a whole number of {} elements",
                        bytes.len(),
                        self.dtype
                    )));
                }
                vec![bytes.len() / self.dtype.size()]
            }
        };
        DynTensor::from_le_bytes(bytes, shape, self.dtype)
    }
}

/// Raw interleaved 8-bit RGB frame
#[derive(Debug, Clone, PartialEq)]
pub struct RgbPredecoder {
    pub layout: TensorLayout,
}

impl RgbPredecoder {
    pub fn run(&self, bytes: &[u8]) -> Result<DynTensor> {
        let tensor = from_hwc(bytes.to_vec(), &self.layout)?;
        Ok(DynTensor::from_u8(tensor, self.layout.dtype))
    }
}

/// Grayscale image holding a tiled feature map
#[derive(Debug, Clone, PartialEq)]
pub struct TiledImagePredecoder {
    pub codec: ImageCodec,
    pub tiled: TiledArrayLayout,
    /// Layout of the transmitted (8-bit) tensor
    pub layout: TensorLayout,
}

impl TiledImagePredecoder {
    pub fn run(&self, bytes: &[u8]) -> Result<DynTensor> {
        let (width, height, pixels) = self.codec.decode_luma(bytes)?;
        if (height, width) != (self.tiled.grid_height(), self.tiled.grid_width()) {
            return Err(SplitInferError::codec(format!(
                "decoded {}x{} image, expected {}x{} grid",
                height,
                width,
                self.tiled.grid_height(),
                self.tiled.grid_width()
            )));
        }
        trace!("Decoded {} grid {}x{}", self.codec.name(), height, width);

        let grid = Tensor::new(pixels, vec![height, width])?;
        let tensor = detile(&grid, &self.tiled, &self.layout)?;
        Ok(DynTensor::from_u8(tensor, self.layout.dtype))
    }
}

/// JPEG-compressed RGB frame, no tiling
#[derive(Debug, Clone, PartialEq)]
pub struct JpegRgbPredecoder {
    pub layout: TensorLayout,
}

impl JpegRgbPredecoder {
    pub fn run(&self, bytes: &[u8]) -> Result<DynTensor> {
        let image = image::load_from_memory_with_format(bytes, image::ImageFormat::Jpeg)
            .map_err(|e| SplitInferError::codec(format!("jpeg decode failed: {}", e)))?
            .to_rgb8();

        let (width, height) = (image.width() as usize, image.height() as usize);
        if (height, width) != (self.layout.height, self.layout.width) {
            return Err(SplitInferError::codec(format!(
                "decoded {}x{} frame, model expects {}x{}",
                height, width, self.layout.height, self.layout.width
            )));
        }

        let tensor = from_hwc(image.into_raw(), &self.layout)?;
        Ok(DynTensor::from_u8(tensor, self.layout.dtype))
    }
}

/// Closed set of predecoders
#[derive(Debug, Clone, PartialEq)]
pub enum Predecoder {
    Simple(SimplePredecoder),
    Rgb(RgbPredecoder),
    TiledImage(TiledImagePredecoder),
    JpegRgb(JpegRgbPredecoder),
}

impl Predecoder {
    pub fn run(&self, bytes: &[u8]) -> Result<DynTensor> {
        match self {
            Predecoder::Simple(p) => p.run(bytes),
            Predecoder::Rgb(p) => p.run(bytes),
            Predecoder::TiledImage(p) => p.run(bytes),
            Predecoder::JpegRgb(p) => p.run(bytes),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Predecoder::Simple(_) => "simple",
            Predecoder::Rgb(_) => "rgb",
            Predecoder::TiledImage(p) => match p.codec {
                ImageCodec::Jpeg => "tiled-jpeg",
                ImageCodec::Png => "tiled-png",
                ImageCodec::Jpeg2000 => "tiled-jpeg2000",
            },
            Predecoder::JpegRgb(_) => "jpeg-rgb",
        }
    }
}

/// A predecoder, optionally followed by dequantization to `f32`
#[derive(Debug, Clone, PartialEq)]
pub struct DecodePipeline {
    pub predecoder: Predecoder,
    pub dequantize: Option<UniformQuantizer>,
}

impl DecodePipeline {
    pub fn new(predecoder: Predecoder) -> Self {
        Self {
            predecoder,
            dequantize: None,
        }
    }

    pub fn with_dequantize(mut self, quantizer: UniformQuantizer) -> Self {
        self.dequantize = Some(quantizer);
        self
    }

    pub fn run(&self, bytes: &[u8]) -> Result<DynTensor> {
        let tensor = self.predecoder.run(bytes)?;
        match (&self.dequantize, tensor) {
            (None, tensor) => Ok(tensor),
            (Some(q), DynTensor::U8(t)) => Ok(DynTensor::F32(q.dequantize(&t))),
            (Some(_), other) => Err(SplitInferError::codec(format!(
                "dequantization expects uint8 input, got {}",
                other.dtype()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::AxisOrder;

    #[test]
    fn test_simple_checks_length() {
        let predecoder = SimplePredecoder {
            shape: Some(vec![2, 2, 3]),
            dtype: DType::U8,
        };
        assert_eq!(predecoder.run(&[7u8; 12]).unwrap().shape(), &[2, 2, 3]);
        assert_eq!(predecoder.run(&[7u8; 11]).unwrap_err().kind(), "codec");
    }

    #[test]
    fn test_simple_flat_f32() {
        let predecoder = SimplePredecoder {
            shape: None,
            dtype: DType::F32,
        };
        let bytes: Vec<u8> = [0.5f32, 1.5, -2.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let tensor = predecoder.run(&bytes).unwrap();
        assert_eq!(tensor, DynTensor::F32(Tensor::new(vec![0.5, 1.5, -2.0], vec![3]).unwrap()));

        assert!(predecoder.run(&bytes[..5]).is_err());
    }

    #[test]
    fn test_rgb_upcasts_to_layout_dtype() {
        let layout = TensorLayout::new(3, 1, 2, DType::F32, AxisOrder::Hwc).unwrap();
        let tensor = RgbPredecoder { layout }.run(&[0, 128, 255, 1, 2, 3]).unwrap();
        assert_eq!(tensor.dtype(), DType::F32);
        assert_eq!(tensor.shape(), &[1, 2, 3]);
        assert_eq!(tensor.to_f32().data, vec![0.0, 128.0, 255.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_corrupt_image_is_codec_error() {
        let layout = TensorLayout::new(4, 2, 2, DType::U8, AxisOrder::Hwc).unwrap();
        let predecoder = TiledImagePredecoder {
            codec: ImageCodec::Png,
            tiled: crate::layout::determine_tile_layout(&layout),
            layout,
        };
        let err = predecoder.run(b"definitely not a png").unwrap_err();
        assert_eq!(err.kind(), "codec");
        assert!(!err.is_connection_fatal());
    }

    #[test]
    fn test_pipeline_dequantizes() {
        let pipeline = DecodePipeline::new(Predecoder::Simple(SimplePredecoder {
            shape: Some(vec![2]),
            dtype: DType::U8,
        }))
        .with_dequantize(UniformQuantizer::new(splitinfer_common::QuantizationParams {
            scale: 0.5,
            zero_point: 10.0,
        }));

        let tensor = pipeline.run(&[10, 14]).unwrap();
        assert_eq!(tensor, DynTensor::F32(Tensor::new(vec![0.0, 2.0], vec![2]).unwrap()));
    }
}
