//! Mapping from `(layer, encoder, postencoder)` to a concrete codec
//!
//! Both functions match the triple exhaustively. Anything not listed is an
//! [`SplitInferError::UnknownCodec`], which ends the connection.

use super::{
    DecodePipeline, ImageCodec, ImageEncoding, JpegRgbPredecoder, Postencoder, Predecoder,
    RgbPredecoder, SimplePredecoder, TiledImagePredecoder, UniformQuantizer,
};
use crate::layout::{determine_tile_layout, TensorLayout};
use crate::tensor::DType;
use splitinfer_common::{QuantizationParams, Result, SplitInferError};
use splitinfer_proto::{
    EncoderKind as E, ModelConfig, PostencoderConfig, PostencoderKind,
    PostencoderKind as P, SplitLayer as L,
};

/// Build the decode path for frames of an acquired model.
///
/// `layout` is the model's input layout; `quantization` applies when the
/// client sends 8-bit quantized features.
pub fn select_predecoder(
    config: &ModelConfig,
    postencoder: PostencoderKind,
    layout: &TensorLayout,
    quantization: QuantizationParams,
) -> Result<DecodePipeline> {
    // Dequantize only when the model actually wants floats
    let dequantize = |pipeline: DecodePipeline| match layout.dtype {
        DType::F32 => pipeline.with_dequantize(UniformQuantizer::new(quantization)),
        DType::U8 => pipeline,
    };
    let wire = layout.with_dtype(DType::U8);

    let pipeline = match (&config.layer, config.encoder, postencoder) {
        (L::Client, E::None, P::None) => DecodePipeline::new(Predecoder::Simple(SimplePredecoder {
            shape: None,
            dtype: DType::F32,
        })),
        (L::Server, E::None, P::None) => {
            require_rgb(layout)?;
            DecodePipeline::new(Predecoder::Rgb(RgbPredecoder { layout: *layout }))
        }
        (L::Server, E::None, P::Jpeg) => {
            require_rgb(layout)?;
            DecodePipeline::new(Predecoder::JpegRgb(JpegRgbPredecoder { layout: *layout }))
        }
        (L::Named(_), E::None, P::None) => DecodePipeline::new(Predecoder::Simple(SimplePredecoder {
            shape: Some(layout.shape()),
            dtype: layout.dtype,
        })),
        (L::Named(_), E::UniformQuantizationU8, P::None) => {
            dequantize(DecodePipeline::new(Predecoder::Simple(SimplePredecoder {
                shape: Some(wire.shape()),
                dtype: DType::U8,
            })))
        }
        (L::Named(_), E::UniformQuantizationU8, kind @ (P::Jpeg | P::Png | P::Jpeg2000)) => {
            dequantize(DecodePipeline::new(Predecoder::TiledImage(TiledImagePredecoder {
                codec: image_codec(kind),
                tiled: determine_tile_layout(&wire),
                layout: wire,
            })))
        }
        (layer, encoder, kind) => {
            return Err(SplitInferError::unknown_codec(
                layer.to_string(),
                encoder.to_string(),
                kind.to_string(),
            ))
        }
    };

    Ok(pipeline)
}

/// Build the encoder a client would use for the same configuration
pub fn select_postencoder(
    config: &ModelConfig,
    postencoder: &PostencoderConfig,
    layout: &TensorLayout,
    quantization: QuantizationParams,
    default_quality: u8,
) -> Result<Postencoder> {
    let quality = postencoder.quality.unwrap_or(default_quality);
    let jpeg = ImageEncoding::Jpeg {
        quality,
        target_bytes: postencoder.target_bytes,
    };
    let quantizer = Some(UniformQuantizer::new(quantization));

    let encoder = match (&config.layer, config.encoder, postencoder.kind) {
        (L::Client | L::Server | L::Named(_), E::None, P::None) => {
            Postencoder::Raw { quantizer: None }
        }
        (L::Server, E::None, P::Jpeg) => {
            require_rgb(layout)?;
            Postencoder::RgbImage {
                layout: *layout,
                encoding: jpeg,
            }
        }
        (L::Named(_), E::UniformQuantizationU8, P::None) => Postencoder::Raw { quantizer },
        (L::Named(_), E::UniformQuantizationU8, kind @ (P::Jpeg | P::Png | P::Jpeg2000)) => {
            Postencoder::Tiled {
                quantizer,
                layout: *layout,
                tiled: determine_tile_layout(layout),
                encoding: match kind {
                    P::Png => ImageEncoding::Png,
                    P::Jpeg2000 => ImageEncoding::Jpeg2000 {
                        target_bytes: postencoder.target_bytes,
                    },
                    _ => jpeg,
                },
            }
        }
        (layer, encoder, kind) => {
            return Err(SplitInferError::unknown_codec(
                layer.to_string(),
                encoder.to_string(),
                kind.to_string(),
            ))
        }
    };

    Ok(encoder)
}

fn image_codec(kind: PostencoderKind) -> ImageCodec {
    match kind {
        P::Png => ImageCodec::Png,
        P::Jpeg2000 => ImageCodec::Jpeg2000,
        _ => ImageCodec::Jpeg,
    }
}

fn require_rgb(layout: &TensorLayout) -> Result<()> {
    if layout.channels != 3 {
        return Err(SplitInferError::model(format!(
            "server-side frames need a 3-channel input layout, model declares {}",
            layout
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::AxisOrder;
    use crate::tensor::{DynTensor, Tensor};
    use splitinfer_proto::{EncoderKind, SplitLayer};

    fn params() -> QuantizationParams {
        QuantizationParams {
            scale: 0.1,
            zero_point: 128.0,
        }
    }

    fn split(encoder: EncoderKind) -> ModelConfig {
        ModelConfig::new("resnet34", SplitLayer::Named("add_3".to_string()), encoder)
    }

    #[test]
    fn test_selection_table() {
        let features = TensorLayout::new(8, 4, 4, DType::F32, AxisOrder::Hwc).unwrap();
        let frame = TensorLayout::new(3, 4, 4, DType::F32, AxisOrder::Hwc).unwrap();
        let server = ModelConfig::new("resnet34", SplitLayer::Server, EncoderKind::None);
        let client = ModelConfig::new("resnet34", SplitLayer::Client, EncoderKind::None);

        let name = |config: &ModelConfig, kind, layout: &TensorLayout| {
            select_predecoder(config, kind, layout, params()).map(|p| p.predecoder.name())
        };

        assert_eq!(name(&client, P::None, &features).unwrap(), "simple");
        assert_eq!(name(&server, P::None, &frame).unwrap(), "rgb");
        assert_eq!(name(&server, P::Jpeg, &frame).unwrap(), "jpeg-rgb");
        assert_eq!(name(&split(E::None), P::None, &features).unwrap(), "simple");
        assert_eq!(name(&split(E::UniformQuantizationU8), P::None, &features).unwrap(), "simple");
        assert_eq!(name(&split(E::UniformQuantizationU8), P::Jpeg, &features).unwrap(), "tiled-jpeg");
        assert_eq!(name(&split(E::UniformQuantizationU8), P::Png, &features).unwrap(), "tiled-png");
        assert_eq!(
            name(&split(E::UniformQuantizationU8), P::Jpeg2000, &features).unwrap(),
            "tiled-jpeg2000"
        );
    }

    #[test]
    fn test_unknown_combinations() {
        let features = TensorLayout::new(8, 4, 4, DType::F32, AxisOrder::Hwc).unwrap();
        let cases = [
            (split(E::None), P::Jpeg),
            (split(E::None), P::Jpeg2000),
            (ModelConfig::new("m", SplitLayer::Server, E::None), P::Jpeg2000),
            (ModelConfig::new("m", SplitLayer::Client, E::UniformQuantizationU8), P::None),
            (ModelConfig::new("m", SplitLayer::Client, E::None), P::Png),
        ];

        for (config, kind) in cases {
            let err = select_predecoder(&config, kind, &features, params()).unwrap_err();
            assert!(
                matches!(err, SplitInferError::UnknownCodec { .. }),
                "{} {:?}",
                config,
                kind
            );
            assert!(err.is_connection_fatal());
        }
    }

    #[test]
    fn test_server_layer_needs_rgb() {
        let server = ModelConfig::new("resnet34", SplitLayer::Server, EncoderKind::None);
        let features = TensorLayout::new(8, 4, 4, DType::F32, AxisOrder::Hwc).unwrap();
        let err = select_predecoder(&server, P::None, &features, params()).unwrap_err();
        assert_eq!(err.kind(), "model");
    }

    #[test]
    fn test_quantized_png_pipeline_roundtrip() {
        let layout = TensorLayout::new(5, 3, 3, DType::F32, AxisOrder::Chw).unwrap();
        let config = split(E::UniformQuantizationU8);
        let postencoder = PostencoderConfig::new(P::Png);

        let data: Vec<f32> = (0..layout.element_count()).map(|i| (i as f32 - 20.0) * 0.1).collect();
        let original = Tensor::new(data, layout.shape()).unwrap();

        let encoder = select_postencoder(&config, &postencoder, &layout, params(), 90).unwrap();
        let bytes = encoder.run(&DynTensor::F32(original.clone())).unwrap();

        let decoder = select_predecoder(&config, postencoder.kind, &layout, params()).unwrap();
        let decoded = decoder.run(&bytes).unwrap();

        let DynTensor::F32(decoded) = decoded else {
            panic!("expected float output");
        };
        assert_eq!(decoded.shape, original.shape);
        for (a, b) in original.data.iter().zip(&decoded.data) {
            assert!((a - b).abs() <= 0.05 + 1e-5, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_quantized_jpeg2000_pipeline() {
        let layout = TensorLayout::new(6, 8, 8, DType::F32, AxisOrder::Hwc).unwrap();
        let config = split(E::UniformQuantizationU8);
        let data: Vec<f32> = (0..layout.element_count()).map(|i| ((i % 37) as f32 - 18.0) * 0.1).collect();
        let original = DynTensor::F32(Tensor::new(data, layout.shape()).unwrap());

        let lossless = PostencoderConfig::new(P::Jpeg2000);
        let encoder = select_postencoder(&config, &lossless, &layout, params(), 90).unwrap();
        let bytes = encoder.run(&original).unwrap();
        let decoded = select_predecoder(&config, P::Jpeg2000, &layout, params())
            .unwrap()
            .run(&bytes)
            .unwrap();
        let (DynTensor::F32(a), DynTensor::F32(b)) = (&original, &decoded) else {
            panic!("expected float tensors");
        };
        for (x, y) in a.data.iter().zip(&b.data) {
            assert!((x - y).abs() <= 0.05 + 1e-5, "{} vs {}", x, y);
        }

        let sized = PostencoderConfig {
            target_bytes: Some(bytes.len() / 3),
            ..PostencoderConfig::new(P::Jpeg2000)
        };
        let smaller = select_postencoder(&config, &sized, &layout, params(), 90)
            .unwrap()
            .run(&original)
            .unwrap();
        assert!(smaller.len() < bytes.len());
    }

    #[test]
    fn test_unquantized_split_is_exact() {
        let layout = TensorLayout::new(2, 2, 2, DType::F32, AxisOrder::Hwc).unwrap();
        let config = split(E::None);
        let postencoder = PostencoderConfig::new(P::None);
        let original = DynTensor::F32(Tensor::new(vec![0.25; 8], layout.shape()).unwrap());

        let bytes = select_postencoder(&config, &postencoder, &layout, params(), 90)
            .unwrap()
            .run(&original)
            .unwrap();
        let decoded = select_predecoder(&config, P::None, &layout, params())
            .unwrap()
            .run(&bytes)
            .unwrap();
        assert_eq!(decoded, original);
    }
}
