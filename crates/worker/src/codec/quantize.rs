//! Uniform 8-bit quantization
//!
//! `q = clamp(round(x / scale + zero_point), 0, 255)` and
//! `x' = (q - zero_point) * scale`. Both sides must agree on the parameters;
//! they are not sent on the wire.

use crate::tensor::Tensor;
use rayon::prelude::*;
use splitinfer_common::QuantizationParams;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UniformQuantizer {
    scale: f32,
    zero_point: f32,
}

impl UniformQuantizer {
    pub fn new(params: QuantizationParams) -> Self {
        Self {
            scale: params.scale,
            zero_point: params.zero_point,
        }
    }

    pub fn params(&self) -> QuantizationParams {
        QuantizationParams {
            scale: self.scale,
            zero_point: self.zero_point,
        }
    }

    /// Largest reconstruction error for in-range inputs
    pub fn step(&self) -> f32 {
        self.scale
    }

    pub fn quantize(&self, tensor: &Tensor<f32>) -> Tensor<u8> {
        let (scale, zero_point) = (self.scale, self.zero_point);
        let data = tensor
            .data
            .par_iter()
            .map(|&x| {
                let q = (x / scale + zero_point).round();
                if q.is_nan() {
                    0
                } else {
                    q.clamp(0.0, 255.0) as u8
                }
            })
            .collect();

        Tensor {
            data,
            shape: tensor.shape.clone(),
        }
    }

    pub fn dequantize(&self, tensor: &Tensor<u8>) -> Tensor<f32> {
        let (scale, zero_point) = (self.scale, self.zero_point);
        let data = tensor
            .data
            .par_iter()
            .map(|&q| (q as f32 - zero_point) * scale)
            .collect();

        Tensor {
            data,
            shape: tensor.shape.clone(),
        }
    }
}

impl From<QuantizationParams> for UniformQuantizer {
    fn from(params: QuantizationParams) -> Self {
        Self::new(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantize_roundtrip_within_step() {
        let quantizer = UniformQuantizer::new(QuantizationParams {
            scale: 0.05,
            zero_point: 128.0,
        });
        let input = Tensor::new(
            vec![-6.0f32, -1.234, 0.0, 0.51, 3.3, 6.0],
            vec![2, 3],
        )
        .unwrap();

        let q = quantizer.quantize(&input);
        assert_eq!(q.shape, vec![2, 3]);
        assert_eq!(q.data[2], 128);

        let back = quantizer.dequantize(&q);
        for (a, b) in input.data.iter().zip(&back.data) {
            assert!((a - b).abs() <= quantizer.step() / 2.0 + 1e-6, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_quantize_clamps_out_of_range() {
        let quantizer = UniformQuantizer::new(QuantizationParams {
            scale: 1.0,
            zero_point: 0.0,
        });
        let input = Tensor::new(vec![-10.0f32, 1000.0, f32::NAN], vec![3]).unwrap();
        assert_eq!(quantizer.quantize(&input).data, vec![0, 255, 0]);
    }
}
