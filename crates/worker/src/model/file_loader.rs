//! Descriptor-driven model loader
//!
//! Each split point is described by `<root>/<model>/<layer>&<encoder>.json`:
//!
//! ```json
//! {
//!   "input": {"channels": 128, "height": 28, "width": 28, "dtype": "float32", "order": "hwc"},
//!   "quantization": {"scale": 0.03137, "zero_point": 127.5},
//!   "labels": [{"name": "n01440764", "description": "tench"}],
//!   "top_k": 5,
//!   "weights": "head.safetensors"
//! }
//! ```
//!
//! The server half is a classifier head: global average pooling over the
//! spatial axes, an optional linear layer (`head.weight [labels, in]`,
//! `head.bias [labels]`), softmax and top-k. When the client ran the whole
//! network (`layer == "client"`) the payload already holds logits and no
//! pooling is done.

use super::{InferenceModel, LoadedModel, ModelLoader, RawOutput};
use crate::layout::TensorLayout;
use crate::tensor::{DynTensor, SafeTensorBuffer, Tensor};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use splitinfer_common::{QuantizationParams, Result, SplitInferError};
use splitinfer_proto::{ModelConfig, Prediction, SplitLayer};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

fn default_top_k() -> usize {
    5
}

/// One output class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ModelDescriptor {
    input: TensorLayout,
    #[serde(default)]
    quantization: Option<QuantizationParams>,
    labels: Vec<Label>,
    #[serde(default = "default_top_k")]
    top_k: usize,
    #[serde(default)]
    weights: Option<PathBuf>,
}

/// Loads classifier heads from a directory of descriptors
#[derive(Debug, Clone)]
pub struct FileModelLoader {
    root: PathBuf,
}

impl FileModelLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path of the descriptor for `config`
    pub fn descriptor_path(&self, config: &ModelConfig) -> Result<PathBuf> {
        let model = checked_component(&config.model)?;
        let layer_name = config.layer.to_string();
        let layer = checked_component(&layer_name)?;
        Ok(self
            .root
            .join(model)
            .join(format!("{}&{}.json", layer, config.encoder)))
    }
}

/// Reject names that would escape the model root
fn checked_component(name: &str) -> Result<&str> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(SplitInferError::model(format!("invalid model path component {:?}", name)));
    }
    Ok(name)
}

impl ModelLoader for FileModelLoader {
    fn load(&self, config: &ModelConfig) -> Result<LoadedModel> {
        let path = self.descriptor_path(config)?;
        let text = std::fs::read_to_string(&path).map_err(|e| {
            SplitInferError::model(format!("cannot read descriptor {}: {}", path.display(), e))
        })?;
        let descriptor: ModelDescriptor = serde_json::from_str(&text).map_err(|e| {
            SplitInferError::model(format!("bad descriptor {}: {}", path.display(), e))
        })?;
        descriptor.input.validate()?;

        let base = path.parent().unwrap_or(&self.root);
        let head = ClassifierHead::from_descriptor(&descriptor, &config.layer, base)?;
        info!(
            "Classifier head for {}: {} labels, top {}{}",
            config,
            head.labels.len(),
            head.top_k,
            if head.linear.is_some() { ", linear" } else { "" }
        );

        Ok(LoadedModel {
            input_layout: descriptor.input,
            quantization: descriptor.quantization,
            model: Box::new(head),
        })
    }
}

#[derive(Debug, Clone)]
struct Linear {
    in_features: usize,
    weight: Vec<f32>,
    bias: Vec<f32>,
}

impl Linear {
    fn load(path: &Path, in_features: usize, out_features: usize) -> Result<Self> {
        debug!("Mapping head weights from {}", path.display());
        let buffer = SafeTensorBuffer::open(path)
            .map_err(|e| SplitInferError::model(format!("Failed to load weights: {}", e)))?;

        let weight = buffer
            .get_tensor("head.weight")
            .ok_or_else(|| SplitInferError::model("weights file lacks head.weight"))?;
        if weight.shape() != [out_features, in_features] {
            return Err(SplitInferError::model(format!(
                "head.weight has shape {:?}, expected [{}, {}]",
                weight.shape(),
                out_features,
                in_features
            )));
        }

        let bias = match buffer.get_tensor("head.bias") {
            Some(bias) if bias.shape() == [out_features] => bias.to_f32_vec(),
            Some(bias) => {
                return Err(SplitInferError::model(format!(
                    "head.bias has shape {:?}, expected [{}]",
                    bias.shape(),
                    out_features
                )))
            }
            None => vec![0.0; out_features],
        };

        Ok(Self {
            in_features,
            weight: weight.to_f32_vec(),
            bias,
        })
    }

    fn forward(&self, features: &[f32]) -> Vec<f32> {
        self.weight
            .par_chunks_exact(self.in_features)
            .zip(self.bias.par_iter())
            .map(|(row, b)| row.iter().zip(features).map(|(w, x)| w * x).sum::<f32>() + b)
            .collect()
    }
}

/// Pooling + linear + softmax classifier
#[derive(Debug, Clone)]
pub struct ClassifierHead {
    layout: TensorLayout,
    pool: bool,
    linear: Option<Linear>,
    labels: Vec<Label>,
    top_k: usize,
}

impl ClassifierHead {
    fn from_descriptor(
        descriptor: &ModelDescriptor,
        layer: &SplitLayer,
        base: &Path,
    ) -> Result<Self> {
        let layout = descriptor.input;
        let pool = *layer != SplitLayer::Client;
        let in_features = if pool {
            layout.channels
        } else {
            layout.element_count()
        };

        let linear = match &descriptor.weights {
            Some(file) => Some(Linear::load(&base.join(file), in_features, descriptor.labels.len())?),
            None => None,
        };

        Self::new(layout, pool, linear, descriptor.labels.clone(), descriptor.top_k)
    }

    fn new(
        layout: TensorLayout,
        pool: bool,
        linear: Option<Linear>,
        labels: Vec<Label>,
        top_k: usize,
    ) -> Result<Self> {
        if labels.is_empty() {
            return Err(SplitInferError::model("descriptor declares no labels"));
        }
        let features = if pool {
            layout.channels
        } else {
            layout.element_count()
        };
        if linear.is_none() && features != labels.len() {
            return Err(SplitInferError::model(format!(
                "{} input features but {} labels and no weights",
                features,
                labels.len()
            )));
        }

        Ok(Self {
            layout,
            pool,
            linear,
            labels,
            top_k: top_k.max(1),
        })
    }

    /// Head without a linear layer: pooled channels (or raw logits) are the scores
    pub fn passthrough(layout: TensorLayout, pool: bool, labels: Vec<Label>, top_k: usize) -> Result<Self> {
        Self::new(layout, pool, None, labels, top_k)
    }

    fn global_average_pool(&self, input: &Tensor<f32>) -> Result<Vec<f32>> {
        let layout = &self.layout;
        if input.shape != layout.shape() {
            return Err(SplitInferError::tensor(format!(
                "input shape {:?} does not match model layout {}",
                input.shape, layout
            )));
        }

        let area = (layout.height * layout.width) as f32;
        Ok((0..layout.channels)
            .into_par_iter()
            .map(|c| {
                let mut sum = 0.0f32;
                for y in 0..layout.height {
                    for x in 0..layout.width {
                        sum += input.data[layout.index(c, y, x)];
                    }
                }
                sum / area
            })
            .collect())
    }
}

impl InferenceModel for ClassifierHead {
    fn predict(&self, input: &DynTensor) -> Result<RawOutput> {
        let input = input.to_f32();
        let features = if self.pool {
            self.global_average_pool(&input)?
        } else {
            input.data.clone()
        };

        let logits = match &self.linear {
            Some(linear) => {
                if features.len() != linear.in_features {
                    return Err(SplitInferError::tensor(format!(
                        "head expects {} features, got {}",
                        linear.in_features,
                        features.len()
                    )));
                }
                linear.forward(&features)
            }
            None => features,
        };

        if logits.len() != self.labels.len() {
            return Err(SplitInferError::tensor(format!(
                "{} logits for {} labels",
                logits.len(),
                self.labels.len()
            )));
        }
        let n = logits.len();
        Tensor::new(logits, vec![n])
    }

    fn decode_predictions(&self, output: &RawOutput) -> Result<Vec<Prediction>> {
        if output.len() != self.labels.len() {
            return Err(SplitInferError::tensor(format!(
                "{} logits for {} labels",
                output.len(),
                self.labels.len()
            )));
        }

        let scores = softmax(&output.data);
        let mut ranked: Vec<usize> = (0..scores.len()).collect();
        ranked.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

        Ok(ranked
            .into_iter()
            .take(self.top_k)
            .map(|i| Prediction {
                name: self.labels[i].name.clone(),
                description: self.labels[i].description.clone(),
                score: scores[i],
            })
            .collect())
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}
