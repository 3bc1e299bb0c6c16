//! Split-model loading and lifetime management
//!
//! Building the actual network halves is left to a [`ModelLoader`]. The
//! [`ModelManager`] reference-counts what the loader hands back so a model
//! shared by several connections is loaded once and evicted with its last
//! user.

pub mod file_loader;
pub mod manager;

pub use file_loader::{ClassifierHead, FileModelLoader, Label};
pub use manager::ModelManager;

use crate::layout::TensorLayout;
use crate::tensor::{DynTensor, Tensor};
use splitinfer_common::{QuantizationParams, Result};
use splitinfer_proto::{ModelConfig, Prediction};

/// Unnormalized model output (logits)
pub type RawOutput = Tensor<f32>;

/// The server half of a split model
pub trait InferenceModel: Send {
    /// Run the remaining layers on a decoded input tensor
    fn predict(&self, input: &DynTensor) -> Result<RawOutput>;

    /// Turn raw output into labeled, scored predictions
    fn decode_predictions(&self, output: &RawOutput) -> Result<Vec<Prediction>>;
}

/// Everything the processor needs from a loaded model
pub struct LoadedModel {
    /// Shape and dtype of the tensor the server half consumes
    pub input_layout: TensorLayout,

    /// Quantization the client applies before sending, if declared
    pub quantization: Option<QuantizationParams>,

    pub model: Box<dyn InferenceModel>,
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("input_layout", &self.input_layout)
            .field("quantization", &self.quantization)
            .finish_non_exhaustive()
    }
}

/// Source of split models, keyed by configuration
pub trait ModelLoader: Send {
    fn load(&self, config: &ModelConfig) -> Result<LoadedModel>;
}
