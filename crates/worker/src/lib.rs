//! SplitInfer Worker
//!
//! The serialized half of the inference server: tensor layouts and tiling,
//! the codec family, reference-counted model management, and the single
//! processor thread fed by the work distributor.

pub mod codec;
pub mod distributor;
pub mod layout;
pub mod model;
pub mod monitor;
pub mod processor;
pub mod tensor;
pub mod tiling;

pub use codec::{select_postencoder, select_predecoder, DecodePipeline, Postencoder, Predecoder};
pub use distributor::{ConnectionId, Outbound, Request, WorkDistributor, WorkReceiver, WorkSender};
pub use layout::{determine_tile_layout, AxisOrder, TensorLayout, TiledArrayLayout};
pub use model::{FileModelLoader, InferenceModel, LoadedModel, ModelLoader, ModelManager};
pub use monitor::{MonitorEntry, MonitorStats};
pub use processor::Processor;
pub use tensor::{DType, DynTensor, Tensor};
