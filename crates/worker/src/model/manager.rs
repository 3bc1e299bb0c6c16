//! Reference-counted model cache
//!
//! Only the processor thread touches the manager, so it takes `&mut self`
//! and holds no locks.

use super::{LoadedModel, ModelLoader, RawOutput};
use crate::layout::TensorLayout;
use crate::tensor::DynTensor;
use splitinfer_common::{ModelStateError, QuantizationParams, Result, METRICS};
use splitinfer_proto::{ModelConfig, Prediction};
use std::collections::HashMap;
use tracing::{debug, info};

struct Entry {
    refcount: usize,
    loaded: LoadedModel,
}

pub struct ModelManager {
    loader: Box<dyn ModelLoader>,
    entries: HashMap<ModelConfig, Entry>,
}

impl ModelManager {
    pub fn new(loader: Box<dyn ModelLoader>) -> Self {
        Self {
            loader,
            entries: HashMap::new(),
        }
    }

    /// Take a reference on `config`, loading it on first use.
    ///
    /// A failed load leaves no entry behind.
    pub fn acquire(&mut self, config: &ModelConfig) -> Result<()> {
        if let Some(entry) = self.entries.get_mut(config) {
            entry.refcount += 1;
            debug!("Acquired {} (refcount {})", config, entry.refcount);
            return Ok(());
        }

        info!("Loading model {}", config);
        let loaded = self.loader.load(config)?;
        info!("Loaded model {} with input {}", config, loaded.input_layout);

        self.entries.insert(config.clone(), Entry { refcount: 1, loaded });
        self.update_gauge();
        Ok(())
    }

    /// Drop a reference on `config`, evicting it when none remain
    pub fn release(&mut self, config: &ModelConfig) -> Result<()> {
        let entry = self
            .entries
            .get_mut(config)
            .ok_or(ModelStateError::NotAcquired)?;

        entry.refcount -= 1;
        if entry.refcount == 0 {
            self.entries.remove(config);
            info!("Evicted model {}", config);
            self.update_gauge();
        } else {
            debug!("Released {} (refcount {})", config, entry.refcount);
        }
        Ok(())
    }

    pub fn refcount(&self, config: &ModelConfig) -> usize {
        self.entries.get(config).map_or(0, |e| e.refcount)
    }

    pub fn is_loaded(&self, config: &ModelConfig) -> bool {
        self.entries.contains_key(config)
    }

    pub fn loaded_count(&self) -> usize {
        self.entries.len()
    }

    pub fn input_tensor_layout(&self, config: &ModelConfig) -> Result<TensorLayout> {
        Ok(self.get(config)?.input_layout)
    }

    /// Quantization declared by the model, if any
    pub fn quantization(&self, config: &ModelConfig) -> Result<Option<QuantizationParams>> {
        Ok(self.get(config)?.quantization)
    }

    pub fn predict(&self, config: &ModelConfig, input: &DynTensor) -> Result<RawOutput> {
        self.get(config)?.model.predict(input)
    }

    pub fn decode_predictions(
        &self,
        config: &ModelConfig,
        output: &RawOutput,
    ) -> Result<Vec<Prediction>> {
        self.get(config)?.model.decode_predictions(output)
    }

    fn get(&self, config: &ModelConfig) -> Result<&LoadedModel> {
        self.entries
            .get(config)
            .map(|e| &e.loaded)
            .ok_or_else(|| ModelStateError::NotAcquired.into())
    }

    fn update_gauge(&self) {
        METRICS.processor.loaded_models.set(self.entries.len() as i64);
    }
}
