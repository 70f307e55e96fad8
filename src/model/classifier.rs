//! Fog-density classifier: backbone + head
//!
//! Freezing is expressed at forward time. The frozen backbone prefix runs
//! on the inner (non-autodiff) backend, so it produces no gradients and its
//! batch-norm layers stay in inference mode; only the trainable suffix and
//! the head are part of the autodiff graph.

use std::path::{Path, PathBuf};

use burn::{
    config::Config,
    module::{AutodiffModule, Module},
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::{activation::softmax, backend::AutodiffBackend, backend::Backend, Tensor},
};
use tracing::{info, warn};

use crate::model::backbone::Backbone;
use crate::model::config::FogClassifierConfig;
use crate::model::head::FogHead;
use crate::utils::error::{FogError, Result};

/// Record file stem; the recorder appends `.mpk`
pub const MODEL_FILE: &str = "fog_classifier";
pub const MODEL_CONFIG_FILE: &str = "model_config.json";

/// Full-precision MessagePack record
fn recorder() -> NamedMpkFileRecorder<FullPrecisionSettings> {
    NamedMpkFileRecorder::new()
}

#[derive(Module, Debug)]
pub struct FogClassifier<B: Backend> {
    pub backbone: Backbone<B>,
    pub head: FogHead<B>,
}

impl FogClassifierConfig {
    /// Initialize a model with random weights
    pub fn init<B: Backend>(&self, device: &B::Device) -> FogClassifier<B> {
        let backbone = self.backbone.init(device);
        let head = FogHead::new(
            backbone.out_channels(),
            self.hidden_units,
            self.dropout,
            self.num_classes,
            device,
        );
        FogClassifier { backbone, head }
    }

    /// Initialize a model, loading backbone weights when a path is given
    pub fn build<B: Backend>(
        &self,
        pretrained: Option<&Path>,
        device: &B::Device,
    ) -> Result<FogClassifier<B>> {
        self.validate()?;
        let mut model = self.init(device);

        match pretrained {
            Some(path) => {
                model.backbone = model.backbone.load_pretrained(path, &self.backbone, device)?;
            }
            None => {
                warn!("No pre-trained weights configured, backbone is randomly initialised");
            }
        }

        Ok(model)
    }
}

impl<B: Backend> FogClassifier<B> {
    /// Logits `[batch, num_classes]`
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.head.forward(self.backbone.forward(images))
    }

    /// Class probabilities; every row sums to 1
    pub fn forward_softmax(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    pub fn num_backbone_units(&self) -> usize {
        self.backbone.num_units()
    }

    /// Save weights and architecture into `dir`
    pub fn save(&self, dir: &Path, config: &FogClassifierConfig) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;

        config
            .save(dir.join(MODEL_CONFIG_FILE))
            .map_err(|e| FogError::Model(format!("failed to save model config: {}", e)))?;

        let path = dir.join(MODEL_FILE);
        self.clone()
            .save_file(path.clone(), &recorder())
            .map_err(|e| FogError::Model(format!("failed to save model: {:?}", e)))?;

        info!("Saved model to {:?}", dir);
        Ok(path.with_extension("mpk"))
    }

    /// Rebuild the architecture from `model_config.json` and load the weights
    pub fn load(dir: &Path, device: &B::Device) -> Result<(Self, FogClassifierConfig)> {
        let config_path = dir.join(MODEL_CONFIG_FILE);
        if !config_path.exists() {
            return Err(FogError::PathNotFound(config_path));
        }

        let config = FogClassifierConfig::load(&config_path)
            .map_err(|e| FogError::Model(format!("failed to read {:?}: {:?}", config_path, e)))?;
        config.validate()?;

        let model = config
            .init::<B>(device)
            .load_file(dir.join(MODEL_FILE), &recorder(), device)
            .map_err(|e| FogError::Model(format!("failed to load model from {:?}: {:?}", dir, e)))?;

        Ok((model, config))
    }
}

impl<B: AutodiffBackend> FogClassifier<B> {
    /// Forward pass with backbone units `0..trainable_from` frozen
    ///
    /// `trainable_from == num_backbone_units()` freezes the whole backbone,
    /// `0` trains everything.
    pub fn forward_partially_frozen(
        &self,
        images: Tensor<B, 4>,
        trainable_from: usize,
    ) -> Tensor<B, 2> {
        let units = self.backbone.num_units();
        let split = trainable_from.min(units);

        let features = if split == 0 {
            images
        } else {
            let frozen = self.backbone.valid();
            let prefix = frozen.forward_units(images.inner(), 0, split);
            Tensor::from_inner(prefix)
        };

        let features = self.backbone.forward_units(features, split, units);
        self.head.forward(features)
    }
}
