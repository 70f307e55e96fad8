//! Inference Predictor
//!
//! Batched softmax inference with arg-max class selection, on images that
//! are already decoded (a `FogDataset`) or on files on disk.

use std::path::{Path, PathBuf};
use std::time::Instant;

use burn::data::dataset::Dataset;
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::dataset::loader::load_image;
use crate::dataset::{argmax, class_name, FogBatcher, FogDataset};
use crate::model::{FogClassifier, FogClassifierConfig};
use crate::utils::error::{FogError, Result};

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "tif"];

/// Result of a single prediction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Prediction {
    /// Input file, when predicting from disk
    pub image_path: Option<PathBuf>,
    pub predicted_class: usize,
    pub class_name: String,
    /// Probability of the predicted class
    pub confidence: f32,
    /// Full distribution over the fog-density classes
    pub probabilities: Vec<f32>,
}

impl Prediction {
    pub fn from_probabilities(probabilities: Vec<f32>, image_path: Option<PathBuf>) -> Self {
        let predicted_class = argmax(&probabilities);
        let confidence = probabilities.get(predicted_class).copied().unwrap_or(0.0);

        Self {
            image_path,
            predicted_class,
            class_name: class_name(predicted_class).to_string(),
            confidence,
            probabilities,
        }
    }
}

/// A loaded model ready for inference
pub struct Predictor<B: Backend> {
    model: FogClassifier<B>,
    config: FogClassifierConfig,
    batcher: FogBatcher,
    device: B::Device,
}

impl<B: Backend> Predictor<B> {
    pub fn new(model: FogClassifier<B>, config: FogClassifierConfig, device: B::Device) -> Self {
        let batcher = FogBatcher::new(config.image_size)
            .with_imagenet_normalization(config.imagenet_normalization);
        Self {
            model,
            config,
            batcher,
            device,
        }
    }

    /// Load a saved model directory
    pub fn load(dir: &Path, device: B::Device) -> Result<Self> {
        let (model, config) = FogClassifier::load(dir, &device)?;
        Ok(Self::new(model, config, device))
    }

    pub fn config(&self) -> &FogClassifierConfig {
        &self.config
    }

    pub fn image_size(&self) -> usize {
        self.config.image_size
    }

    /// Class probabilities for CHW images of the configured size
    pub fn predict_pixels(&self, images: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>> {
        let n = images.len();
        if n == 0 {
            return Ok(Vec::new());
        }

        let expected = 3 * self.image_size() * self.image_size();
        if let Some(bad) = images.iter().find(|img| img.len() != expected) {
            return Err(FogError::Dataset(format!(
                "image has {} values, expected {}",
                bad.len(),
                expected
            )));
        }

        let flat: Vec<f32> = images.into_iter().flatten().collect();
        let input = self.batcher.images::<B>(flat, n, &self.device);
        let probs: Vec<f32> = self
            .model
            .forward_softmax(input)
            .into_data()
            .iter::<f32>()
            .collect();

        Ok(probs
            .chunks(self.config.num_classes)
            .map(|row| row.to_vec())
            .collect())
    }

    /// Predict every item of a dataset, in order
    pub fn predict_dataset(&self, dataset: &FogDataset, batch_size: usize) -> Result<Vec<Prediction>> {
        let start = Instant::now();
        let indices: Vec<usize> = (0..dataset.len()).collect();
        let mut predictions = Vec::with_capacity(dataset.len());

        for chunk in indices.chunks(batch_size.max(1)) {
            let images = dataset.select(chunk).into_iter().map(|item| item.image).collect();
            predictions.extend(
                self.predict_pixels(images)?
                    .into_iter()
                    .map(|probs| Prediction::from_probabilities(probs, None)),
            );
        }

        debug!(
            "Predicted {} images in {:.2}s",
            predictions.len(),
            start.elapsed().as_secs_f64()
        );
        Ok(predictions)
    }

    /// Predict image files
    pub fn predict_files(&self, paths: &[PathBuf], batch_size: usize) -> Result<Vec<Prediction>> {
        let mut predictions = Vec::with_capacity(paths.len());

        for chunk in paths.chunks(batch_size.max(1)) {
            let images = chunk
                .iter()
                .map(|path| load_image(path, self.image_size()))
                .collect::<Result<Vec<_>>>()?;

            predictions.extend(
                self.predict_pixels(images)?
                    .into_iter()
                    .zip(chunk)
                    .map(|(probs, path)| Prediction::from_probabilities(probs, Some(path.clone()))),
            );
        }

        Ok(predictions)
    }
}

/// One image, or every image below a directory (sorted)
pub fn collect_image_paths(input: &Path) -> Result<Vec<PathBuf>> {
    if input.is_file() {
        return Ok(vec![input.to_path_buf()]);
    }
    if !input.is_dir() {
        return Err(FogError::PathNotFound(input.to_path_buf()));
    }

    let mut paths: Vec<PathBuf> = WalkDir::new(input)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension()
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_string_lossy().to_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();
    Ok(paths)
}
