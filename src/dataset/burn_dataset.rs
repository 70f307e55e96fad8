//! Burn Dataset Integration
//!
//! `FogDataset` holds decoded records in memory; `FogBatcher` stacks them
//! into image tensors plus integer and one-hot targets.

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::dataset::loader::FogRecord;
use crate::dataset::one_hot;
use crate::utils::error::{FogError, Result};
use crate::NUM_CLASSES;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// A single item ready for batching
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FogItem {
    /// Flattened CHW image `[3 * H * W]` in `[0, 1]`
    pub image: Vec<f32>,
    /// Class label (0-3)
    pub label: usize,
    pub image_id: String,
}

/// In-memory dataset of fog items
#[derive(Clone, Debug)]
pub struct FogDataset {
    items: Vec<FogItem>,
    image_size: usize,
}

impl FogDataset {
    /// Build from decoded records, rejecting images of the wrong size
    pub fn from_records(records: &[FogRecord], image_size: usize) -> Result<Self> {
        let expected = 3 * image_size * image_size;
        let items = records
            .iter()
            .map(|record| {
                if record.pixels.len() != expected {
                    return Err(FogError::Dataset(format!(
                        "image '{}' has {} values, expected {} for {}x{}",
                        record.image_id,
                        record.pixels.len(),
                        expected,
                        image_size,
                        image_size
                    )));
                }
                if record.label >= NUM_CLASSES {
                    return Err(FogError::InvalidLabel {
                        image_id: record.image_id.clone(),
                        label: record.label as i64,
                    });
                }
                Ok(FogItem {
                    image: record.pixels.clone(),
                    label: record.label,
                    image_id: record.image_id.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { items, image_size })
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    /// Number of items per class
    pub fn class_distribution(&self) -> [usize; NUM_CLASSES] {
        let mut counts = [0usize; NUM_CLASSES];
        for item in &self.items {
            counts[item.label] += 1;
        }
        counts
    }

    pub fn labels(&self) -> Vec<usize> {
        self.items.iter().map(|item| item.label).collect()
    }

    /// Items at the given indices, skipping any out of range
    pub fn select(&self, indices: &[usize]) -> Vec<FogItem> {
        indices.iter().filter_map(|&i| self.get(i)).collect()
    }
}

impl Dataset<FogItem> for FogDataset {
    fn get(&self, index: usize) -> Option<FogItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// A batch of fog images
#[derive(Clone, Debug)]
pub struct FogBatch<B: Backend> {
    /// `[batch_size, 3, height, width]`
    pub images: Tensor<B, 4>,
    /// Class indices `[batch_size]`
    pub targets: Tensor<B, 1, Int>,
    /// One-hot targets `[batch_size, NUM_CLASSES]`
    pub one_hot: Tensor<B, 2>,
}

/// Batcher for fog items
#[derive(Clone, Debug)]
pub struct FogBatcher {
    image_size: usize,
    imagenet_normalization: bool,
}

impl FogBatcher {
    pub fn new(image_size: usize) -> Self {
        Self {
            image_size,
            imagenet_normalization: false,
        }
    }

    /// Standardise channels with ImageNet mean/std after scaling to `[0, 1]`
    pub fn with_imagenet_normalization(mut self, enabled: bool) -> Self {
        self.imagenet_normalization = enabled;
        self
    }

    /// Stack raw CHW images into a normalised `[n, 3, size, size]` tensor
    pub fn images<B: Backend>(&self, images: Vec<f32>, n: usize, device: &B::Device) -> Tensor<B, 4> {
        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(images, [n, 3, self.image_size, self.image_size]),
            device,
        );

        if !self.imagenet_normalization {
            return images;
        }

        let mean = Tensor::<B, 4>::from_floats(TensorData::new(IMAGENET_MEAN.to_vec(), [1, 3, 1, 1]), device);
        let std = Tensor::<B, 4>::from_floats(TensorData::new(IMAGENET_STD.to_vec(), [1, 3, 1, 1]), device);
        (images - mean) / std
    }
}

impl<B: Backend> Batcher<B, FogItem, FogBatch<B>> for FogBatcher {
    fn batch(&self, items: Vec<FogItem>, device: &B::Device) -> FogBatch<B> {
        let batch_size = items.len();

        let images_data: Vec<f32> = items.iter().flat_map(|item| item.image.iter().copied()).collect();
        let images = self.images::<B>(images_data, batch_size, device);

        let targets_data: Vec<i64> = items.iter().map(|item| item.label as i64).collect();
        let targets = Tensor::<B, 1, Int>::from_data(TensorData::new(targets_data, [batch_size]), device);

        // Labels were range-checked when the dataset was built
        let one_hot_data: Vec<f32> = items
            .iter()
            .flat_map(|item| one_hot(item.label).unwrap_or_else(|_| vec![0.0; NUM_CLASSES]))
            .collect();
        let one_hot = Tensor::<B, 2>::from_floats(
            TensorData::new(one_hot_data, [batch_size, NUM_CLASSES]),
            device,
        );

        FogBatch {
            images,
            targets,
            one_hot,
        }
    }
}
