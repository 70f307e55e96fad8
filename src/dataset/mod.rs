//! Dataset module for fog-density data handling
//!
//! - Reading per-site metadata CSVs (`image_id`, `vis_class`, `basename`)
//! - Resolving basenames to files and decoding/resizing images
//! - Per-site 80/20 train/test splitting
//! - Burn `Dataset` and `Batcher` integration

pub mod burn_dataset;
pub mod loader;
pub mod metadata;
pub mod split;

pub use burn_dataset::{FogBatch, FogBatcher, FogDataset, FogItem};
pub use loader::{load_site, load_sites, DatasetStats, FogRecord, SiteData, SiteSource};
pub use metadata::{read_metadata, MetadataRow};
pub use split::{split_sites, DatasetSplit, SplitConfig, SplitSummary};

use crate::utils::error::{FogError, Result};
use crate::NUM_CLASSES;

/// Fog-density class names, indexed by `vis_class`
pub const CLASS_NAMES: [&str; NUM_CLASSES] = ["no_fog", "light_fog", "moderate_fog", "dense_fog"];

/// Name of a class index, or `"unknown"` when out of range
pub fn class_name(idx: usize) -> &'static str {
    CLASS_NAMES.get(idx).copied().unwrap_or("unknown")
}

/// One-hot encode a class index into a vector of length `NUM_CLASSES`
pub fn one_hot(label: usize) -> Result<Vec<f32>> {
    if label >= NUM_CLASSES {
        return Err(FogError::Dataset(format!(
            "class index {} out of range (expected < {})",
            label, NUM_CLASSES
        )));
    }
    let mut encoded = vec![0.0f32; NUM_CLASSES];
    encoded[label] = 1.0;
    Ok(encoded)
}

/// Index of the largest value; ties resolve to the lowest index
pub fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best_idx, best), (idx, &v)| {
            if v > best {
                (idx, v)
            } else {
                (best_idx, best)
            }
        })
        .0
}
