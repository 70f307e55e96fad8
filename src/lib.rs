//! # Fog Density Classification
//!
//! Transfer-learning classifier that sorts CCTV images into four
//! fog-density classes, built on the Burn framework.
//!
//! ## Pipeline
//!
//! 1. Read per-site metadata CSVs and resolve image basenames
//! 2. Decode and resize images, one-hot encode labels
//! 3. Split every site 80/20 independently, then recombine
//! 4. Build a ResNet-style backbone with a new pooling/dense/dropout head
//! 5. Phase 1: train the head with the backbone frozen
//! 6. Phase 2: unfreeze the last backbone units and fine-tune with early stopping
//! 7. Save, reload, and evaluate on the held-out set
//!
//! ## Modules
//!
//! - `dataset`: metadata, image loading, splitting, Burn dataset/batcher
//! - `model`: backbone, head and the combined classifier
//! - `training`: freezing policy, early stopping, phase runner, pipeline
//! - `inference`: batched prediction
//! - `utils`: errors, logging, metrics
//!
//! ```rust,ignore
//! use fog_density::config::ExperimentConfig;
//! use fog_density::training::pipeline::run_pipeline;
//!
//! let config = ExperimentConfig::load("experiment.json".as_ref())?;
//! let report = run_pipeline::<fog_density::backend::TrainingBackend>(&config, &device)?;
//! println!("{}", report.metrics);
//! ```

pub mod backend;
pub mod config;
pub mod dataset;
pub mod inference;
pub mod model;
pub mod training;
pub mod utils;

pub use config::ExperimentConfig;
pub use dataset::{FogBatch, FogBatcher, FogDataset, FogItem, FogRecord, SiteSource};
pub use inference::predictor::{Prediction, Predictor};
pub use model::{FogClassifier, FogClassifierConfig};
pub use training::pipeline::{run_pipeline, PipelineReport};
pub use utils::error::{FogError, Result};
pub use utils::metrics::{ConfusionMatrix, Metrics};

/// Fog-density classes
pub const NUM_CLASSES: usize = 4;

/// Default square input resolution
pub const IMAGE_SIZE: usize = 224;

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
