//! Model module
//!
//! - `backbone`: ResNet-style bottleneck feature extractor
//! - `head`: pooling + dense/dropout classification head
//! - `classifier`: the combined network, partial freezing, persistence
//! - `config`: architecture configuration

pub mod backbone;
pub mod classifier;
pub mod config;
pub mod head;

pub use backbone::Backbone;
pub use classifier::{FogClassifier, MODEL_CONFIG_FILE, MODEL_FILE};
pub use config::{BackboneConfig, FogClassifierConfig};
pub use head::FogHead;
