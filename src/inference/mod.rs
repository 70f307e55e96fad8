//! Inference module: batched prediction on decoded images or files

pub mod predictor;

pub use predictor::{collect_image_paths, Prediction, Predictor};
