//! Library error type
//!
//! Data problems (unresolvable basenames, undecodable images, bad labels)
//! get their own variants so the CLI can report exactly which file failed.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for fog-density operations
#[derive(Error, Debug)]
pub enum FogError {
    /// Metadata CSV could not be read or parsed
    #[error("Metadata error in '{0}': {1}")]
    Metadata(PathBuf, String),

    /// A basename did not match any file in the image directory
    #[error("No image file matches basename '{basename}' under '{dir}'")]
    MissingImage { basename: String, dir: PathBuf },

    /// A basename matched more than one file in the image directory
    #[error("Basename '{basename}' matches {count} files under '{dir}'")]
    AmbiguousImage {
        basename: String,
        dir: PathBuf,
        count: usize,
    },

    /// Error decoding or resizing an image
    #[error("Failed to load image at '{0}': {1}")]
    ImageLoad(PathBuf, String),

    /// A fog-density label outside the known classes
    #[error("Invalid fog-density class {label} for image '{image_id}'")]
    InvalidLabel { image_id: String, label: i64 },

    /// Error with dataset operations
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Error with model operations (building, saving, loading)
    #[error("Model error: {0}")]
    Model(String),

    /// Error with training
    #[error("Training error: {0}")]
    Training(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Writing a CSV report (history, confusion matrix) failed
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Path not found
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),
}

/// Convenience Result type for fog-density operations
pub type Result<T> = std::result::Result<T, FogError>;
