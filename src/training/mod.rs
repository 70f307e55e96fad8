//! Training module
//!
//! - `freeze`: which backbone units train in each phase
//! - `early_stopping`: patience on validation loss
//! - `trainer`: SGD phase runner and history
//! - `pipeline`: the full two-phase experiment

pub mod early_stopping;
pub mod freeze;
pub mod pipeline;
pub mod trainer;

pub use early_stopping::{EarlyStopStatus, EarlyStopping, EarlyStoppingConfig};
pub use freeze::FreezePolicy;
pub use pipeline::{run_pipeline, PipelineReport};
pub use trainer::{EpochRecord, PhaseConfig, PhaseOutcome, Trainer, TrainingHistory};
