//! Early stopping on validation loss

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EarlyStoppingConfig {
    /// Epochs without improvement before stopping
    pub patience: usize,
    /// Minimum decrease of the loss that counts as improvement
    pub min_delta: f64,
    /// Restore the best epoch's weights when training ends
    pub restore_best_weights: bool,
}

impl Default for EarlyStoppingConfig {
    fn default() -> Self {
        Self {
            patience: 5,
            min_delta: 0.0,
            restore_best_weights: false,
        }
    }
}

/// Outcome of one observed epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EarlyStopStatus {
    Improved,
    NoImprovement,
    Stop,
}

#[derive(Debug, Clone)]
pub struct EarlyStopping {
    config: EarlyStoppingConfig,
    best_loss: f64,
    best_epoch: Option<usize>,
    wait: usize,
}

impl EarlyStopping {
    pub fn new(config: EarlyStoppingConfig) -> Self {
        Self {
            config,
            best_loss: f64::INFINITY,
            best_epoch: None,
            wait: 0,
        }
    }

    /// Record the validation loss of `epoch`
    ///
    /// Returns `Stop` once `patience` consecutive epochs failed to improve
    /// on the best loss by more than `min_delta`.
    pub fn observe(&mut self, epoch: usize, val_loss: f64) -> EarlyStopStatus {
        if val_loss < self.best_loss - self.config.min_delta {
            self.best_loss = val_loss;
            self.best_epoch = Some(epoch);
            self.wait = 0;
            return EarlyStopStatus::Improved;
        }

        self.wait += 1;
        if self.wait >= self.config.patience {
            EarlyStopStatus::Stop
        } else {
            EarlyStopStatus::NoImprovement
        }
    }

    pub fn best_loss(&self) -> f64 {
        self.best_loss
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    pub fn epochs_without_improvement(&self) -> usize {
        self.wait
    }

    pub fn config(&self) -> &EarlyStoppingConfig {
        &self.config
    }
}
