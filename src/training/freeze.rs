//! Trainable-unit policy for the backbone
//!
//! Units `0..trainable_from` are frozen, units `trainable_from..num_units`
//! train. The head always trains.

use std::ops::Range;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::utils::error::{FogError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreezePolicy {
    num_units: usize,
    trainable_from: usize,
}

impl FreezePolicy {
    /// Whole backbone frozen (phase 1)
    pub fn frozen_backbone(num_units: usize) -> Self {
        Self {
            num_units,
            trainable_from: num_units,
        }
    }

    /// Unfreeze every unit at index `>= index` (phase 2)
    pub fn unfreeze_from(&mut self, index: usize) -> Result<()> {
        if index > self.num_units {
            return Err(FogError::Training(format!(
                "cannot fine-tune from unit {}: backbone has {} units",
                index, self.num_units
            )));
        }
        self.trainable_from = index;
        info!(
            "Backbone units {}..{} trainable, {} frozen",
            index,
            self.num_units,
            index
        );
        Ok(())
    }

    pub fn unfreeze_all(&mut self) {
        self.trainable_from = 0;
    }

    pub fn freeze_all(&mut self) {
        self.trainable_from = self.num_units;
    }

    pub fn trainable_from(&self) -> usize {
        self.trainable_from
    }

    pub fn num_units(&self) -> usize {
        self.num_units
    }

    pub fn is_trainable(&self, unit: usize) -> bool {
        unit >= self.trainable_from && unit < self.num_units
    }

    pub fn trainable_units(&self) -> Range<usize> {
        self.trainable_from..self.num_units
    }

    pub fn frozen_units(&self) -> Range<usize> {
        0..self.trainable_from
    }

    pub fn is_backbone_frozen(&self) -> bool {
        self.trainable_from == self.num_units
    }
}

impl std::fmt::Display for FreezePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_backbone_frozen() {
            write!(f, "backbone frozen ({} units), head trainable", self.num_units)
        } else {
            write!(
                f,
                "backbone units {}..{} trainable, {} frozen",
                self.trainable_from, self.num_units, self.trainable_from
            )
        }
    }
}
