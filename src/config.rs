//! Experiment Configuration
//!
//! Everything a training run needs: data sources, split, architecture,
//! both phases and the output location. Stored as JSON; missing fields take
//! their defaults, and CLI flags override individual values.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::dataset::{SiteSource, SplitConfig};
use crate::model::FogClassifierConfig;
use crate::training::{EarlyStoppingConfig, PhaseConfig};
use crate::utils::error::{FogError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Weather-station data sources
    pub sites: Vec<SiteSource>,

    pub split: SplitConfig,

    pub model: FogClassifierConfig,

    /// ImageNet backbone weights: a torchvision ResNet `state_dict`
    /// (`.pth`, `.safetensors`) or a burn record; `null` means random init
    pub pretrained_weights: Option<PathBuf>,

    /// First backbone unit trained in phase 2; defaults to the last stage
    pub fine_tune_from: Option<usize>,

    pub batch_size: usize,

    /// Phase 1: head only
    pub head_training: PhaseConfig,

    /// Phase 2: backbone suffix + head
    pub fine_tuning: PhaseConfig,

    /// Early stopping for phase 2
    pub early_stopping: EarlyStoppingConfig,

    /// Each run writes into a timestamped subdirectory
    pub output_dir: PathBuf,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            sites: Vec::new(),
            split: SplitConfig::default(),
            model: FogClassifierConfig::new(),
            pretrained_weights: None,
            fine_tune_from: None,
            batch_size: 32,
            head_training: PhaseConfig::head_training(),
            fine_tuning: PhaseConfig::fine_tuning(),
            early_stopping: EarlyStoppingConfig::default(),
            output_dir: PathBuf::from("output"),
        }
    }
}

impl ExperimentConfig {
    /// Default config with two placeholder sites, written by `init-config`
    pub fn template() -> Self {
        Self {
            sites: vec![
                SiteSource::new("site_a", "data/site_a/metadata.csv", "data/site_a/images"),
                SiteSource::new("site_b", "data/site_b/metadata.csv", "data/site_b/images"),
            ],
            // torchvision ImageNet weights expect standardised inputs
            model: FogClassifierConfig::new().with_imagenet_normalization(true),
            pretrained_weights: Some(PathBuf::from("weights/resnet50-0676ba61.pth")),
            ..Default::default()
        }
    }

    /// Backbone unit phase 2 trains from
    pub fn resolved_fine_tune_from(&self) -> usize {
        self.fine_tune_from
            .unwrap_or_else(|| self.model.backbone.last_stage_start())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.sites.is_empty() {
            return Err(FogError::Config("at least one site must be configured".to_string()));
        }
        for (i, site) in self.sites.iter().enumerate() {
            if self.sites[..i].iter().any(|s| s.name == site.name) {
                return Err(FogError::Config(format!("duplicate site name '{}'", site.name)));
            }
        }
        if self.batch_size == 0 {
            return Err(FogError::Config("batch_size must be greater than 0".to_string()));
        }

        self.split.validate()?;
        self.model.validate()?;
        self.head_training.validate()?;
        self.fine_tuning.validate()?;

        let units = self.model.backbone.num_units();
        if self.resolved_fine_tune_from() > units {
            return Err(FogError::Config(format!(
                "fine_tune_from {} exceeds the {} backbone units",
                self.resolved_fine_tune_from(),
                units
            )));
        }
        if self.early_stopping.patience == 0 {
            return Err(FogError::Config("early_stopping.patience must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(FogError::PathNotFound(path.to_path_buf()));
        }
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}
