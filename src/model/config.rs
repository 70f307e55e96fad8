//! Model Configuration
//!
//! Architecture settings for the backbone and the classification head,
//! persisted next to the weights as `model_config.json`.

use burn::config::Config;

use crate::utils::error::FogError;
use crate::{IMAGE_SIZE, NUM_CLASSES};

/// ResNet-style bottleneck backbone
#[derive(Config, Debug)]
pub struct BackboneConfig {
    /// Bottleneck blocks per stage (ResNet-50: 3, 4, 6, 3)
    #[config(default = "vec![3, 4, 6, 3]")]
    pub stage_blocks: Vec<usize>,

    /// Inner width of the first stage, doubled every stage
    #[config(default = "64")]
    pub base_width: usize,

    /// Output/inner channel ratio of a bottleneck block
    #[config(default = "4")]
    pub expansion: usize,
}

impl BackboneConfig {
    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.stage_blocks.is_empty() || self.stage_blocks.contains(&0) {
            return Err(FogError::Config(
                "stage_blocks must list at least one stage, each with at least one block".to_string(),
            ));
        }
        if self.base_width == 0 || self.expansion == 0 {
            return Err(FogError::Config(
                "base_width and expansion must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Freezable units: the stem plus every bottleneck block
    pub fn num_units(&self) -> usize {
        1 + self.stage_blocks.iter().sum::<usize>()
    }

    /// Unit index of the first block of the last stage
    pub fn last_stage_start(&self) -> usize {
        let blocks = self.stage_blocks.len();
        1 + self.stage_blocks[..blocks.saturating_sub(1)].iter().sum::<usize>()
    }

    /// Inner width of a stage
    pub fn stage_width(&self, stage: usize) -> usize {
        self.base_width << stage
    }

    /// Channels of the final feature map
    pub fn out_channels(&self) -> usize {
        self.stage_width(self.stage_blocks.len().saturating_sub(1)) * self.expansion
    }
}

/// Backbone plus pooling/dense/dropout head
#[derive(Config, Debug)]
pub struct FogClassifierConfig {
    #[config(default = "BackboneConfig::new()")]
    pub backbone: BackboneConfig,

    /// Units of the two hidden dense layers
    #[config(default = "[1024, 512]")]
    pub hidden_units: [usize; 2],

    /// Dropout after each hidden dense layer
    #[config(default = "0.5")]
    pub dropout: f64,

    #[config(default = "NUM_CLASSES")]
    pub num_classes: usize,

    /// Square input resolution
    #[config(default = "IMAGE_SIZE")]
    pub image_size: usize,

    /// Standardise inputs with ImageNet channel statistics
    #[config(default = "false")]
    pub imagenet_normalization: bool,
}

impl FogClassifierConfig {
    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        self.backbone.validate()?;

        if self.num_classes == 0 {
            return Err(FogError::Config("num_classes must be greater than 0".to_string()));
        }
        if self.hidden_units.contains(&0) {
            return Err(FogError::Config("hidden_units must be positive".to_string()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(FogError::Config("dropout must be in range [0.0, 1.0)".to_string()));
        }
        // Stem (/4) plus one stride-2 per later stage
        let stride = 4usize << (self.backbone.stage_blocks.len() - 1);
        if self.image_size < stride {
            return Err(FogError::Config(format!(
                "image_size {} is smaller than the backbone stride {}",
                self.image_size, stride
            )));
        }
        Ok(())
    }

    /// A small network for fast experiments and tests
    pub fn tiny(image_size: usize) -> Self {
        Self::new()
            .with_backbone(
                BackboneConfig::new()
                    .with_stage_blocks(vec![1, 1, 1, 1])
                    .with_base_width(4),
            )
            .with_hidden_units([16, 8])
            .with_image_size(image_size)
    }
}
