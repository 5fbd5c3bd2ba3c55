//! Model Configuration Module
//!
//! Defines the configuration for the classifier architecture.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::utils::{CardamomError, Result};
use crate::NUM_CLASSES;

/// Configuration for the CNN model architecture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Number of output classes (3 cardamom disease categories)
    pub num_classes: usize,

    /// Number of input channels (3 for RGB)
    pub in_channels: usize,

    /// Output channels of each feature block; each block halves the resolution
    pub conv_filters: Vec<usize>,

    /// Kernel size for convolutional layers
    pub kernel_size: usize,

    /// Width of the hidden layer in the classifier head
    pub hidden_units: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_classes: NUM_CLASSES,
            in_channels: 3,
            conv_filters: vec![32, 64, 128, 256],
            kernel_size: 3,
            hidden_units: 512,
        }
    }
}

impl ModelConfig {
    /// A very small network, mostly useful for tests and smoke runs
    pub fn tiny() -> Self {
        Self {
            conv_filters: vec![4, 8, 8, 8],
            hidden_units: 16,
            ..Default::default()
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.num_classes == 0 {
            return Err(CardamomError::Config(
                "num_classes must be greater than 0".to_string(),
            ));
        }

        if self.in_channels == 0 {
            return Err(CardamomError::Config(
                "in_channels must be greater than 0".to_string(),
            ));
        }

        if self.conv_filters.is_empty() || self.conv_filters.contains(&0) {
            return Err(CardamomError::Config(
                "conv_filters must list at least one non-zero block width".to_string(),
            ));
        }

        if self.kernel_size < 1 || self.kernel_size % 2 == 0 {
            return Err(CardamomError::Config(
                "kernel_size must be a positive odd number".to_string(),
            ));
        }

        if self.hidden_units == 0 {
            return Err(CardamomError::Config(
                "hidden_units must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Spatial size of the last feature block's convolution output
    pub fn target_resolution(&self, input_size: usize) -> usize {
        // every block but the last has been pooled by the time the last conv runs
        let pooled_blocks = self.conv_filters.len().saturating_sub(1);
        input_size >> pooled_blocks
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| CardamomError::Serialization(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json).map_err(|e| CardamomError::Serialization(e.to_string()))
    }
}
