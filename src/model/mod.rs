//! Model module for the cardamom leaf classifier
//!
//! This module contains:
//! - CNN architecture definition
//! - Model configuration
//! - The typed layer tree used to locate explanation targets
//! - Forward/backward observers
//! - The model provider shared by the pipeline

pub mod cnn;
pub mod config;
pub mod hooks;
pub mod layer;
pub mod provider;

pub use cnn::{CardamomClassifier, ConvBlock, FEATURES};
pub use config::ModelConfig;
pub use hooks::{HookId, HookRegistry, HookSession};
pub use layer::{LayerKind, LayerNode, LayerPath};
pub use provider::{BurnModelProvider, ModelProvider};
