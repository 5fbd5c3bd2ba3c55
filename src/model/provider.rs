//! Model provider
//!
//! Owns the shared classifier and exposes it to the pipeline as a scoring
//! function, a layer tree and an observed gradient-tracking forward pass.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use burn::{
    module::{AutodiffModule, Module},
    record::CompactRecorder,
    tensor::{backend::AutodiffBackend, Tensor},
};
use tracing::{info, warn};

use crate::model::cnn::CardamomClassifier;
use crate::model::config::ModelConfig;
use crate::model::hooks::HookRegistry;
use crate::model::layer::LayerNode;
use crate::utils::{CardamomError, Result, ResultExt};
use crate::CLASS_NAMES;

/// What the pipeline needs from a classifier
pub trait ModelProvider<B: AutodiffBackend>: Send + Sync {
    /// Raw class logits for a [batch, 3, H, W] tensor, without gradient tracking
    fn score(&self, input: Tensor<B::InnerBackend, 4>) -> Result<Tensor<B::InnerBackend, 2>>;

    /// The model's layer tree
    fn layers(&self) -> LayerNode;

    /// False when running on randomly initialised weights
    fn is_trained(&self) -> bool;

    fn class_names(&self) -> &[String];

    /// Observers for [`ModelProvider::forward_observed`]
    fn hooks(&self) -> &HookRegistry<B>;

    /// Gradient-tracking forward pass that reports to [`ModelProvider::hooks`]
    fn forward_observed(&self, input: Tensor<B, 4>) -> Result<Tensor<B, 2>>;

    /// Called once the explained class is fixed, right before the backward
    /// pass of [`ModelProvider::forward_observed`]'s logits. An error aborts
    /// the explanation.
    fn before_backward(&self, _target_class: usize) -> Result<()> {
        Ok(())
    }

    fn device(&self) -> B::Device;
}

/// [`ModelProvider`] backed by a [`CardamomClassifier`]
pub struct BurnModelProvider<B: AutodiffBackend> {
    model: Mutex<CardamomClassifier<B>>,
    inference_model: Mutex<CardamomClassifier<B::InnerBackend>>,
    hooks: HookRegistry<B>,
    class_names: Vec<String>,
    trained: bool,
    device: B::Device,
}

impl<B: AutodiffBackend> BurnModelProvider<B> {
    /// Wrap an already built model
    pub fn new(
        model: CardamomClassifier<B>,
        class_names: Vec<String>,
        trained: bool,
        device: B::Device,
    ) -> Result<Self> {
        if class_names.len() != model.num_classes() {
            return Err(CardamomError::Model(format!(
                "{} class names for a {}-class model",
                class_names.len(),
                model.num_classes()
            )));
        }

        let inference_model = model.valid();

        Ok(Self {
            model: Mutex::new(model),
            inference_model: Mutex::new(inference_model),
            hooks: HookRegistry::new(),
            class_names,
            trained,
            device,
        })
    }

    /// Randomly initialised model with the default class names
    pub fn random(config: &ModelConfig, device: &B::Device) -> Result<Self> {
        config.validate()?;
        let model = CardamomClassifier::new(config, device);
        Self::new(model, default_class_names(), false, device.clone())
    }

    /// Build the model and load weights from `weights`.
    ///
    /// A missing or unreadable weight file is not an error: the provider
    /// keeps its random initialisation and reports itself as untrained.
    pub fn load(config: &ModelConfig, weights: Option<&Path>, device: &B::Device) -> Result<Self> {
        config.validate()?;
        let model = CardamomClassifier::<B>::new(config, device);

        let Some(path) = weights else {
            warn!("No weights configured, using random initialization");
            return Self::new(model, default_class_names(), false, device.clone());
        };

        let Some(load_path) = resolve_weights(path) else {
            warn!(
                "Weights not found at {:?}, using random initialization",
                path
            );
            return Self::new(model, default_class_names(), false, device.clone());
        };

        let recorder = CompactRecorder::new();
        match model.clone().load_file(&load_path, &recorder, device) {
            Ok(loaded) => {
                info!("Loaded weights from {:?}", load_path);
                Self::new(loaded, default_class_names(), true, device.clone())
            }
            Err(e) => {
                warn!(
                    "Failed to load weights from {:?}: {:?}. Using random initialization",
                    load_path, e
                );
                Self::new(model, default_class_names(), false, device.clone())
            }
        }
    }

    /// Persist the current weights. The recorder appends `.mpk`.
    pub fn save_weights(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let model = self.snapshot()?;
        model
            .save_file(path, &CompactRecorder::new())
            .map_err(|e| CardamomError::Model(format!("Failed to save weights: {:?}", e)))?;

        info!("Saved weights to {:?}", path);
        Ok(())
    }

    fn snapshot(&self) -> Result<CardamomClassifier<B>> {
        Ok(self.model.lock().context("Model lock poisoned")?.clone())
    }
}

impl<B: AutodiffBackend> ModelProvider<B> for BurnModelProvider<B> {
    fn score(&self, input: Tensor<B::InnerBackend, 4>) -> Result<Tensor<B::InnerBackend, 2>> {
        let model = self
            .inference_model
            .lock()
            .context("Model lock poisoned")?
            .clone();
        Ok(model.forward(input))
    }

    fn layers(&self) -> LayerNode {
        self.model
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .layers()
    }

    fn is_trained(&self) -> bool {
        self.trained
    }

    fn class_names(&self) -> &[String] {
        &self.class_names
    }

    fn hooks(&self) -> &HookRegistry<B> {
        &self.hooks
    }

    fn forward_observed(&self, input: Tensor<B, 4>) -> Result<Tensor<B, 2>> {
        let model = self.snapshot()?;
        Ok(model.forward_observed(input, &self.hooks))
    }

    fn device(&self) -> B::Device {
        self.device.clone()
    }
}

fn default_class_names() -> Vec<String> {
    CLASS_NAMES.iter().map(|s| s.to_string()).collect()
}

/// The recorder adds `.mpk` on save and expects the bare stem on load
fn resolve_weights(path: &Path) -> Option<PathBuf> {
    if path.extension().is_some_and(|ext| ext == "mpk") && path.exists() {
        return Some(path.with_extension(""));
    }

    let with_ext = PathBuf::from(format!("{}.mpk", path.display()));
    if with_ext.exists() {
        Some(path.to_path_buf())
    } else {
        None
    }
}
