//! Inference orchestration
//!
//! One request moves through
//! `Idle -> Preprocessed -> Classified -> LayerLocated -> ExplanationGenerated
//! -> Rendered -> Done`, or to `Failed` from any of the non-terminal states.
//! This is the only place where internal errors are turned into something a
//! caller sees.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use burn::tensor::backend::AutodiffBackend;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::explain::{locate_target_layer, GradientRecorder, OverlayRenderer, SaliencyMap, TargetLayer};
use crate::inference::predictor::{classify, Prediction};
use crate::inference::preprocess::{decode_image, Preprocessor, IMAGENET_MEAN, IMAGENET_STD};
use crate::model::provider::ModelProvider;
use crate::model::FEATURES;
use crate::utils::{format_millis, CardamomError, ErrorKind, Result};
use crate::IMAGE_SIZE;

/// Attached to every response produced with random weights
pub const UNTRAINED_WARNING: &str = "UNTRAINED MODEL: This prediction uses a placeholder model \
     with random weights. Predictions are not accurate. Train the model with real data before \
     relying on it.";

/// Tunable parameters of the pipeline.
///
/// The input contract (`image_size`, `mean`, `std`) is fixed at 224x224 with
/// ImageNet statistics. Those fields are not read from JSON; only code can
/// change them, e.g. to run a small model in tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Side of the square model input
    #[serde(skip, default = "default_image_size")]
    pub image_size: u32,

    /// Heatmap weight when blending over the source image
    pub overlay_alpha: f32,

    /// Child of the model root holding the feature blocks
    pub feature_block: String,

    /// Per-channel normalisation mean (RGB)
    #[serde(skip, default = "default_mean")]
    pub mean: [f32; 3],

    /// Per-channel normalisation std (RGB)
    #[serde(skip, default = "default_std")]
    pub std: [f32; 3],
}

fn default_image_size() -> u32 {
    IMAGE_SIZE
}

fn default_mean() -> [f32; 3] {
    IMAGENET_MEAN
}

fn default_std() -> [f32; 3] {
    IMAGENET_STD
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            image_size: IMAGE_SIZE,
            overlay_alpha: crate::explain::DEFAULT_ALPHA,
            feature_block: FEATURES.to_string(),
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
        }
    }
}

impl PipelineConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.image_size == 0 {
            return Err(CardamomError::Config(
                "image_size must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.overlay_alpha) {
            return Err(CardamomError::Config(format!(
                "overlay_alpha must be within [0, 1], got {}",
                self.overlay_alpha
            )));
        }

        if self.feature_block.is_empty() {
            return Err(CardamomError::Config(
                "feature_block must not be empty".to_string(),
            ));
        }

        if self.std.iter().any(|&s| s <= 0.0) {
            return Err(CardamomError::Config("std values must be positive".to_string()));
        }

        Ok(())
    }

    /// Load configuration from a JSON file; missing fields take defaults
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)
            .map_err(|e| CardamomError::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

/// Where a request is in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Idle,
    Preprocessed,
    Classified,
    LayerLocated,
    ExplanationGenerated,
    Rendered,
    Done,
    Failed,
}

impl PipelineStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineStage::Done | PipelineStage::Failed)
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Idle => "idle",
            PipelineStage::Preprocessed => "preprocessed",
            PipelineStage::Classified => "classified",
            PipelineStage::LayerLocated => "layer_located",
            PipelineStage::ExplanationGenerated => "explanation_generated",
            PipelineStage::Rendered => "rendered",
            PipelineStage::Done => "done",
            PipelineStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A failed request: the state it failed from and why
#[derive(Debug, Error)]
#[error("pipeline failed after reaching '{stage}': {source}")]
pub struct PipelineError {
    pub stage: PipelineStage,
    #[source]
    pub source: CardamomError,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }

    /// Caller-safe message
    pub fn public_detail(&self) -> String {
        self.source.public_detail()
    }
}

/// Body returned to the caller of a prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub class_name: String,
    pub confidence: f32,
    /// Base64 PNG of the heatmap overlay at the upload's resolution
    pub heatmap: String,
    pub model_trained: bool,
    pub warning: Option<String>,
}

/// Everything a request produced, before it is shaped for transport
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub prediction: Prediction,
    pub target: TargetLayer,
    /// Class the saliency map explains
    pub target_class: usize,
    pub saliency: SaliencyMap,
    pub overlay_png: Vec<u8>,
    pub model_trained: bool,
}

impl PipelineOutput {
    pub fn into_response(self) -> PredictionResponse {
        PredictionResponse {
            class_name: self.prediction.class_name,
            confidence: self.prediction.confidence,
            heatmap: STANDARD.encode(&self.overlay_png),
            model_trained: self.model_trained,
            warning: (!self.model_trained).then(|| UNTRAINED_WARNING.to_string()),
        }
    }
}

/// Reject uploads whose declared type is not an image
pub fn check_content_type(content_type: Option<&str>) -> Result<()> {
    match content_type {
        Some(ct) if ct.trim().to_ascii_lowercase().starts_with("image/") => Ok(()),
        Some(ct) => Err(CardamomError::InvalidImage(format!(
            "unsupported content type '{}'",
            ct
        ))),
        None => Err(CardamomError::InvalidImage(
            "missing content type".to_string(),
        )),
    }
}

/// Tracks the state of one request
struct Progress {
    stage: PipelineStage,
}

impl Progress {
    fn new() -> Self {
        Self {
            stage: PipelineStage::Idle,
        }
    }

    fn advance(&mut self, next: PipelineStage) {
        debug!("{} -> {}", self.stage, next);
        self.stage = next;
    }

    fn fail(&self, source: CardamomError) -> PipelineError {
        match source.kind() {
            ErrorKind::Client => warn!(
                "Request rejected in state {} ({}): {}",
                self.stage,
                source.label(),
                source
            ),
            ErrorKind::Server => error!(
                "Request failed in state {} ({}): {:?}",
                self.stage,
                source.label(),
                source
            ),
        }

        PipelineError {
            stage: self.stage,
            source,
        }
    }
}

/// Sequences preprocessing, classification and explanation for one model
pub struct InferencePipeline<B: AutodiffBackend> {
    provider: Arc<dyn ModelProvider<B>>,
    config: PipelineConfig,
    preprocessor: Preprocessor,
    renderer: OverlayRenderer,
}

impl<B: AutodiffBackend> InferencePipeline<B> {
    pub fn new(provider: Arc<dyn ModelProvider<B>>, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let preprocessor = Preprocessor::new(config.image_size, config.mean, config.std)?;
        let renderer = OverlayRenderer::new(config.overlay_alpha)?;

        Ok(Self {
            provider,
            config,
            preprocessor,
            renderer,
        })
    }

    pub fn provider(&self) -> &dyn ModelProvider<B> {
        self.provider.as_ref()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn model_trained(&self) -> bool {
        self.provider.is_trained()
    }

    /// Locate the explanation target once so a model without a usable
    /// convolution is reported before any request arrives
    pub fn startup_check(&self) -> Result<TargetLayer> {
        let target = locate_target_layer(&self.provider.layers(), &self.config.feature_block)?;
        info!(
            "Explanation target: {} ({} channels, {:?})",
            target.path, target.channels, target.rule
        );
        Ok(target)
    }

    /// Full request from raw upload bytes and their declared content type
    pub fn run_bytes(
        &self,
        content_type: Option<&str>,
        bytes: &[u8],
    ) -> std::result::Result<PredictionResponse, PipelineError> {
        let progress = Progress::new();
        check_content_type(content_type).map_err(|e| progress.fail(e))?;
        let image = decode_image(bytes).map_err(|e| progress.fail(e))?;
        self.run_image(&image)
    }

    /// Full request for an already decoded image
    pub fn run_image(
        &self,
        image: &DynamicImage,
    ) -> std::result::Result<PredictionResponse, PipelineError> {
        Ok(self.run_detailed(image, None)?.into_response())
    }

    /// Run every stage; `class` overrides the explained class, which is
    /// otherwise the predicted one
    pub fn run_detailed(
        &self,
        image: &DynamicImage,
        class: Option<usize>,
    ) -> std::result::Result<PipelineOutput, PipelineError> {
        let start = Instant::now();
        let mut progress = Progress::new();
        let provider = self.provider.as_ref();

        if image.width() == 0 || image.height() == 0 {
            return Err(progress.fail(CardamomError::InvalidImage(
                "image has no pixels".to_string(),
            )));
        }

        let input = self
            .preprocessor
            .to_tensor::<B::InnerBackend>(image, &provider.device());
        progress.advance(PipelineStage::Preprocessed);

        let prediction = classify(provider, input.clone()).map_err(|e| progress.fail(e))?;
        progress.advance(PipelineStage::Classified);

        let target = locate_target_layer(&provider.layers(), &self.config.feature_block)
            .map_err(|e| progress.fail(e))?;
        progress.advance(PipelineStage::LayerLocated);

        let explained = class.unwrap_or(prediction.predicted_class);
        let recording = GradientRecorder::new(provider)
            .record(&target, input, Some(explained))
            .map_err(|e| progress.fail(e))?;
        let saliency = SaliencyMap::from_snapshots(recording.activation, recording.gradient)
            .map_err(|e| progress.fail(e))?;
        progress.advance(PipelineStage::ExplanationGenerated);

        let overlay_png = self
            .renderer
            .render_png(image, &saliency)
            .map_err(|e| progress.fail(e))?;
        progress.advance(PipelineStage::Rendered);

        let model_trained = provider.is_trained();
        progress.advance(PipelineStage::Done);

        info!(
            "Predicted '{}' ({:.1}%) in {}",
            prediction.class_name,
            prediction.confidence * 100.0,
            format_millis(start.elapsed().as_secs_f64())
        );

        Ok(PipelineOutput {
            prediction,
            target,
            target_class: recording.target_class,
            saliency,
            overlay_png,
            model_trained,
        })
    }
}
