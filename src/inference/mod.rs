//! Inference module for prediction and explanation
//!
//! This module provides:
//! - Deterministic preprocessing of uploaded images
//! - Classification with softmax confidence
//! - The request pipeline that ties classification to its explanation

pub mod pipeline;
pub mod predictor;
pub mod preprocess;

// Re-export main types for convenience
pub use pipeline::{
    check_content_type, InferencePipeline, PipelineConfig, PipelineError, PipelineOutput,
    PipelineStage, PredictionResponse, UNTRAINED_WARNING,
};
pub use predictor::{classify, ClassScore, Prediction};
pub use preprocess::{decode_image, Preprocessor, IMAGENET_MEAN, IMAGENET_STD};
