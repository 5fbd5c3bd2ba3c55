//! Classification results
//!
//! Runs the provider's scoring pass and turns the logits into a
//! probability distribution with a predicted class.

use std::time::{Duration, Instant};

use burn::tensor::{activation::softmax, backend::AutodiffBackend, Tensor};
use serde::{Deserialize, Serialize};

use crate::model::provider::ModelProvider;
use crate::utils::{CardamomError, Result};

/// Number of entries kept in [`Prediction::top_k`]
pub const TOP_K: usize = 3;

/// One class with its probability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassScore {
    pub index: usize,
    pub name: String,
    pub probability: f32,
}

/// Result of a single prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Predicted class index
    pub predicted_class: usize,

    /// Predicted class name
    pub class_name: String,

    /// Confidence score (probability) for the predicted class
    pub confidence: f32,

    /// Full probability distribution over all classes
    pub probabilities: Vec<f32>,

    /// Highest-probability classes, best first
    pub top_k: Vec<ClassScore>,

    /// Inference time in milliseconds
    pub inference_time_ms: f64,
}

impl Prediction {
    /// Build from a probability distribution. Ties go to the lowest index.
    pub fn new(
        probabilities: Vec<f32>,
        class_names: &[String],
        inference_time: Duration,
    ) -> Result<Self> {
        if probabilities.len() != class_names.len() {
            return Err(CardamomError::Inference(format!(
                "{} probabilities for {} classes",
                probabilities.len(),
                class_names.len()
            )));
        }

        let mut indexed: Vec<(usize, f32)> = probabilities.iter().copied().enumerate().collect();
        // stable sort keeps the lower index first on ties
        indexed.sort_by(|a, b| b.1.total_cmp(&a.1));

        let (predicted_class, confidence) = indexed
            .first()
            .copied()
            .ok_or_else(|| CardamomError::Inference("Model produced no classes".to_string()))?;

        let top_k = indexed
            .iter()
            .take(TOP_K)
            .map(|&(index, probability)| ClassScore {
                index,
                name: class_names[index].clone(),
                probability,
            })
            .collect();

        Ok(Self {
            predicted_class,
            class_name: class_names[predicted_class].clone(),
            confidence,
            probabilities,
            top_k,
            inference_time_ms: inference_time.as_secs_f64() * 1000.0,
        })
    }
}

/// Score `input` without gradient tracking and softmax the logits
pub fn classify<B: AutodiffBackend>(
    provider: &dyn ModelProvider<B>,
    input: Tensor<B::InnerBackend, 4>,
) -> Result<Prediction> {
    let start = Instant::now();

    let logits = provider.score(input)?;
    let [batch, _] = logits.dims();
    if batch != 1 {
        return Err(CardamomError::Inference(format!(
            "Expected logits for one image, got {}",
            batch
        )));
    }

    let probabilities = softmax(logits, 1)
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| CardamomError::Inference(format!("Failed to read probabilities: {:?}", e)))?;

    Prediction::new(probabilities, provider.class_names(), start.elapsed())
}
