//! Class activation maps from recorded snapshots

use burn::tensor::{backend::Backend, Tensor};
use image::{ImageBuffer, Luma};
use serde::Serialize;

use crate::utils::{CardamomError, Result};

/// Single-channel importance map in [0, 1] at the target layer's resolution
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaliencyMap {
    width: usize,
    height: usize,
    values: Vec<f32>,
}

impl SaliencyMap {
    /// Gradient-weighted class activation map.
    ///
    /// # Arguments
    /// * `activation` - Target layer output, [1, C, H, W]
    /// * `gradient` - Gradient w.r.t. that output, same shape
    pub fn from_snapshots<B: Backend>(
        activation: Tensor<B, 4>,
        gradient: Tensor<B, 4>,
    ) -> Result<Self> {
        if activation.dims() != gradient.dims() {
            return Err(CardamomError::GradientComputationFailed(format!(
                "Activation {:?} and gradient {:?} shapes differ",
                activation.dims(),
                gradient.dims()
            )));
        }

        let [batch, _, height, width] = activation.dims();
        if batch != 1 {
            return Err(CardamomError::Inference(format!(
                "Expected a single-image snapshot, got a batch of {}",
                batch
            )));
        }

        // Per-channel weights: [1, C, H, W] -> [1, C, 1, 1]
        let weights = gradient.mean_dim(3).mean_dim(2);

        // Weighted sum over channels: [1, C, H, W] -> [1, 1, H, W]
        let cam = (activation * weights).sum_dim(1);

        // ReLU
        let cam = cam.clamp_min(0.0);

        let values = cam
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| CardamomError::Inference(format!("Failed to read saliency map: {:?}", e)))?;

        Self::from_raw(width, height, values)
    }

    /// Normalise a non-negative row-major map into [0, 1].
    ///
    /// The minimum is subtracted, then the result is divided by its maximum
    /// only when that maximum is positive. A flat map becomes all zeros.
    pub fn from_raw(width: usize, height: usize, values: Vec<f32>) -> Result<Self> {
        if values.len() != width * height {
            return Err(CardamomError::Inference(format!(
                "Saliency map has {} values for {}x{}",
                values.len(),
                width,
                height
            )));
        }

        let mut values: Vec<f32> = values
            .into_iter()
            .map(|v| if v.is_finite() { v.max(0.0) } else { 0.0 })
            .collect();

        let min = values.iter().copied().fold(f32::INFINITY, f32::min);
        if min.is_finite() {
            values.iter_mut().for_each(|v| *v -= min);
        }

        let max = values.iter().copied().fold(0.0f32, f32::max);
        if max > 0.0 {
            values.iter_mut().for_each(|v| *v = (*v / max).clamp(0.0, 1.0));
        }

        Ok(Self {
            width,
            height,
            values,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Row-major values
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// The map as a float grayscale image
    pub fn to_image(&self) -> Result<ImageBuffer<Luma<f32>, Vec<f32>>> {
        ImageBuffer::from_raw(self.width as u32, self.height as u32, self.values.clone())
            .ok_or_else(|| CardamomError::Render("Saliency map buffer size mismatch".to_string()))
    }
}
