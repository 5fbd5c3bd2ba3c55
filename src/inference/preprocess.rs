//! Image preprocessing
//!
//! Turns an uploaded image into the [1, 3, H, W] tensor the classifier
//! expects: RGB, resized with bilinear (triangle) filtering, scaled to
//! [0, 1] and normalised per channel with ImageNet statistics.

use burn::tensor::{backend::Backend, Tensor, TensorData};
use image::{imageops::FilterType, DynamicImage};

use crate::utils::{CardamomError, Result};
use crate::IMAGE_SIZE;

/// ImageNet normalization mean values (RGB)
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet normalization std values (RGB)
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Decode raw upload bytes into an image
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    if bytes.is_empty() {
        return Err(CardamomError::InvalidImage("empty upload".to_string()));
    }
    image::load_from_memory(bytes).map_err(|e| CardamomError::InvalidImage(e.to_string()))
}

/// Deterministic image -> tensor transform
#[derive(Debug, Clone, PartialEq)]
pub struct Preprocessor {
    image_size: u32,
    mean: [f32; 3],
    std: [f32; 3],
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self {
            image_size: IMAGE_SIZE,
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
        }
    }
}

impl Preprocessor {
    pub fn new(image_size: u32, mean: [f32; 3], std: [f32; 3]) -> Result<Self> {
        if image_size == 0 {
            return Err(CardamomError::Config("image_size must be greater than 0".to_string()));
        }
        if std.iter().any(|&s| s <= 0.0) {
            return Err(CardamomError::Config("std values must be positive".to_string()));
        }

        Ok(Self {
            image_size,
            mean,
            std,
        })
    }

    pub fn image_size(&self) -> u32 {
        self.image_size
    }

    /// Normalize an image to a flat vector in CHW layout
    pub fn normalize(&self, image: &DynamicImage) -> Vec<f32> {
        let rgb = image
            .resize_exact(self.image_size, self.image_size, FilterType::Triangle)
            .to_rgb8();
        let num_pixels = (self.image_size * self.image_size) as usize;

        let mut normalized = vec![0.0f32; 3 * num_pixels];

        for (i, pixel) in rgb.pixels().enumerate() {
            for c in 0..3 {
                normalized[c * num_pixels + i] =
                    (pixel[c] as f32 / 255.0 - self.mean[c]) / self.std[c];
            }
        }

        normalized
    }

    /// Build the [1, 3, size, size] input tensor
    pub fn to_tensor<B: Backend>(&self, image: &DynamicImage, device: &B::Device) -> Tensor<B, 4> {
        let size = self.image_size as usize;
        let data = TensorData::new(self.normalize(image), [1, 3, size, size]);
        Tensor::from_data(data, device)
    }
}
