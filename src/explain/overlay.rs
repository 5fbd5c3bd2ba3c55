//! Heatmap overlay rendering
//!
//! Upsamples a [`SaliencyMap`] to the original image size with bilinear
//! (triangle) filtering, colours it with a jet palette and alpha-blends it
//! over the source pixels.

use std::io::Cursor;

use image::{imageops, DynamicImage, ImageFormat, Rgb, RgbImage};

use crate::explain::saliency::SaliencyMap;
use crate::utils::{CardamomError, Result};

/// Heatmap opacity used when none is configured
pub const DEFAULT_ALPHA: f32 = 0.4;

/// Jet colour for an intensity in 0..=255: dark blue, cyan, yellow, dark red
pub fn jet(value: u8) -> Rgb<u8> {
    let x = value as f32 / 255.0;
    let channel = |offset: f32| -> u8 {
        let v = (1.5 - (4.0 * x - offset).abs()).clamp(0.0, 1.0);
        (v * 255.0).round() as u8
    };
    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

/// Renders saliency maps over source images
#[derive(Debug, Clone)]
pub struct OverlayRenderer {
    alpha: f32,
    palette: [Rgb<u8>; 256],
}

impl Default for OverlayRenderer {
    fn default() -> Self {
        Self::build(DEFAULT_ALPHA)
    }
}

impl OverlayRenderer {
    /// Create a renderer; `alpha` is the heatmap weight in [0, 1]
    pub fn new(alpha: f32) -> Result<Self> {
        if !(0.0..=1.0).contains(&alpha) {
            return Err(CardamomError::Config(format!(
                "overlay alpha must be within [0, 1], got {}",
                alpha
            )));
        }
        Ok(Self::build(alpha))
    }

    fn build(alpha: f32) -> Self {
        let mut palette = [Rgb([0, 0, 0]); 256];
        for (i, color) in palette.iter_mut().enumerate() {
            *color = jet(i as u8);
        }
        Self { alpha, palette }
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    /// Blend `map` over `original` at the original's resolution
    pub fn blend(&self, original: &DynamicImage, map: &SaliencyMap) -> Result<RgbImage> {
        let base = original.to_rgb8();
        let (width, height) = base.dimensions();
        if width == 0 || height == 0 {
            return Err(CardamomError::Render("Cannot render an empty image".to_string()));
        }

        let heat = imageops::resize(&map.to_image()?, width, height, imageops::FilterType::Triangle);

        let a = self.alpha;
        let mut out = RgbImage::new(width, height);
        for (x, y, pixel) in out.enumerate_pixels_mut() {
            let intensity = (heat.get_pixel(x, y)[0].clamp(0.0, 1.0) * 255.0) as u8;
            let Rgb(color) = self.palette[intensity as usize];
            let Rgb(src) = *base.get_pixel(x, y);

            for c in 0..3 {
                pixel[c] = ((1.0 - a) * src[c] as f32 + a * color[c] as f32).round() as u8;
            }
        }

        Ok(out)
    }

    /// Blend and encode as PNG
    pub fn render_png(&self, original: &DynamicImage, map: &SaliencyMap) -> Result<Vec<u8>> {
        let blended = self.blend(original, map)?;

        let mut buffer = Cursor::new(Vec::new());
        blended
            .write_to(&mut buffer, ImageFormat::Png)
            .map_err(|e| CardamomError::Render(format!("Failed to encode PNG: {}", e)))?;

        Ok(buffer.into_inner())
    }
}
