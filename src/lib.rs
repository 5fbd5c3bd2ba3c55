//! # Cardamom CAM
//!
//! Cardamom leaf disease classification with visual explanations, built on
//! the Burn framework.
//!
//! Every prediction comes with a gradient-weighted class activation map
//! (Grad-CAM) rendered over the uploaded image, showing which regions drove
//! the decision.
//!
//! ## Modules
//!
//! - `backend`: Compile-time backend selection (NdArray or CUDA)
//! - `model`: CNN architecture, layer tree, observers and the model provider
//! - `explain`: Target layer search, gradient recording, saliency maps, overlays
//! - `inference`: Preprocessing, classification and the request pipeline
//! - `utils`: Error types and logging
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cardamom_cam::backend::{default_device, ExplainBackend};
//! use cardamom_cam::inference::{InferencePipeline, PipelineConfig};
//! use cardamom_cam::model::{BurnModelProvider, ModelConfig};
//!
//! let device = default_device();
//! let provider = BurnModelProvider::<ExplainBackend>::load(
//!     &ModelConfig::default(),
//!     Some("models/cardamom_model".as_ref()),
//!     &device,
//! )?;
//! let pipeline = InferencePipeline::new(Arc::new(provider), PipelineConfig::default())?;
//! let response = pipeline.run_bytes(Some("image/png"), &bytes)?;
//! ```

pub mod backend;
pub mod explain;
pub mod inference;
pub mod model;
pub mod utils;

// Re-export commonly used items for convenience
pub use explain::{OverlayRenderer, SaliencyMap, TargetLayer};
pub use inference::{InferencePipeline, PipelineConfig, PredictionResponse};
pub use model::{BurnModelProvider, CardamomClassifier, ModelConfig, ModelProvider};
pub use utils::error::{CardamomError, Result};

/// Cardamom disease classes
pub const NUM_CLASSES: usize = 3;

/// Class names in model output order
pub const CLASS_NAMES: [&str; NUM_CLASSES] =
    ["Colletotrichum Blight", "Phyllosticta Leaf Spot", "Healthy"];

/// Side of the square model input
pub const IMAGE_SIZE: u32 = 224;

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
