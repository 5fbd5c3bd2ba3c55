//! Gradient-weighted class activation maps
//!
//! - `introspect`: find the convolution to explain
//! - `recorder`: capture its activation and gradient in one guarded pass
//! - `saliency`: turn the two snapshots into a normalised map
//! - `overlay`: colour the map and blend it over the source image

pub mod introspect;
pub mod overlay;
pub mod recorder;
pub mod saliency;

pub use introspect::{locate_target_layer, SearchRule, TargetLayer};
pub use overlay::{jet, OverlayRenderer, DEFAULT_ALPHA};
pub use recorder::{GradientRecorder, ObserverGuard, Recording};
pub use saliency::SaliencyMap;
