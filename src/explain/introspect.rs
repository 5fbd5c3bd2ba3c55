//! Target layer search
//!
//! Picks the convolution whose activations and gradients drive the saliency
//! map: the last convolution inside the last block of the feature extractor,
//! or, if that block has none, the last convolution anywhere in the model.

use serde::Serialize;

use crate::model::layer::{LayerKind, LayerNode, LayerPath};
use crate::utils::{CardamomError, Result};

/// Which rule located the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchRule {
    /// Found inside the last block of the feature extractor
    FeatureBlock,
    /// Found by walking the whole model
    GlobalFallback,
}

/// The layer chosen for explanation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetLayer {
    pub path: LayerPath,
    /// Output channels of the convolution
    pub channels: usize,
    pub rule: SearchRule,
}

/// Locate the explanation target in `root`.
///
/// `feature_block` names the direct child of `root` that holds the
/// feature extractor's blocks (`features` for [`crate::model::CardamomClassifier`]).
pub fn locate_target_layer(root: &LayerNode, feature_block: &str) -> Result<TargetLayer> {
    let last_block = root
        .child(feature_block)
        .map(|features| features.children.last().unwrap_or(features));

    if let Some(found) = last_block.and_then(last_convolution) {
        return Ok(target(found, SearchRule::FeatureBlock));
    }

    if let Some(found) = last_convolution(root) {
        tracing::warn!(
            "No convolution in the last '{}' block, falling back to {}",
            feature_block,
            found.path
        );
        return Ok(target(found, SearchRule::GlobalFallback));
    }

    Err(CardamomError::NoConvolutionalLayerFound(
        if root.path.as_str().is_empty() {
            "<root>".to_string()
        } else {
            root.path.to_string()
        },
    ))
}

fn last_convolution(node: &LayerNode) -> Option<&LayerNode> {
    node.walk()
        .into_iter()
        .filter(|n| n.kind.is_convolutional())
        .last()
}

fn target(node: &LayerNode, rule: SearchRule) -> TargetLayer {
    let channels = match node.kind {
        LayerKind::Conv2d { out_channels, .. } => out_channels,
        _ => 0,
    };

    TargetLayer {
        path: node.path.clone(),
        channels,
        rule,
    }
}
