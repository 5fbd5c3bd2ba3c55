//! CNN Model Architecture for Cardamom Leaf Disease Classification
//!
//! A feature extractor made of convolutional blocks followed by a small
//! classifier head. Every layer output is reported through a tap so that
//! observers can watch any layer by its path in [`CardamomClassifier::layers`].

use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{
        backend::{AutodiffBackend, Backend},
        Tensor,
    },
};

use crate::model::config::ModelConfig;
use crate::model::hooks::HookRegistry;
use crate::model::layer::{LayerKind, LayerNode, LayerPath};

/// Name of the container holding the feature blocks
pub const FEATURES: &str = "features";

/// Batch norm on running statistics only.
///
/// Burn switches `BatchNorm` to batch statistics (and updates the running
/// ones) whenever the backend tracks gradients. The explanation pass runs on
/// an autodiff backend against a model shared by all requests, so both passes
/// go through this instead.
fn frozen_batch_norm<B: Backend>(bn: &BatchNorm<B>, x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [channels] = bn.gamma.val().dims();
    let shape = [1, channels, 1, 1];

    let mean = bn.running_mean.value().reshape(shape);
    let var = bn.running_var.value().reshape(shape);
    let gamma = bn.gamma.val().reshape(shape);
    let beta = bn.beta.val().reshape(shape);

    (x - mean) / (var + bn.epsilon).sqrt() * gamma + beta
}

/// A CNN block with Conv2d, BatchNorm, ReLU and MaxPool
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B>,
    pub relu: Relu,
    pub pool: MaxPool2d,
}

impl<B: Backend> ConvBlock<B> {
    /// Create a new convolutional block
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        device: &B::Device,
    ) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [kernel_size, kernel_size])
            .with_padding(PaddingConfig2d::Same)
            .init(device);

        let bn = BatchNormConfig::new(out_channels).init(device);
        let pool = MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init();

        Self {
            conv,
            bn,
            relu: Relu::new(),
            pool,
        }
    }

    fn forward_with<F>(&self, path: &LayerPath, x: Tensor<B, 4>, tap: &mut F) -> Tensor<B, 4>
    where
        F: FnMut(&LayerPath, Tensor<B, 4>) -> Tensor<B, 4>,
    {
        let x = tap(&path.child("conv"), self.conv.forward(x));
        let x = tap(&path.child("bn"), frozen_batch_norm(&self.bn, x));
        let x = tap(&path.child("relu"), self.relu.forward(x));
        tap(&path.child("pool"), self.pool.forward(x))
    }

    fn layers(&self, path: LayerPath) -> LayerNode {
        let [out_channels, in_channels, kernel_size, _] = self.conv.weight.val().dims();
        let [features] = self.bn.gamma.val().dims();

        LayerNode::container(
            path.clone(),
            vec![
                LayerNode::leaf(
                    path.child("conv"),
                    LayerKind::Conv2d {
                        in_channels,
                        out_channels,
                        kernel_size,
                    },
                ),
                LayerNode::leaf(path.child("bn"), LayerKind::BatchNorm { features }),
                LayerNode::leaf(path.child("relu"), LayerKind::Activation),
                LayerNode::leaf(path.child("pool"), LayerKind::Pool),
            ],
        )
    }
}

/// Cardamom Leaf Disease Classifier CNN
///
/// Architecture:
/// - `features`: convolutional blocks with increasing filter counts,
///   each halving the spatial resolution
/// - `avgpool`: global average pooling
/// - `classifier`: Linear -> ReLU -> Linear over the disease classes
#[derive(Module, Debug)]
pub struct CardamomClassifier<B: Backend> {
    pub features: Vec<ConvBlock<B>>,
    pub avgpool: AdaptiveAvgPool2d,
    pub fc1: Linear<B>,
    pub relu: Relu,
    pub fc2: Linear<B>,

    num_classes: usize,
}

impl<B: Backend> CardamomClassifier<B> {
    /// Create a new classifier from configuration
    pub fn new(config: &ModelConfig, device: &B::Device) -> Self {
        let mut features = Vec::with_capacity(config.conv_filters.len());
        let mut in_channels = config.in_channels;
        for &filters in &config.conv_filters {
            features.push(ConvBlock::new(in_channels, filters, config.kernel_size, device));
            in_channels = filters;
        }

        let avgpool = AdaptiveAvgPool2dConfig::new([1, 1]).init();
        let fc1 = LinearConfig::new(in_channels, config.hidden_units).init(device);
        let fc2 = LinearConfig::new(config.hidden_units, config.num_classes).init(device);

        Self {
            features,
            avgpool,
            fc1,
            relu: Relu::new(),
            fc2,
            num_classes: config.num_classes,
        }
    }

    /// Forward pass reporting every layer output to `tap`.
    ///
    /// # Arguments
    /// * `x` - Input tensor of shape [batch_size, 3, height, width]
    ///
    /// # Returns
    /// * Logits tensor of shape [batch_size, num_classes]
    fn forward_with<F>(&self, x: Tensor<B, 4>, tap: &mut F) -> Tensor<B, 2>
    where
        F: FnMut(&LayerPath, Tensor<B, 4>) -> Tensor<B, 4>,
    {
        let features = LayerPath::new(FEATURES);

        let mut x = x;
        for (idx, block) in self.features.iter().enumerate() {
            x = block.forward_with(&features.child(&idx.to_string()), x, tap);
        }

        // Global pooling: [B, C, H, W] -> [B, C, 1, 1]
        let x = tap(&LayerPath::new("avgpool"), self.avgpool.forward(x));

        // Flatten: [B, C, 1, 1] -> [B, C]
        let [batch_size, channels, _, _] = x.dims();
        let x = x.reshape([batch_size, channels]);

        let x = self.fc1.forward(x);
        let x = self.relu.forward(x);
        self.fc2.forward(x)
    }

    /// Plain forward pass
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        self.forward_with(x, &mut |_, t| t)
    }

    /// Forward pass with softmax
    pub fn forward_softmax(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        burn::tensor::activation::softmax(self.forward(x), 1)
    }

    /// Get the number of output classes
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// The layer tree, children in definition order
    pub fn layers(&self) -> LayerNode {
        let root = LayerPath::new("");
        let features = root.child(FEATURES);

        let blocks = self
            .features
            .iter()
            .enumerate()
            .map(|(idx, block)| block.layers(features.child(&idx.to_string())))
            .collect();

        let [fc1_in, fc1_out] = self.fc1.weight.val().dims();
        let [fc2_in, fc2_out] = self.fc2.weight.val().dims();
        let classifier = root.child("classifier");

        LayerNode::container(
            root.clone(),
            vec![
                LayerNode::container(features, blocks),
                LayerNode::leaf(root.child("avgpool"), LayerKind::Pool),
                LayerNode::container(
                    classifier.clone(),
                    vec![
                        LayerNode::leaf(
                            classifier.child("fc1"),
                            LayerKind::Linear {
                                in_features: fc1_in,
                                out_features: fc1_out,
                            },
                        ),
                        LayerNode::leaf(classifier.child("relu"), LayerKind::Activation),
                        LayerNode::leaf(
                            classifier.child("fc2"),
                            LayerKind::Linear {
                                in_features: fc2_in,
                                out_features: fc2_out,
                            },
                        ),
                    ],
                ),
            ],
        )
    }
}

impl<B: AutodiffBackend> CardamomClassifier<B> {
    /// Gradient-tracking forward pass with the observers in `hooks` active
    pub fn forward_observed(&self, x: Tensor<B, 4>, hooks: &HookRegistry<B>) -> Tensor<B, 2> {
        self.forward_with(x, &mut |path, t| hooks.on_forward(path, t))
    }
}
