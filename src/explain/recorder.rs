//! Gradient and activation recording for one explanation request
//!
//! [`GradientRecorder::record`] runs the attach -> forward -> backward ->
//! detach sequence while holding the model's [`HookSession`], so concurrent
//! requests never see each other's observers. Observers are owned by an
//! [`ObserverGuard`] and detached on every exit path.

use burn::tensor::{
    backend::{AutodiffBackend, Backend},
    Tensor, TensorData,
};

use crate::explain::introspect::TargetLayer;
use crate::model::hooks::{HookId, HookRegistry, HookSession};
use crate::model::layer::LayerPath;
use crate::model::provider::ModelProvider;
use crate::utils::{CardamomError, Result};

/// Matched activation and gradient snapshots of one forward/backward pass
#[derive(Debug, Clone)]
pub struct Recording<B: Backend> {
    /// Output of the target layer, [1, C, H, W]
    pub activation: Tensor<B, 4>,
    /// Gradient of the target class score w.r.t. the activation, [1, C, H, W]
    pub gradient: Tensor<B, 4>,
    /// Class whose score was differentiated
    pub target_class: usize,
    /// Raw logits of the observed pass, [1, num_classes]
    pub logits: Tensor<B, 2>,
}

/// Forward and backward observers on one layer, detached on drop
pub struct ObserverGuard<'r, B: AutodiffBackend> {
    hooks: &'r HookRegistry<B>,
    forward: Option<HookId>,
    backward: Option<HookId>,
}

impl<'r, B: AutodiffBackend> ObserverGuard<'r, B> {
    /// Attach both observers to `layer`
    pub fn attach(
        hooks: &'r HookRegistry<B>,
        session: &HookSession<'_>,
        layer: &LayerPath,
    ) -> Result<Self> {
        let mut guard = Self {
            hooks,
            forward: None,
            backward: None,
        };

        guard.forward = Some(hooks.attach_forward(session, layer.clone())?);
        guard.backward = Some(hooks.attach_backward(session, layer.clone())?);

        Ok(guard)
    }

    fn take_activation(&self) -> Option<Tensor<B::InnerBackend, 4>> {
        self.forward.and_then(|id| self.hooks.take_activation(id))
    }

    fn take_gradient(&self) -> Option<Tensor<B::InnerBackend, 4>> {
        self.backward.and_then(|id| self.hooks.take_gradient(id))
    }
}

impl<B: AutodiffBackend> Drop for ObserverGuard<'_, B> {
    fn drop(&mut self) {
        for id in [self.forward.take(), self.backward.take()].into_iter().flatten() {
            self.hooks.detach(id);
        }
    }
}

/// Records activations and gradients at a target layer
pub struct GradientRecorder<'a, B: AutodiffBackend> {
    provider: &'a dyn ModelProvider<B>,
}

impl<'a, B: AutodiffBackend> GradientRecorder<'a, B> {
    pub fn new(provider: &'a dyn ModelProvider<B>) -> Self {
        Self { provider }
    }

    /// Run one observed forward/backward pass.
    ///
    /// # Arguments
    /// * `target` - Layer to observe
    /// * `input` - Preprocessed image, [1, 3, H, W]
    /// * `class` - Class to explain; the top-scoring class when `None`
    pub fn record(
        &self,
        target: &TargetLayer,
        input: Tensor<B::InnerBackend, 4>,
        class: Option<usize>,
    ) -> Result<Recording<B::InnerBackend>> {
        let [batch, _, _, _] = input.dims();
        if batch != 1 {
            return Err(CardamomError::Inference(format!(
                "Explanations take a single image, got a batch of {}",
                batch
            )));
        }

        let hooks = self.provider.hooks();
        // guard is declared after the session so it is dropped first
        let session = hooks.lock_session();
        let guard = ObserverGuard::attach(hooks, &session, &target.path)?;

        let logits = self
            .provider
            .forward_observed(Tensor::<B, 4>::from_inner(input))?;

        let activation = guard.take_activation().ok_or_else(|| {
            CardamomError::GradientComputationFailed(format!(
                "Layer {} was not executed during the forward pass",
                target.path
            ))
        })?;

        let [_, num_classes] = logits.dims();
        let target_class = match class {
            Some(index) if index >= num_classes => {
                return Err(CardamomError::InvalidTargetClass { index, num_classes })
            }
            Some(index) => index,
            None => argmax(logits.clone().inner())?,
        };

        let mut seed = vec![0.0f32; num_classes];
        seed[target_class] = 1.0;
        let one_hot = Tensor::<B, 2>::from_data(
            TensorData::new(seed, [1, num_classes]),
            &logits.device(),
        );

        self.provider.before_backward(target_class)?;
        let grads = (logits.clone() * one_hot).sum().backward();
        hooks.on_backward(&grads);

        let gradient = guard.take_gradient().ok_or_else(|| {
            CardamomError::GradientComputationFailed(format!(
                "No gradient reached layer {}",
                target.path
            ))
        })?;

        if activation.dims() != gradient.dims() {
            return Err(CardamomError::GradientComputationFailed(format!(
                "Activation {:?} and gradient {:?} shapes differ",
                activation.dims(),
                gradient.dims()
            )));
        }

        tracing::debug!(
            "Recorded {:?} at {} for class {}",
            activation.dims(),
            target.path,
            target_class
        );

        Ok(Recording {
            activation,
            gradient,
            target_class,
            logits: logits.inner(),
        })
    }
}

/// Index of the largest value in a [1, N] tensor; ties go to the first
pub(crate) fn argmax<B: Backend>(logits: Tensor<B, 2>) -> Result<usize> {
    let values = logits
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| CardamomError::Inference(format!("Failed to read logits: {:?}", e)))?;

    values
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (idx, &v)| match best {
            Some((_, max)) if v <= max => best,
            _ => Some((idx, v)),
        })
        .map(|(idx, _)| idx)
        .ok_or_else(|| CardamomError::Inference("Model produced no logits".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::explain::introspect::{locate_target_layer, SearchRule};
    use crate::model::{BurnModelProvider, ModelConfig, FEATURES};
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = Autodiff<NdArray>;

    fn provider() -> BurnModelProvider<TestBackend> {
        BurnModelProvider::random(&ModelConfig::tiny(), &Default::default()).unwrap()
    }

    #[test]
    fn test_argmax_prefers_first_maximum() {
        let device = Default::default();
        let logits = Tensor::<NdArray, 2>::from_data([[0.5f32, 2.0, 2.0]], &device);
        assert_eq!(argmax(logits).unwrap(), 1);
    }

    #[test]
    fn test_record_matches_target_layer_shape() {
        let provider = provider();
        let target = locate_target_layer(&provider.layers(), FEATURES).unwrap();
        let input = Tensor::<NdArray, 4>::ones([1, 3, 32, 32], &Default::default());

        let recording = GradientRecorder::<TestBackend>::new(&provider)
            .record(&target, input, None)
            .unwrap();

        // three 2x2 pools before the last convolution
        assert_eq!(recording.activation.dims(), [1, 8, 4, 4]);
        assert_eq!(recording.gradient.dims(), [1, 8, 4, 4]);
        assert!(recording.target_class < 3);
        assert_eq!(provider.hooks().active_observers(), 0);
    }

    #[test]
    fn test_explicit_class_is_honoured() {
        let provider = provider();
        let target = locate_target_layer(&provider.layers(), FEATURES).unwrap();
        let input = Tensor::<NdArray, 4>::ones([1, 3, 32, 32], &Default::default());

        let recording = GradientRecorder::<TestBackend>::new(&provider)
            .record(&target, input, Some(2))
            .unwrap();
        assert_eq!(recording.target_class, 2);
    }

    #[test]
    fn test_invalid_class_releases_observers() {
        let provider = provider();
        let target = locate_target_layer(&provider.layers(), FEATURES).unwrap();
        let input = Tensor::<NdArray, 4>::ones([1, 3, 32, 32], &Default::default());

        let err = GradientRecorder::<TestBackend>::new(&provider)
            .record(&target, input, Some(9))
            .unwrap_err();

        assert!(matches!(
            err,
            CardamomError::InvalidTargetClass {
                index: 9,
                num_classes: 3
            }
        ));
        assert_eq!(provider.hooks().active_observers(), 0);
    }

    #[test]
    fn test_unknown_layer_fails_without_leaking() {
        let provider = provider();
        let target = TargetLayer {
            path: LayerPath::new("features.9.conv"),
            channels: 8,
            rule: SearchRule::FeatureBlock,
        };
        let input = Tensor::<NdArray, 4>::ones([1, 3, 32, 32], &Default::default());

        let err = GradientRecorder::<TestBackend>::new(&provider)
            .record(&target, input, None)
            .unwrap_err();

        assert!(matches!(err, CardamomError::GradientComputationFailed(_)));
        assert_eq!(provider.hooks().active_observers(), 0);
    }

    #[test]
    fn test_batch_must_be_single_image() {
        let provider = provider();
        let target = locate_target_layer(&provider.layers(), FEATURES).unwrap();
        let input = Tensor::<NdArray, 4>::ones([2, 3, 32, 32], &Default::default());

        assert!(GradientRecorder::<TestBackend>::new(&provider)
            .record(&target, input, None)
            .is_err());
    }
}
