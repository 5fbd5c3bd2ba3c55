//! Forward/backward observers attached to layers of a shared model
//!
//! A [`HookRegistry`] lives next to the model it observes. The model reports
//! every layer output through [`HookRegistry::on_forward`]; observers attached
//! to that layer capture the activation, or re-root the graph at that point
//! so the gradient flowing into it can be read after the backward pass.
//!
//! The registry is shared by every request that uses the model. Whoever
//! attaches observers must hold a [`HookSession`] for the whole
//! attach -> forward -> backward -> detach sequence.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Tensor;

use crate::model::layer::LayerPath;
use crate::utils::{Result, ResultExt};

/// Handle to one attached observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

enum Observer<B: AutodiffBackend> {
    Forward {
        layer: LayerPath,
        captured: Option<Tensor<B::InnerBackend, 4>>,
    },
    Backward {
        layer: LayerPath,
        leaf: Option<Tensor<B, 4>>,
        captured: Option<Tensor<B::InnerBackend, 4>>,
    },
}

impl<B: AutodiffBackend> Observer<B> {
    fn layer(&self) -> &LayerPath {
        match self {
            Observer::Forward { layer, .. } | Observer::Backward { layer, .. } => layer,
        }
    }
}

struct Attached<B: AutodiffBackend> {
    id: HookId,
    observer: Observer<B>,
}

/// Exclusive right to attach observers to a registry
pub struct HookSession<'a> {
    _guard: MutexGuard<'a, ()>,
}

/// Registry of observers for one model instance
pub struct HookRegistry<B: AutodiffBackend> {
    observers: Mutex<Vec<Attached<B>>>,
    session: Mutex<()>,
    next_id: AtomicU64,
}

impl<B: AutodiffBackend> Default for HookRegistry<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: AutodiffBackend> HookRegistry<B> {
    pub fn new() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
            session: Mutex::new(()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Block until no other request is observing this model.
    ///
    /// A session left poisoned by a panicking holder is still usable: its
    /// observers were detached by their guards while unwinding.
    pub fn lock_session(&self) -> HookSession<'_> {
        let guard = self.session.lock().unwrap_or_else(|e| e.into_inner());
        HookSession { _guard: guard }
    }

    /// Attach an observer that captures the layer's output on the forward pass
    pub fn attach_forward(&self, _session: &HookSession<'_>, layer: LayerPath) -> Result<HookId> {
        self.attach(Observer::Forward {
            layer,
            captured: None,
        })
    }

    /// Attach an observer that captures the gradient w.r.t. the layer's output
    pub fn attach_backward(&self, _session: &HookSession<'_>, layer: LayerPath) -> Result<HookId> {
        self.attach(Observer::Backward {
            layer,
            leaf: None,
            captured: None,
        })
    }

    fn attach(&self, observer: Observer<B>) -> Result<HookId> {
        let id = HookId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers
            .lock()
            .context("Observer registry lock poisoned")?
            .push(Attached { id, observer });
        tracing::trace!("Attached observer {:?}", id);
        Ok(id)
    }

    /// Remove an observer. Returns false if it was not attached.
    ///
    /// Never fails, so it is safe to call from `Drop`.
    pub fn detach(&self, id: HookId) -> bool {
        let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        let before = observers.len();
        observers.retain(|a| a.id != id);
        let removed = observers.len() != before;
        if removed {
            tracing::trace!("Detached observer {:?}", id);
        }
        removed
    }

    /// Number of observers currently attached
    pub fn active_observers(&self) -> usize {
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Called by the model with the output of `layer`.
    ///
    /// Returns the tensor the rest of the forward pass must continue with.
    /// When a backward observer watches this layer, that is a fresh leaf cut
    /// from the incoming graph, so its gradient is kept after `backward()`.
    pub fn on_forward(&self, layer: &LayerPath, output: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        if observers.is_empty() {
            return output;
        }

        let mut output = output;
        let mut leaf: Option<Tensor<B, 4>> = None;

        for attached in observers.iter_mut().filter(|a| a.observer.layer() == layer) {
            match &mut attached.observer {
                Observer::Forward { captured, .. } => {
                    *captured = Some(output.clone().inner());
                }
                Observer::Backward { leaf: slot, .. } => {
                    let rooted = leaf
                        .get_or_insert_with(|| output.clone().detach().require_grad())
                        .clone();
                    *slot = Some(rooted);
                }
            }
        }

        if let Some(rooted) = leaf {
            output = rooted;
        }

        output
    }

    /// Called after the backward pass with the resulting gradients
    pub fn on_backward(&self, grads: &B::Gradients) {
        let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());

        for attached in observers.iter_mut() {
            if let Observer::Backward { leaf, captured, .. } = &mut attached.observer {
                if let Some(leaf) = leaf.as_ref() {
                    *captured = leaf.grad(grads);
                }
            }
        }
    }

    /// Take the activation captured by a forward observer
    pub fn take_activation(&self, id: HookId) -> Option<Tensor<B::InnerBackend, 4>> {
        let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        observers.iter_mut().find(|a| a.id == id).and_then(|a| match &mut a.observer {
            Observer::Forward { captured, .. } => captured.take(),
            Observer::Backward { .. } => None,
        })
    }

    /// Take the gradient captured by a backward observer
    pub fn take_gradient(&self, id: HookId) -> Option<Tensor<B::InnerBackend, 4>> {
        let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        observers.iter_mut().find(|a| a.id == id).and_then(|a| match &mut a.observer {
            Observer::Backward { captured, .. } => captured.take(),
            Observer::Forward { .. } => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn::tensor::ElementConversion;
    use burn_ndarray::NdArray;

    type TestBackend = Autodiff<NdArray>;

    #[test]
    fn test_unobserved_layer_passes_through() {
        let registry = HookRegistry::<TestBackend>::new();
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::ones([1, 2, 3, 3], &device);

        let out = registry.on_forward(&LayerPath::new("a"), x.clone());
        assert_eq!(out.dims(), x.dims());
        assert_eq!(registry.active_observers(), 0);
    }

    #[test]
    fn test_forward_and_backward_capture() {
        let registry = HookRegistry::<TestBackend>::new();
        let device = Default::default();
        let session = registry.lock_session();
        let layer = LayerPath::new("features.0.conv");

        let fwd = registry.attach_forward(&session, layer.clone()).unwrap();
        let bwd = registry.attach_backward(&session, layer.clone()).unwrap();
        assert_eq!(registry.active_observers(), 2);

        let weight = Tensor::<TestBackend, 4>::ones([1, 2, 3, 3], &device).require_grad();
        let activation = weight * 2.0;
        let observed = registry.on_forward(&layer, activation);
        let score = (observed * 3.0).sum();
        let grads = score.backward();
        registry.on_backward(&grads);

        let act = registry.take_activation(fwd).unwrap();
        let grad = registry.take_gradient(bwd).unwrap();

        let act_sum: f32 = act.sum().into_scalar().elem();
        let grad_sum: f32 = grad.sum().into_scalar().elem();
        assert!((act_sum - 36.0).abs() < 1e-5);
        assert!((grad_sum - 54.0).abs() < 1e-5);

        assert!(registry.detach(fwd));
        assert!(registry.detach(bwd));
        assert!(!registry.detach(bwd));
        assert_eq!(registry.active_observers(), 0);
    }

    #[test]
    fn test_observer_ignores_other_layers() {
        let registry = HookRegistry::<TestBackend>::new();
        let device = Default::default();
        let session = registry.lock_session();

        let fwd = registry
            .attach_forward(&session, LayerPath::new("features.1.conv"))
            .unwrap();
        let x = Tensor::<TestBackend, 4>::ones([1, 1, 2, 2], &device);
        let _ = registry.on_forward(&LayerPath::new("features.0.conv"), x);

        assert!(registry.take_activation(fwd).is_none());
    }
}
