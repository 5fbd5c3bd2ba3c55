//! HTTP route handlers

pub mod health;
pub mod predict;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use cardamom_cam::backend::{default_device, ExplainBackend};
    use cardamom_cam::inference::{InferencePipeline, PipelineConfig};
    use cardamom_cam::model::{BurnModelProvider, ModelConfig};

    use crate::state::{AppState, SharedState};

    /// State around a small untrained model
    pub fn untrained_state() -> SharedState {
        let provider =
            BurnModelProvider::<ExplainBackend>::random(&ModelConfig::tiny(), &default_device())
                .unwrap();
        let pipeline = InferencePipeline::new(Arc::new(provider), PipelineConfig::default()).unwrap();
        Arc::new(AppState::new(pipeline))
    }
}
