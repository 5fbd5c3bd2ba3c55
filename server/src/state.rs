//! Application state for the cardamom server
//!
//! Holds the inference pipeline built once at startup and shared by every
//! request.

use std::sync::Arc;
use std::time::Instant;

use cardamom_cam::backend::ExplainBackend;
use cardamom_cam::inference::InferencePipeline;

/// Shared application state
pub struct AppState {
    /// Pipeline around the loaded model
    pub pipeline: InferencePipeline<ExplainBackend>,
    /// Server start time
    pub started_at: Instant,
}

impl AppState {
    pub fn new(pipeline: InferencePipeline<ExplainBackend>) -> Self {
        Self {
            pipeline,
            started_at: Instant::now(),
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn model_trained(&self) -> bool {
        self.pipeline.model_trained()
    }

    /// Human-readable weight provenance for the health endpoint
    pub fn model_status(&self) -> &'static str {
        if self.model_trained() {
            "trained"
        } else {
            "untrained (placeholder)"
        }
    }
}

pub type SharedState = Arc<AppState>;
