//! Cardamom Disease Detection Server
//!
//! HTTP API in front of the cardamom classification pipeline. Exposes a
//! health check and an upload endpoint that returns the predicted disease
//! together with a Grad-CAM overlay.

mod routes;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderValue, Method},
    routing::{get, post},
    Router,
};
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use cardamom_cam::backend::{backend_name, default_device, ExplainBackend};
use cardamom_cam::inference::{InferencePipeline, PipelineConfig};
use cardamom_cam::model::{BurnModelProvider, ModelConfig};
use cardamom_cam::utils::logging::{init_logging, LogConfig, LogLevel};

use crate::state::AppState;

/// Upload size limit for /predict
const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

/// Cardamom Disease Detection Server
#[derive(Parser, Debug)]
#[command(name = "cardamom-server")]
#[command(version)]
#[command(about = "HTTP API for cardamom leaf disease detection with Grad-CAM heatmaps")]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value = "8000")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Weights file; the server starts with random weights if it is missing
    #[arg(long, env = "CARDAMOM_WEIGHTS", default_value = "models/cardamom_model")]
    weights: PathBuf,

    /// Model architecture JSON
    #[arg(long, env = "CARDAMOM_MODEL_CONFIG")]
    model_config: Option<PathBuf>,

    /// Pipeline configuration JSON
    #[arg(long, env = "CARDAMOM_PIPELINE_CONFIG")]
    config: Option<PathBuf>,

    /// Origin allowed to call the API (repeatable)
    #[arg(
        long = "allowed-origin",
        default_values = ["http://localhost:5173", "http://localhost:3000"]
    )]
    allowed_origins: Vec<String>,

    /// Enable verbose logging (overrides --log-level)
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Minimum log level: trace, debug, info, warn or error
    #[arg(long, env = "CARDAMOM_LOG_LEVEL", default_value = "info")]
    log_level: LogLevel,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize logging
    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else {
        LogConfig {
            level: cli.log_level,
            ..LogConfig::production()
        }
    };
    init_logging(&log_config).map_err(|e| anyhow::anyhow!(e))?;

    info!("Cardamom Disease Detection Server v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration:");
    info!("  Backend:     {}", backend_name());
    info!("  Log level:   {}", log_config.level);
    info!("  Weights:     {:?}", cli.weights);
    info!("  CORS:        {:?}", cli.allowed_origins);

    let model_config = match &cli.model_config {
        Some(path) => ModelConfig::load(path)
            .with_context(|| format!("Failed to read model config {:?}", path))?,
        None => ModelConfig::default(),
    };
    let pipeline_config = match &cli.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("Failed to read pipeline config {:?}", path))?,
        None => PipelineConfig::default(),
    };

    // Load model; missing weights fall back to random initialization
    let device = default_device();
    let provider = BurnModelProvider::<ExplainBackend>::load(
        &model_config,
        Some(cli.weights.as_path()),
        &device,
    )?;
    let pipeline = InferencePipeline::new(Arc::new(provider), pipeline_config)?;

    // A model without a usable convolution can never explain anything
    pipeline
        .startup_check()
        .context("Model has no layer suitable for Grad-CAM")?;

    let state = Arc::new(AppState::new(pipeline));
    info!("Model status: {}", state.model_status());

    let origins = cli
        .allowed_origins
        .iter()
        .map(|origin| {
            origin
                .parse::<HeaderValue>()
                .with_context(|| format!("Invalid origin '{}'", origin))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    // Build router
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/predict", post(routes::predict::predict))
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(Any),
        );

    // Start server
    let addr: SocketAddr = format!("{}:{}", cli.host, cli.port).parse()?;
    info!("Starting server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
