//! Cardamom CAM CLI
//!
//! Classify a leaf image and write its Grad-CAM overlay, inspect the model's
//! layer tree, or write fresh weights for a smoke-test deployment.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::info;

use cardamom_cam::backend::{backend_name, default_device, ExplainBackend};
use cardamom_cam::explain::locate_target_layer;
use cardamom_cam::inference::{decode_image, InferencePipeline, PipelineConfig, UNTRAINED_WARNING};
use cardamom_cam::model::{BurnModelProvider, ModelConfig, ModelProvider};
use cardamom_cam::utils::logging::{init_logging, LogConfig, LogLevel};

/// Cardamom Leaf Disease Classification with Grad-CAM
#[derive(Parser, Debug)]
#[command(name = "cardamom_cam")]
#[command(version)]
#[command(about = "Cardamom leaf disease classification with saliency overlays", long_about = None)]
struct Cli {
    /// Enable verbose logging (overrides --log-level)
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Minimum log level: trace, debug, info, warn or error
    #[arg(long, default_value = "info")]
    log_level: LogLevel,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Classify an image and explain the prediction
    Predict {
        /// Path to the input image
        #[arg(short, long)]
        input: PathBuf,

        /// Weights file (with or without the .mpk extension)
        #[arg(short, long, default_value = "models/cardamom_model")]
        weights: PathBuf,

        /// Model architecture JSON (defaults to the built-in architecture)
        #[arg(long)]
        model_config: Option<PathBuf>,

        /// Pipeline configuration JSON
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Where to write the overlay PNG
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Explain this class index instead of the predicted one
        #[arg(long)]
        class: Option<usize>,
    },

    /// Print the model's layer tree and the explanation target
    Layers {
        /// Weights file (with or without the .mpk extension)
        #[arg(short, long)]
        weights: Option<PathBuf>,

        /// Model architecture JSON
        #[arg(long)]
        model_config: Option<PathBuf>,
    },

    /// Save randomly initialised weights
    InitWeights {
        /// Output path; the recorder appends .mpk
        #[arg(short, long, default_value = "models/cardamom_model")]
        output: PathBuf,

        /// Model architecture JSON
        #[arg(long)]
        model_config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else {
        LogConfig {
            level: cli.log_level,
            ..LogConfig::default()
        }
    };
    init_logging(&log_config).map_err(|e| anyhow::anyhow!(e))?;

    match cli.command {
        Commands::Predict {
            input,
            weights,
            model_config,
            config,
            output,
            class,
        } => cmd_predict(
            &input,
            &weights,
            model_config.as_deref(),
            config.as_deref(),
            output.as_deref(),
            class,
        ),

        Commands::Layers {
            weights,
            model_config,
        } => cmd_layers(weights.as_deref(), model_config.as_deref()),

        Commands::InitWeights {
            output,
            model_config,
        } => cmd_init_weights(&output, model_config.as_deref()),
    }
}

fn load_model_config(path: Option<&Path>) -> Result<ModelConfig> {
    match path {
        Some(path) => ModelConfig::load(path)
            .with_context(|| format!("Failed to read model config {:?}", path)),
        None => Ok(ModelConfig::default()),
    }
}

fn cmd_predict(
    input: &Path,
    weights: &Path,
    model_config: Option<&Path>,
    config: Option<&Path>,
    output: Option<&Path>,
    class: Option<usize>,
) -> Result<()> {
    info!("Running prediction on {:?}", input);

    println!("{}", "Prediction Configuration:".cyan().bold());
    println!("  Input:   {}", input.display());
    println!("  Weights: {}", weights.display());
    println!("  Backend: {}", backend_name());
    println!();

    let pipeline_config = match config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("Failed to read pipeline config {:?}", path))?,
        None => PipelineConfig::default(),
    };

    let device = default_device();
    let provider =
        BurnModelProvider::<ExplainBackend>::load(&load_model_config(model_config)?, Some(weights), &device)?;
    let pipeline = InferencePipeline::new(Arc::new(provider), pipeline_config)?;
    pipeline.startup_check()?;

    let bytes = std::fs::read(input).with_context(|| format!("Failed to read {:?}", input))?;
    let image = decode_image(&bytes)?;

    println!("{}", "Running inference...".cyan());
    let result = pipeline.run_detailed(&image, class)?;
    let prediction = &result.prediction;

    println!();
    println!(
        "  Predicted: {} ({:.1}%)",
        prediction.class_name.green().bold(),
        prediction.confidence * 100.0
    );
    for score in &prediction.top_k {
        println!("    {:<24} {:>6.2}%", score.name, score.probability * 100.0);
    }
    println!(
        "  Explained: class {} at {}",
        result.target_class, result.target.path
    );
    println!("  Time:      {:.1} ms", prediction.inference_time_ms);

    if !result.model_trained {
        println!();
        println!("{} {}", "Warning:".yellow().bold(), UNTRAINED_WARNING);
    }

    if let Some(output) = output {
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(output, &result.overlay_png)
            .with_context(|| format!("Failed to write {:?}", output))?;
        println!();
        println!("  Overlay saved to: {}", output.display());
    }

    Ok(())
}

fn cmd_layers(weights: Option<&Path>, model_config: Option<&Path>) -> Result<()> {
    let device = default_device();
    let config = load_model_config(model_config)?;
    let provider = BurnModelProvider::<ExplainBackend>::load(&config, weights, &device)?;

    let tree = provider.layers();
    println!("{}", "Layer tree:".cyan().bold());
    print!("{}", tree.render());
    println!();

    let target = locate_target_layer(&tree, cardamom_cam::model::FEATURES)?;
    println!(
        "{} {} ({} channels, {:?})",
        "Explanation target:".green().bold(),
        target.path,
        target.channels,
        target.rule
    );

    let side = config.target_resolution(cardamom_cam::IMAGE_SIZE as usize);
    println!(
        "  Saliency map at {} input: {}x{}",
        cardamom_cam::IMAGE_SIZE,
        side,
        side
    );

    Ok(())
}

fn cmd_init_weights(output: &Path, model_config: Option<&Path>) -> Result<()> {
    let device = default_device();
    let config = load_model_config(model_config)?;
    let provider = BurnModelProvider::<ExplainBackend>::random(&config, &device)?;
    provider.save_weights(output)?;

    println!(
        "{} {}.mpk",
        "Saved random weights to".green().bold(),
        output.display()
    );
    println!("  These weights are untrained; predictions will be meaningless.");
    Ok(())
}
