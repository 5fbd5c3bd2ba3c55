//! Error Handling Module
//!
//! Defines the error taxonomy for the classification and explanation pipeline.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Main error type for cardamom classification and explanation
#[derive(Error, Debug)]
pub enum CardamomError {
    /// Input is not a decodable raster image, or has the wrong content type
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// Neither target-layer search rule found a convolutional layer
    #[error("No convolutional layer found in model '{0}'")]
    NoConvolutionalLayerFound(String),

    /// The backward pass could not produce the gradient snapshot
    #[error("Gradient computation failed: {0}")]
    GradientComputationFailed(String),

    /// Requested class index is outside the classifier's output
    #[error("Target class {index} is out of range for {num_classes} classes")]
    InvalidTargetClass { index: usize, num_classes: usize },

    /// Error with model construction or weights
    #[error("Model error: {0}")]
    Model(String),

    /// Error while running the model
    #[error("Inference error: {0}")]
    Inference(String),

    /// Error while rendering or encoding the overlay
    #[error("Render error: {0}")]
    Render(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Whether an error is the caller's fault or ours
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Client,
    Server,
}

impl CardamomError {
    /// Classify the error for the caller-facing boundary
    pub fn kind(&self) -> ErrorKind {
        match self {
            CardamomError::InvalidImage(_) | CardamomError::InvalidTargetClass { .. } => {
                ErrorKind::Client
            }
            _ => ErrorKind::Server,
        }
    }

    /// Short stable label for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            CardamomError::InvalidImage(_) => "invalid_image",
            CardamomError::NoConvolutionalLayerFound(_) => "no_convolutional_layer",
            CardamomError::GradientComputationFailed(_) => "gradient_computation_failed",
            CardamomError::InvalidTargetClass { .. } => "invalid_target_class",
            CardamomError::Model(_) => "model",
            CardamomError::Inference(_) => "inference",
            CardamomError::Render(_) => "render",
            CardamomError::Config(_) => "config",
            CardamomError::Io(_) => "io",
            CardamomError::Serialization(_) => "serialization",
        }
    }

    /// Message that is safe to hand to an untrusted caller.
    ///
    /// Client errors describe what was wrong with the input. Server errors
    /// only name the failure class; the full message stays in the logs.
    pub fn public_detail(&self) -> String {
        match self {
            CardamomError::InvalidImage(msg) => format!("File must be an image: {}", msg),
            CardamomError::InvalidTargetClass { .. } => self.to_string(),
            CardamomError::NoConvolutionalLayerFound(_) => {
                "Model is misconfigured: no convolutional layer available for explanation"
                    .to_string()
            }
            CardamomError::GradientComputationFailed(_) => {
                "Could not compute the explanation heatmap".to_string()
            }
            _ => "Error processing image".to_string(),
        }
    }
}

/// Convenience Result type for cardamom operations
pub type Result<T> = std::result::Result<T, CardamomError>;

/// Extension trait for adding context to errors
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, msg: &str) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, msg: &str) -> Result<T> {
        self.map_err(|e| CardamomError::Inference(format!("{}: {}", msg, e)))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| CardamomError::Inference(format!("{}: {}", f(), e)))
    }
}

impl<T> ResultExt<T> for Option<T> {
    fn context(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| CardamomError::Inference(msg.to_string()))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.ok_or_else(|| CardamomError::Inference(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CardamomError::GradientComputationFailed("no graph".to_string());
        assert_eq!(format!("{}", err), "Gradient computation failed: no graph");
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            CardamomError::InvalidImage("bad".into()).kind(),
            ErrorKind::Client
        );
        assert_eq!(
            CardamomError::NoConvolutionalLayerFound("m".into()).kind(),
            ErrorKind::Server
        );
        assert_eq!(
            CardamomError::Inference("x".into()).kind(),
            ErrorKind::Server
        );
    }

    #[test]
    fn test_public_detail_hides_internal_messages() {
        let err = CardamomError::Inference("tensor at 0x7ffd shape mismatch".to_string());
        assert!(!err.public_detail().contains("0x7ffd"));

        let err = CardamomError::GradientComputationFailed("leaf missing".to_string());
        assert!(!err.public_detail().contains("leaf"));
    }

    #[test]
    fn test_result_context() {
        let result: std::result::Result<i32, std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"));

        let with_context = result.context("Failed to read file");
        assert!(matches!(with_context, Err(CardamomError::Inference(_))));
    }

    #[test]
    fn test_option_context() {
        let opt: Option<i32> = None;
        assert!(opt.context("Value was None").is_err());
    }
}
