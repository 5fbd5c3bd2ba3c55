//! Utilities module for error types and logging
//!
//! This module provides:
//! - The error taxonomy shared by every pipeline stage
//! - Structured logging with tracing

pub mod error;
pub mod logging;

// Re-export main types for convenience
pub use error::{CardamomError, ErrorKind, Result, ResultExt};
pub use logging::{init_logging, LogConfig};

/// Format a duration in milliseconds for log lines
pub fn format_millis(seconds: f64) -> String {
    if seconds < 1.0 {
        format!("{:.1} ms", seconds * 1000.0)
    } else {
        format!("{:.2} s", seconds)
    }
}
