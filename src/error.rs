//! Error types for continual-rs.
//!
//! Every fallible operation in the crate returns [`Result`]. Errors raised while
//! constructing a strategy or one of its plugins are propagated unchanged to the
//! caller; nothing in the training loop attempts local recovery.
//!
//! # Example - Pattern Matching
//!
//! ```rust
//! use continual_rs::{ContinualError, ExperimentConfig};
//!
//! # fn main() {
//! match ExperimentConfig::from_preset("invalid-preset") {
//!     Ok(_) => println!("Loaded config"),
//!     Err(ContinualError::Config(msg)) => {
//!         eprintln!("Configuration error: {}", msg);
//!     }
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! # }
//! ```

use thiserror::Error;

/// Result type alias for continual-rs operations.
pub type Result<T> = std::result::Result<T, ContinualError>;

/// Errors that can occur in continual-rs.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ContinualError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Model structure error (missing layer, bad shape).
    #[error("model error: {0}")]
    Model(String),

    /// Dataset error.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Scenario construction error.
    #[error("scenario error: {0}")]
    Scenario(String),

    /// Training loop error.
    #[error("training error: {0}")]
    Training(String),

    /// A plugin rejected the current strategy state.
    #[error("plugin `{plugin}` failed: {detail}")]
    Plugin {
        /// Name of the failing plugin.
        plugin: String,
        /// What went wrong.
        detail: String,
    },

    /// Evaluation error.
    #[error("evaluation error: {0}")]
    Evaluation(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl ContinualError {
    /// Create a plugin error.
    pub fn plugin(plugin: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Plugin {
            plugin: plugin.into(),
            detail: detail.into(),
        }
    }
}

impl From<indicatif::style::TemplateError> for ContinualError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        ContinualError::Template(err.to_string())
    }
}
