//! Error types for tactic-trainer-rs.
//!
//! Fatal errors ([`TacticError::Config`], [`TacticError::Numeric`],
//! [`TacticError::Checkpoint`]) abort the run with a diagnostic naming the
//! violated contract. [`TacticError::Export`] is fatal for the export step only
//! and does not invalidate the checkpoint it was produced from. Malformed
//! dataset records are recovered locally at load time (skipped and counted)
//! and never surface as a [`TacticError::Data`] unless the whole store is
//! unreadable.
//!
//! # Example
//!
//! ```rust
//! use tactic_trainer_rs::{TacticError, Result};
//!
//! fn validate_threshold(t: f64) -> Result<()> {
//!     if !(0.0..1.0).contains(&t) {
//!         return Err(TacticError::Config(format!(
//!             "eval threshold must be in (0, 1), got {t}"
//!         )));
//!     }
//!     Ok(())
//! }
//!
//! assert!(validate_threshold(1.5).is_err());
//! assert!(validate_threshold(0.5).is_ok());
//! ```

use thiserror::Error;

/// Result type alias for tactic-trainer-rs operations.
pub type Result<T> = std::result::Result<T, TacticError>;

/// Errors that can occur in tactic-trainer-rs.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TacticError {
    /// Configuration error: invalid hyperparameters, duplicate vocabulary
    /// entries, missing tokenizer. Surfaced before training starts.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Dataset error: the example store itself is unreadable or empty.
    /// Individual malformed records are skipped and counted instead.
    #[error("dataset error: {0}")]
    Data(String),

    /// Numeric instability: a non-finite loss not attributable to loss-scale
    /// overflow. Fatal, since continuing would corrupt all subsequent steps.
    #[error("numeric instability: {0}")]
    Numeric(String),

    /// Training orchestration error (component used before initialization,
    /// tensor bookkeeping failure).
    #[error("training error: {0}")]
    Training(String),

    /// Checkpoint error: incompatible restore (vocabulary, encoder config or
    /// parameter-shape mismatch) or unreadable checkpoint files. Never
    /// partially applied.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Export error: round-trip tolerance exceeded or artifact write failure.
    /// Fatal for the export step only.
    #[error("export error: {0}")]
    Export(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Tokenizer error.
    #[error("tokenizer error: {0}")]
    Tokenizer(#[from] tokenizers::Error),

    /// JSON serialization error.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl From<indicatif::style::TemplateError> for TacticError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        TacticError::Template(err.to_string())
    }
}
