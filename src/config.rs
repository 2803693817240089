//! Configuration parsing and validation.
//!
//! A run is described by a single immutable [`TacticConfig`], loaded from
//! YAML and passed by reference into the trainer, evaluator and exporter.
//! There is no process-wide mutable configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TacticError};

/// Main configuration for a training run.
///
/// # Example
///
/// ```rust
/// use tactic_trainer_rs::TacticConfig;
///
/// let mut config = TacticConfig::default();
/// config.encoder.tokenizer_path = "tokenizer.json".to_string();
/// config.dataset.path = "data/problems.json".to_string();
/// config.training.epochs = 5;
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TacticConfig {
    /// Encoder (tokenizer) configuration.
    pub encoder: EncoderConfig,

    /// Path to a JSON vocabulary sidecar. When absent, the built-in default
    /// substitution vocabulary is used.
    #[serde(default)]
    pub vocab_path: Option<String>,

    /// Dataset configuration.
    pub dataset: DatasetConfig,

    /// Scorer (model) configuration.
    #[serde(default)]
    pub model: ModelConfig,

    /// Training hyperparameters.
    #[serde(default)]
    pub training: TrainingConfig,

    /// Evaluation settings.
    #[serde(default)]
    pub eval: EvalConfig,

    /// Model selection / early stopping settings.
    #[serde(default)]
    pub selection: SelectionConfig,

    /// Output directory for checkpoints, history and export artifacts.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Random seed for shuffling and initialization. When absent, shuffling
    /// is entropy-seeded and runs are not reproducible.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_output_dir() -> String {
    "./outputs".into()
}

/// Tokenizer configuration, also recorded in checkpoints and export
/// manifests so restores can reject an incompatible encoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Path to a `tokenizers` JSON file.
    pub tokenizer_path: String,

    /// Fixed sequence length: statements are truncated then padded to this.
    #[serde(default = "default_max_length")]
    pub max_length: usize,
}

fn default_max_length() -> usize {
    256
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            tokenizer_path: String::new(),
            max_length: default_max_length(),
        }
    }
}

/// Example store configuration. The store is a JSON array or JSONL file of
/// records with a statement field and a label-list field; its production is
/// an external collaborator's concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Path to the example store (JSON array or JSONL).
    pub path: String,

    /// Field containing the problem statement.
    #[serde(default = "default_statement_field")]
    pub statement_field: String,

    /// Field containing the applicable-tactic list.
    #[serde(default = "default_labels_field")]
    pub labels_field: String,

    /// Validation split ratio.
    #[serde(default = "default_val_split")]
    pub val_split: f64,
}

fn default_statement_field() -> String {
    "statement".into()
}
fn default_labels_field() -> String {
    "substitutions".into()
}
fn default_val_split() -> f64 {
    0.15
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            statement_field: default_statement_field(),
            labels_field: default_labels_field(),
            val_split: default_val_split(),
        }
    }
}

/// Scorer architecture settings. The trainer treats the scorer as opaque;
/// these are consumed by the scorer factory and recorded in export manifests
/// so artifacts can be rebuilt for verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Token-embedding vocabulary size; must cover the tokenizer's id space.
    #[serde(default = "default_token_vocab_size")]
    pub token_vocab_size: usize,

    /// Embedding / pooled representation width.
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,

    /// Width of the classification head's intermediate layer.
    #[serde(default = "default_intermediate_size")]
    pub intermediate_size: usize,

    /// Optional safetensors file to warm-start from. A configured path that
    /// cannot be loaded is a configuration error, never a silent fallback.
    #[serde(default)]
    pub pretrained: Option<String>,
}

fn default_token_vocab_size() -> usize {
    30522
}
fn default_hidden_size() -> usize {
    256
}
fn default_intermediate_size() -> usize {
    512
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            token_vocab_size: default_token_vocab_size(),
            hidden_size: default_hidden_size(),
            intermediate_size: default_intermediate_size(),
            pretrained: None,
        }
    }
}

/// Training hyperparameters.
///
/// Defaults mirror the production run: effective batch 32 via accumulation,
/// cosine schedule with 10% warmup, global gradient-norm clipping at 1.0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Number of training epochs.
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Micro-batch size.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Gradient accumulation steps `K`; effective batch = `batch_size * K`.
    #[serde(default = "default_accumulation_steps")]
    pub accumulation_steps: usize,

    /// Learning rate.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    /// AdamW weight decay.
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,

    /// Fraction of total optimizer steps spent in linear warmup.
    #[serde(default = "default_warmup_ratio")]
    pub warmup_ratio: f64,

    /// Learning-rate schedule after warmup.
    #[serde(default)]
    pub lr_scheduler: LrScheduler,

    /// Global gradient-norm clipping threshold.
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: f64,

    /// Run forward/backward in reduced precision with dynamic loss scaling.
    #[serde(default)]
    pub mixed_precision: bool,

    /// Log step metrics every N optimizer steps.
    #[serde(default = "default_logging_steps")]
    pub logging_steps: usize,

    /// Encoded batches the prefetch worker may buffer ahead of the trainer.
    #[serde(default = "default_prefetch_batches")]
    pub prefetch_batches: usize,
}

fn default_epochs() -> usize {
    50
}
fn default_batch_size() -> usize {
    16
}
fn default_accumulation_steps() -> usize {
    2
}
fn default_learning_rate() -> f64 {
    2e-5
}
fn default_weight_decay() -> f64 {
    0.01
}
fn default_warmup_ratio() -> f64 {
    0.1
}
fn default_max_grad_norm() -> f64 {
    1.0
}
fn default_logging_steps() -> usize {
    10
}
fn default_prefetch_batches() -> usize {
    2
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            accumulation_steps: default_accumulation_steps(),
            learning_rate: default_learning_rate(),
            weight_decay: default_weight_decay(),
            warmup_ratio: default_warmup_ratio(),
            lr_scheduler: LrScheduler::default(),
            max_grad_norm: default_max_grad_norm(),
            mixed_precision: false,
            logging_steps: default_logging_steps(),
            prefetch_batches: default_prefetch_batches(),
        }
    }
}

/// Learning-rate schedule shape after warmup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LrScheduler {
    /// Constant learning rate (no warmup, no decay).
    Constant,
    /// Linear warmup then linear decay to zero.
    Linear,
    /// Linear warmup then cosine decay to zero.
    #[default]
    Cosine,
}

/// Evaluation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    /// Probability threshold above which a label counts as predicted present.
    /// Kept configurable rather than hard-coded; per-label calibration is an
    /// open question upstream.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

fn default_threshold() -> f64 {
    0.5
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
        }
    }
}

/// Which evaluation metric drives best-checkpoint selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionMetric {
    /// Validation loss, minimized.
    EvalLoss,
    /// Micro-averaged F1, maximized.
    #[default]
    MicroF1,
    /// Exact-match rate, maximized.
    ExactMatch,
}

/// Model selection and early-stopping settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// Metric used to decide whether an epoch improved on the best so far.
    #[serde(default)]
    pub metric: SelectionMetric,

    /// Non-improving epochs tolerated before stopping early.
    #[serde(default = "default_patience")]
    pub patience: usize,

    /// Minimum improvement over the best metric that counts as progress.
    #[serde(default = "default_min_delta")]
    pub min_delta: f64,

    /// Persist a periodic checkpoint every N epochs regardless of metric
    /// improvement, to support resuming interrupted runs.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,
}

fn default_patience() -> usize {
    5
}
fn default_min_delta() -> f64 {
    1e-3
}
fn default_checkpoint_interval() -> usize {
    2
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            metric: SelectionMetric::default(),
            patience: default_patience(),
            min_delta: default_min_delta(),
            checkpoint_interval: default_checkpoint_interval(),
        }
    }
}

impl Default for TacticConfig {
    fn default() -> Self {
        Self {
            encoder: EncoderConfig::default(),
            vocab_path: None,
            dataset: DatasetConfig::default(),
            model: ModelConfig::default(),
            training: TrainingConfig::default(),
            eval: EvalConfig::default(),
            selection: SelectionConfig::default(),
            output_dir: default_output_dir(),
            seed: Some(42),
        }
    }
}

impl TacticConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&raw)?;
        Ok(config)
    }

    /// Write configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path.as_ref(), yaml)?;
        Ok(())
    }

    /// Validate hyperparameter ranges before training starts.
    ///
    /// # Errors
    ///
    /// Returns [`TacticError::Config`] naming the first out-of-range option.
    pub fn validate(&self) -> Result<()> {
        if self.encoder.tokenizer_path.is_empty() {
            return Err(TacticError::Config(
                "encoder.tokenizer_path must be set".to_string(),
            ));
        }
        if self.encoder.max_length == 0 {
            return Err(TacticError::Config(
                "encoder.max_length must be at least 1".to_string(),
            ));
        }
        if self.dataset.path.is_empty() {
            return Err(TacticError::Config("dataset.path must be set".to_string()));
        }
        if !(0.0..1.0).contains(&self.dataset.val_split) || self.dataset.val_split == 0.0 {
            return Err(TacticError::Config(format!(
                "dataset.val_split must be in (0, 1), got {}",
                self.dataset.val_split
            )));
        }
        if self.training.epochs == 0 {
            return Err(TacticError::Config(
                "training.epochs must be at least 1".to_string(),
            ));
        }
        if self.training.batch_size == 0 {
            return Err(TacticError::Config(
                "training.batch_size must be at least 1".to_string(),
            ));
        }
        if self.training.accumulation_steps == 0 {
            return Err(TacticError::Config(
                "training.accumulation_steps must be at least 1".to_string(),
            ));
        }
        if !self.training.learning_rate.is_finite() || self.training.learning_rate <= 0.0 {
            return Err(TacticError::Config(format!(
                "training.learning_rate must be positive and finite, got {}",
                self.training.learning_rate
            )));
        }
        if !(0.0..=1.0).contains(&self.training.warmup_ratio) {
            return Err(TacticError::Config(format!(
                "training.warmup_ratio must be in [0, 1], got {}",
                self.training.warmup_ratio
            )));
        }
        if self.training.max_grad_norm <= 0.0 {
            return Err(TacticError::Config(format!(
                "training.max_grad_norm must be positive, got {}",
                self.training.max_grad_norm
            )));
        }
        if !(0.0..1.0).contains(&self.eval.threshold) || self.eval.threshold == 0.0 {
            return Err(TacticError::Config(format!(
                "eval.threshold must be in (0, 1), got {}",
                self.eval.threshold
            )));
        }
        if self.selection.checkpoint_interval == 0 {
            return Err(TacticError::Config(
                "selection.checkpoint_interval must be at least 1".to_string(),
            ));
        }
        if self.model.hidden_size == 0 || self.model.intermediate_size == 0 {
            return Err(TacticError::Config(
                "model.hidden_size and model.intermediate_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
