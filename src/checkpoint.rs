//! Model selection, early stopping, and checkpoint persistence.
//!
//! A checkpoint is a directory holding a safetensors parameter snapshot and
//! a `state.json` with everything needed to validate a restore: a full copy
//! of the label vocabulary, the encoder configuration, the step counter for
//! the LR schedule, and the metric history. Restore validates vocabulary
//! identity, encoder compatibility, and parameter shapes before anything is
//! applied; an incompatible checkpoint is rejected whole.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::{EncoderConfig, SelectionMetric};
use crate::error::{Result, TacticError};
use crate::evaluator::EvalMetrics;
use crate::scorer::Scorer;
use crate::vocab::Vocabulary;

/// Current checkpoint format version.
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Serialized alongside the weights in `state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// Checkpoint format version.
    pub format_version: u32,
    /// Epoch the checkpoint was taken at (1-based).
    pub epoch: usize,
    /// Optimizer-step counter, used to resume the LR schedule.
    pub step: usize,
    /// Learning rate at checkpoint time.
    pub learning_rate: f64,
    /// Full copy of the label vocabulary the model was trained against.
    /// Output position `i` of the scorer means `vocabulary[i]`; a restore
    /// under a different vocabulary is rejected.
    pub vocabulary: Vec<String>,
    /// Encoder configuration the model was trained with.
    pub encoder: EncoderConfig,
    /// Evaluation history up to this checkpoint.
    pub metric_history: Vec<EvalMetrics>,
}

/// Outcome of feeding one evaluation to the selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The configured metric improved by more than `min_delta`; persist a
    /// best checkpoint and reset the patience counter.
    Improved,
    /// No meaningful improvement; patience not yet exhausted.
    NoImprovement,
    /// Patience exhausted; stop training gracefully.
    Stop,
}

/// Tracks the best metric seen and the patience counter.
///
/// `patience` non-improving evaluations are tolerated; the one after that
/// stops the run. An improvement must exceed `min_delta` to count.
#[derive(Debug, Clone)]
pub struct ModelSelector {
    metric: SelectionMetric,
    min_delta: f64,
    patience: usize,
    best: Option<f64>,
    counter: usize,
}

impl ModelSelector {
    /// Create a selector for the configured metric.
    #[must_use]
    pub fn new(metric: SelectionMetric, patience: usize, min_delta: f64) -> Self {
        Self {
            metric,
            min_delta,
            patience,
            best: None,
            counter: 0,
        }
    }

    /// Best metric value observed so far.
    #[must_use]
    pub fn best(&self) -> Option<f64> {
        self.best
    }

    /// Consecutive non-improving evaluations so far.
    #[must_use]
    pub fn patience_counter(&self) -> usize {
        self.counter
    }

    fn metric_value(&self, metrics: &EvalMetrics) -> f64 {
        match self.metric {
            SelectionMetric::EvalLoss => metrics.loss,
            SelectionMetric::MicroF1 => metrics.micro_f1,
            SelectionMetric::ExactMatch => metrics.exact_match,
        }
    }

    fn improved(&self, value: f64) -> bool {
        match self.best {
            None => true,
            Some(best) => match self.metric {
                SelectionMetric::EvalLoss => value < best - self.min_delta,
                SelectionMetric::MicroF1 | SelectionMetric::ExactMatch => {
                    value > best + self.min_delta
                }
            },
        }
    }

    /// Feed one epoch's evaluation and decide what to do.
    pub fn observe(&mut self, metrics: &EvalMetrics) -> Decision {
        let value = self.metric_value(metrics);
        if self.improved(value) {
            self.best = Some(value);
            self.counter = 0;
            Decision::Improved
        } else {
            self.counter += 1;
            if self.counter > self.patience {
                Decision::Stop
            } else {
                Decision::NoImprovement
            }
        }
    }
}

/// Persists and restores checkpoints under an output directory.
pub struct Checkpointer {
    output_dir: PathBuf,
}

impl Checkpointer {
    /// Create a checkpointer rooted at the run's output directory.
    #[must_use]
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Directory for a named checkpoint (`best`, or an epoch number).
    #[must_use]
    pub fn checkpoint_dir(&self, tag: &str) -> PathBuf {
        self.output_dir.join(format!("checkpoint-{tag}"))
    }

    /// Persist a named checkpoint: weights plus metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or files cannot be written.
    pub fn save(&self, tag: &str, scorer: &dyn Scorer, meta: &CheckpointMeta) -> Result<PathBuf> {
        let dir = self.checkpoint_dir(tag);
        std::fs::create_dir_all(&dir)?;

        scorer.save_state(&dir.join("model.safetensors"))?;
        let state = serde_json::to_string_pretty(meta)?;
        std::fs::write(dir.join("state.json"), state)?;

        tracing::info!("Saved checkpoint to {}", dir.display());
        Ok(dir)
    }

    /// Read checkpoint metadata without touching any model state.
    ///
    /// # Errors
    ///
    /// Returns [`TacticError::Checkpoint`] if the metadata is missing or
    /// unparseable.
    pub fn read_meta(dir: &Path) -> Result<CheckpointMeta> {
        let state_path = dir.join("state.json");
        let raw = std::fs::read_to_string(&state_path).map_err(|e| {
            TacticError::Checkpoint(format!("cannot read {}: {e}", state_path.display()))
        })?;
        let meta: CheckpointMeta = serde_json::from_str(&raw).map_err(|e| {
            TacticError::Checkpoint(format!("cannot parse {}: {e}", state_path.display()))
        })?;
        if meta.format_version != CHECKPOINT_FORMAT_VERSION {
            return Err(TacticError::Checkpoint(format!(
                "unsupported checkpoint format version {} (expected {})",
                meta.format_version, CHECKPOINT_FORMAT_VERSION
            )));
        }
        Ok(meta)
    }

    /// Restore a checkpoint into a scorer after validating compatibility.
    ///
    /// Validation order: metadata parse, vocabulary identity, encoder
    /// configuration, parameter shapes. The scorer is only touched after all
    /// of these pass, so a failed restore is never partially applied.
    ///
    /// # Errors
    ///
    /// Returns [`TacticError::Checkpoint`] naming the violated contract.
    pub fn restore(
        dir: &Path,
        scorer: &mut dyn Scorer,
        vocab: &Vocabulary,
        encoder: &EncoderConfig,
    ) -> Result<CheckpointMeta> {
        let meta = Self::read_meta(dir)?;

        if meta.vocabulary.len() != vocab.len() {
            return Err(TacticError::Checkpoint(format!(
                "vocabulary mismatch: checkpoint has {} labels, run is configured with {}",
                meta.vocabulary.len(),
                vocab.len()
            )));
        }
        for (i, label) in meta.vocabulary.iter().enumerate() {
            if label != vocab.label_at(i) {
                return Err(TacticError::Checkpoint(format!(
                    "vocabulary mismatch at index {i}: checkpoint has {label:?}, run has {:?}",
                    vocab.label_at(i)
                )));
            }
        }
        if meta.encoder != *encoder {
            return Err(TacticError::Checkpoint(format!(
                "encoder mismatch: checkpoint was trained with {:?}, run is configured with {encoder:?}",
                meta.encoder
            )));
        }

        scorer.load_state(&dir.join("model.safetensors"))?;
        tracing::info!(
            "Restored checkpoint from {} (epoch={}, step={})",
            dir.display(),
            meta.epoch,
            meta.step
        );
        Ok(meta)
    }
}
