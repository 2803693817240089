//! Threshold-based multi-label evaluation.
//!
//! Labels are scored independently: `P = sigmoid(logit)` per label, and a
//! label counts as predicted present iff `P >= threshold`. This is a
//! multi-label decision, not a multi-class one; several labels (or none)
//! may be present for one example.

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::encoder::Encoder;
use crate::dataset::Example;
use crate::error::Result;
use crate::sampler::collate;
use crate::scorer::{bce_with_logits, Scorer};
use crate::vocab::Vocabulary;

/// One evaluation pass over the held-out split. Immutable once computed;
/// appended to the run's metric history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalMetrics {
    /// Mean BCE loss over the split.
    pub loss: f64,
    /// Fraction of examples whose full predicted label set equals the
    /// ground-truth set.
    pub exact_match: f64,
    /// Precision pooled over all example-label cells.
    pub micro_precision: f64,
    /// Recall pooled over all example-label cells.
    pub micro_recall: f64,
    /// F1 pooled over all example-label cells.
    pub micro_f1: f64,
    /// Per-label F1 averaged uniformly; protects rare tactics from being
    /// drowned out by majority labels.
    pub macro_f1: f64,
    /// Examples evaluated.
    pub examples: usize,
}

/// Runs the scorer in inference mode over a held-out split.
pub struct Evaluator {
    threshold: f64,
    batch_size: usize,
}

impl Evaluator {
    /// Create an evaluator with the configured decision threshold.
    #[must_use]
    pub fn new(threshold: f64, batch_size: usize) -> Self {
        Self {
            threshold,
            batch_size: batch_size.max(1),
        }
    }

    /// Evaluate the scorer over a split. Logits are detached: no gradient
    /// state is built or mutated.
    ///
    /// An empty split produces zeroed metrics with `examples == 0` rather
    /// than an error, so degenerate stores still complete a run.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or a forward pass fails.
    pub fn evaluate(
        &self,
        scorer: &dyn Scorer,
        split: &[Example],
        encoder: &Encoder,
        vocab: &Vocabulary,
        device: &Device,
    ) -> Result<EvalMetrics> {
        if split.is_empty() {
            return Ok(EvalMetrics {
                loss: 0.0,
                exact_match: 0.0,
                micro_precision: 0.0,
                micro_recall: 0.0,
                micro_f1: 0.0,
                macro_f1: 0.0,
                examples: 0,
            });
        }

        let mut all_probs: Vec<Vec<f32>> = Vec::with_capacity(split.len());
        let mut all_truth: Vec<Vec<f32>> = Vec::with_capacity(split.len());
        let mut loss_sum = 0.0f64;

        for chunk in split.chunks(self.batch_size) {
            let mut encoded = Vec::with_capacity(chunk.len());
            for example in chunk {
                let (enc, _) = encoder.encode_example(example, vocab)?;
                encoded.push(enc);
            }
            let batch = collate(&encoded, 0, device)?;

            let logits = scorer.forward(&batch)?.detach();
            let loss: f32 = bce_with_logits(&logits, &batch.labels)?.to_scalar()?;
            loss_sum += f64::from(loss) * chunk.len() as f64;

            let probs = candle_nn::ops::sigmoid(&logits)?.to_vec2::<f32>()?;
            all_probs.extend(probs);
            all_truth.extend(encoded.into_iter().map(|e| e.label_vector));
        }

        let mut metrics = compute_metrics(&all_probs, &all_truth, self.threshold);
        metrics.loss = loss_sum / split.len() as f64;
        Ok(metrics)
    }

    /// The decision threshold in use.
    #[must_use]
    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

/// Compute threshold-based multi-label metrics from per-example label
/// probabilities and ground truth. `loss` is left at zero for the caller.
#[must_use]
pub fn compute_metrics(probs: &[Vec<f32>], truths: &[Vec<f32>], threshold: f64) -> EvalMetrics {
    let examples = probs.len();
    if examples == 0 {
        return EvalMetrics {
            loss: 0.0,
            exact_match: 0.0,
            micro_precision: 0.0,
            micro_recall: 0.0,
            micro_f1: 0.0,
            macro_f1: 0.0,
            examples: 0,
        };
    }
    let num_labels = probs[0].len();

    let mut exact = 0usize;
    let mut label_tp = vec![0usize; num_labels];
    let mut label_fp = vec![0usize; num_labels];
    let mut label_fn = vec![0usize; num_labels];

    for (prob_row, truth_row) in probs.iter().zip(truths.iter()) {
        let mut row_exact = true;
        for label in 0..num_labels {
            let predicted = f64::from(prob_row[label]) >= threshold;
            let actual = truth_row[label] >= 0.5;
            match (predicted, actual) {
                (true, true) => label_tp[label] += 1,
                (true, false) => {
                    label_fp[label] += 1;
                    row_exact = false;
                }
                (false, true) => {
                    label_fn[label] += 1;
                    row_exact = false;
                }
                (false, false) => {}
            }
        }
        if row_exact {
            exact += 1;
        }
    }

    let tp: usize = label_tp.iter().sum();
    let fp: usize = label_fp.iter().sum();
    let fn_: usize = label_fn.iter().sum();

    let micro_precision = safe_div(tp, tp + fp);
    let micro_recall = safe_div(tp, tp + fn_);
    let micro_f1 = safe_div(2 * tp, 2 * tp + fp + fn_);

    // Macro: per-label F1 averaged uniformly. A label with no positive
    // instances and no false positives contributes 0 by convention rather
    // than an undefined value.
    let macro_f1 = (0..num_labels)
        .map(|l| safe_div(2 * label_tp[l], 2 * label_tp[l] + label_fp[l] + label_fn[l]))
        .sum::<f64>()
        / num_labels as f64;

    EvalMetrics {
        loss: 0.0,
        exact_match: exact as f64 / examples as f64,
        micro_precision,
        micro_recall,
        micro_f1,
        macro_f1,
        examples,
    }
}

fn safe_div(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Top-k labels by probability for one example, highest first. Used for
/// human inspection of predictions, not for metric computation.
#[must_use]
pub fn top_k<'v>(probs: &[f32], vocab: &'v Vocabulary, k: usize) -> Vec<(&'v str, f32)> {
    let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    indexed
        .into_iter()
        .take(k)
        .map(|(i, p)| (vocab.label_at(i), p))
        .collect()
}
