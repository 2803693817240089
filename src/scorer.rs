//! The scorer: an opaque parametric function from token ids to per-label
//! logits.
//!
//! The trainer, evaluator and exporter only see the [`Scorer`] trait, so the
//! concrete architecture can be swapped without touching orchestration code.
//! The bundled [`TacticClassifier`] is a pooled text classifier: token
//! embedding, mask-weighted mean pooling, and a two-layer head producing one
//! logit per vocabulary label. Master weights always live in FP32; reduced
//! precision casts activations and weight copies at compute time.

use std::path::Path;

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{embedding, linear, Embedding, Linear, Module, VarBuilder, VarMap};

use crate::amp::Precision;
use crate::config::ModelConfig;
use crate::error::{Result, TacticError};
use crate::sampler::Batch;

/// Capability interface for the neural scorer.
pub trait Scorer: Send {
    /// Score a batch: `[batch, seq_len]` ids and mask in, `[batch, N]` f32
    /// logits out. Building the autograd graph is implicit; callers that do
    /// not backpropagate should detach the result.
    fn forward(&self, batch: &Batch) -> Result<Tensor>;

    /// The parameter store backing this scorer.
    fn parameters(&self) -> &VarMap;

    /// Snapshot parameters to a safetensors file.
    fn save_state(&self, path: &Path) -> Result<()>;

    /// Restore parameters from a safetensors file.
    ///
    /// Shape validation happens before anything is applied: an incompatible
    /// file leaves the scorer untouched.
    fn load_state(&mut self, path: &Path) -> Result<()>;

    /// Select the compute precision for subsequent forward passes.
    fn set_precision(&mut self, precision: Precision);

    /// Output dimensionality `N`.
    fn num_labels(&self) -> usize;
}

/// Pooled text classifier over a fixed label vocabulary.
pub struct TacticClassifier {
    embeddings: Embedding,
    dense: Linear,
    head: Linear,
    varmap: VarMap,
    num_labels: usize,
    precision: Precision,
}

impl TacticClassifier {
    /// Build a randomly initialized classifier.
    ///
    /// # Errors
    ///
    /// Returns an error if parameter creation fails.
    pub fn new(config: &ModelConfig, num_labels: usize, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let embeddings = embedding(config.token_vocab_size, config.hidden_size, vb.pp("embed"))?;
        let dense = linear(config.hidden_size, config.intermediate_size, vb.pp("dense"))?;
        let head = linear(config.intermediate_size, num_labels, vb.pp("head"))?;

        Ok(Self {
            embeddings,
            dense,
            head,
            varmap,
            num_labels,
            precision: Precision::Fp32,
        })
    }

    /// Linear layer application with weights cast to the compute dtype. The
    /// FP32 master weights stay the autograd leaves; gradients flow back
    /// through the cast.
    fn linear_in(&self, layer: &Linear, input: &Tensor, dtype: DType) -> Result<Tensor> {
        if dtype == DType::F32 {
            return Ok(layer.forward(input)?);
        }
        let weight = layer.weight().to_dtype(dtype)?;
        let out = input.matmul(&weight.t()?)?;
        match layer.bias() {
            Some(bias) => Ok(out.broadcast_add(&bias.to_dtype(dtype)?)?),
            None => Ok(out),
        }
    }
}

impl Scorer for TacticClassifier {
    fn forward(&self, batch: &Batch) -> Result<Tensor> {
        let dtype = self.precision.dtype();

        let hidden = self.embeddings.forward(&batch.token_ids)?; // [B, S, H]
        let mask = batch.attention_mask.unsqueeze(D::Minus1)?; // [B, S, 1] f32

        // Mask-weighted mean pooling. Every encoded statement has at least
        // one real token, so the count is never zero; the clamp guards
        // manually built all-pad batches in tests.
        let counts = mask.sum(1)?.clamp(1e-4f32, f32::MAX)?; // [B, 1] f32
        let (hidden, mask, counts) = if dtype == DType::F32 {
            (hidden, mask, counts)
        } else {
            (
                hidden.to_dtype(dtype)?,
                mask.to_dtype(dtype)?,
                counts.to_dtype(dtype)?,
            )
        };
        let summed = hidden.broadcast_mul(&mask)?.sum(1)?; // [B, H]
        let pooled = summed.broadcast_div(&counts)?;

        let hidden = self.linear_in(&self.dense, &pooled, dtype)?.relu()?;
        let logits = self.linear_in(&self.head, &hidden, dtype)?;
        Ok(logits.to_dtype(DType::F32)?)
    }

    fn parameters(&self) -> &VarMap {
        &self.varmap
    }

    fn save_state(&self, path: &Path) -> Result<()> {
        self.varmap.save(path)?;
        Ok(())
    }

    fn load_state(&mut self, path: &Path) -> Result<()> {
        validate_state_shapes(&self.varmap, path)?;
        self.varmap.load(path).map_err(|e| {
            TacticError::Checkpoint(format!("failed to load weights from {path:?}: {e}"))
        })?;
        Ok(())
    }

    fn set_precision(&mut self, precision: Precision) {
        self.precision = precision;
    }

    fn num_labels(&self) -> usize {
        self.num_labels
    }
}

/// Check that a safetensors file carries exactly the tensors this varmap
/// expects, with matching shapes, before any value is applied.
///
/// # Errors
///
/// Returns [`TacticError::Checkpoint`] naming the first offending tensor.
pub fn validate_state_shapes(varmap: &VarMap, path: &Path) -> Result<()> {
    let stored = candle_core::safetensors::load(path, &Device::Cpu).map_err(|e| {
        TacticError::Checkpoint(format!("cannot read weight file {path:?}: {e}"))
    })?;
    let data = varmap.data().lock().expect("varmap lock poisoned");
    for (name, var) in data.iter() {
        match stored.get(name) {
            None => {
                return Err(TacticError::Checkpoint(format!(
                    "weight file {path:?} is missing tensor {name:?}"
                )));
            }
            Some(tensor) if tensor.dims() != var.dims() => {
                return Err(TacticError::Checkpoint(format!(
                    "shape mismatch for tensor {name:?}: checkpoint has {:?}, model expects {:?}",
                    tensor.dims(),
                    var.dims()
                )));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Builds scorers with an explicit, logged fallback order instead of ad hoc
/// exception swallowing:
///
/// 1. `model.pretrained` set and loadable → warm-started classifier;
/// 2. `model.pretrained` set but missing or incompatible → [`TacticError::Config`];
/// 3. no pretrained path → fresh random initialization.
pub struct ScorerFactory;

impl ScorerFactory {
    /// Build a scorer for the given configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TacticError::Config`] when a configured warm-start file
    /// cannot be used.
    pub fn build(
        config: &ModelConfig,
        num_labels: usize,
        device: &Device,
    ) -> Result<Box<dyn Scorer>> {
        let mut classifier = TacticClassifier::new(config, num_labels, device)?;
        match &config.pretrained {
            Some(path) => {
                let path = Path::new(path);
                if !path.exists() {
                    return Err(TacticError::Config(format!(
                        "pretrained weights not found: {path:?}"
                    )));
                }
                classifier.load_state(path).map_err(|e| {
                    TacticError::Config(format!("cannot warm-start from {path:?}: {e}"))
                })?;
                tracing::info!("Warm-started scorer from {}", path.display());
            }
            None => {
                tracing::info!(
                    "Initialized scorer from scratch ({} hidden, {} labels)",
                    config.hidden_size,
                    num_labels
                );
            }
        }
        Ok(Box::new(classifier))
    }
}

/// Numerically stable binary cross-entropy with logits, averaged over every
/// label-example cell: `max(x, 0) - x*z + ln(1 + exp(-|x|))`.
///
/// This is the multi-label objective; each label is an independent binary
/// decision.
///
/// # Errors
///
/// Returns an error if a tensor operation fails.
pub fn bce_with_logits(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let max_part = logits.relu()?;
    let prod = (logits * targets)?;
    let log_part = ((logits.abs()?.neg()?.exp()? + 1.0)?).log()?;
    let loss = ((max_part - prod)? + log_part)?;
    Ok(loss.mean_all()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::collate;
    use crate::encoder::EncodedExample;
    use tempfile::TempDir;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            token_vocab_size: 32,
            hidden_size: 8,
            intermediate_size: 12,
            pretrained: None,
        }
    }

    fn tiny_batch(device: &Device) -> Batch {
        let examples = vec![
            EncodedExample {
                token_ids: vec![2, 3, 4, 0],
                attention_mask: vec![1.0, 1.0, 1.0, 0.0],
                label_vector: vec![1.0, 0.0, 1.0],
            },
            EncodedExample {
                token_ids: vec![5, 6, 0, 0],
                attention_mask: vec![1.0, 1.0, 0.0, 0.0],
                label_vector: vec![0.0, 1.0, 0.0],
            },
        ];
        collate(&examples, 0, device).unwrap()
    }

    #[test]
    fn test_forward_shape() {
        let device = Device::Cpu;
        let scorer = TacticClassifier::new(&tiny_config(), 3, &device).unwrap();
        let batch = tiny_batch(&device);
        let logits = scorer.forward(&batch).unwrap();
        assert_eq!(logits.dims(), &[2, 3]);
        assert_eq!(logits.dtype(), DType::F32);
    }

    #[test]
    fn test_forward_reduced_precision_returns_f32_logits() {
        let device = Device::Cpu;
        let mut scorer = TacticClassifier::new(&tiny_config(), 3, &device).unwrap();
        scorer.set_precision(Precision::Fp16);
        let batch = tiny_batch(&device);
        let logits = scorer.forward(&batch).unwrap();
        assert_eq!(logits.dims(), &[2, 3]);
        assert_eq!(logits.dtype(), DType::F32);
    }

    #[test]
    fn test_padding_does_not_change_logits() {
        // Mean pooling over the mask means pad positions carry no signal:
        // the same tokens with more padding produce the same logits.
        let device = Device::Cpu;
        let scorer = TacticClassifier::new(&tiny_config(), 2, &device).unwrap();

        let short = collate(
            &[EncodedExample {
                token_ids: vec![2, 3],
                attention_mask: vec![1.0, 1.0],
                label_vector: vec![0.0, 0.0],
            }],
            0,
            &device,
        )
        .unwrap();
        let padded = collate(
            &[EncodedExample {
                token_ids: vec![2, 3, 0, 0, 0],
                attention_mask: vec![1.0, 1.0, 0.0, 0.0, 0.0],
                label_vector: vec![0.0, 0.0],
            }],
            0,
            &device,
        )
        .unwrap();

        let a = scorer.forward(&short).unwrap().to_vec2::<f32>().unwrap();
        let b = scorer.forward(&padded).unwrap().to_vec2::<f32>().unwrap();
        for (x, y) in a[0].iter().zip(b[0].iter()) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_save_load_round_trip() {
        let device = Device::Cpu;
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("model.safetensors");

        let scorer = TacticClassifier::new(&tiny_config(), 3, &device).unwrap();
        let batch = tiny_batch(&device);
        let before = scorer.forward(&batch).unwrap().to_vec2::<f32>().unwrap();
        scorer.save_state(&path).unwrap();

        let mut restored = TacticClassifier::new(&tiny_config(), 3, &device).unwrap();
        restored.load_state(&path).unwrap();
        let after = restored.forward(&batch).unwrap().to_vec2::<f32>().unwrap();

        for (row_a, row_b) in before.iter().zip(after.iter()) {
            for (a, b) in row_a.iter().zip(row_b.iter()) {
                assert!((a - b).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_load_rejects_shape_mismatch_without_partial_apply() {
        let device = Device::Cpu;
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("model.safetensors");

        // Save a 3-label model, try to load into a 4-label model.
        let donor = TacticClassifier::new(&tiny_config(), 3, &device).unwrap();
        donor.save_state(&path).unwrap();

        let mut target = TacticClassifier::new(&tiny_config(), 4, &device).unwrap();
        let batch = tiny_batch(&device);
        let before = target.forward(&batch).unwrap().to_vec2::<f32>().unwrap();

        match target.load_state(&path) {
            Err(TacticError::Checkpoint(msg)) => assert!(msg.contains("shape mismatch")),
            other => panic!("expected Checkpoint error, got {other:?}"),
        }

        // Nothing was applied: outputs are bit-identical to before the
        // failed load.
        let after = target.forward(&batch).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_factory_missing_pretrained_is_config_error() {
        let device = Device::Cpu;
        let config = ModelConfig {
            pretrained: Some("/nonexistent/weights.safetensors".to_string()),
            ..tiny_config()
        };
        match ScorerFactory::build(&config, 3, &device) {
            Err(TacticError::Config(msg)) => assert!(msg.contains("not found")),
            _ => panic!("expected Config error"),
        }
    }

    #[test]
    fn test_factory_fresh_init() {
        let device = Device::Cpu;
        let scorer = ScorerFactory::build(&tiny_config(), 5, &device).unwrap();
        assert_eq!(scorer.num_labels(), 5);
    }

    #[test]
    fn test_bce_with_logits_known_value() {
        let device = Device::Cpu;
        // logit 0 → p = 0.5 → loss = ln 2 for either target value.
        let logits = Tensor::zeros((1, 2), DType::F32, &device).unwrap();
        let targets = Tensor::from_vec(vec![1.0f32, 0.0], (1, 2), &device).unwrap();
        let loss: f32 = bce_with_logits(&logits, &targets)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!((loss - std::f32::consts::LN_2).abs() < 1e-6);
    }

    #[test]
    fn test_bce_with_logits_is_stable_for_large_logits() {
        let device = Device::Cpu;
        let logits = Tensor::from_vec(vec![80.0f32, -80.0], (1, 2), &device).unwrap();
        let targets = Tensor::from_vec(vec![1.0f32, 0.0], (1, 2), &device).unwrap();
        let loss: f32 = bce_with_logits(&logits, &targets)
            .unwrap()
            .to_scalar()
            .unwrap();
        // Confident correct predictions: loss near zero and finite.
        assert!(loss.is_finite());
        assert!(loss < 1e-3);
    }

    #[test]
    fn test_bce_gradients_flow_to_parameters() {
        let device = Device::Cpu;
        let scorer = TacticClassifier::new(&tiny_config(), 3, &device).unwrap();
        let batch = tiny_batch(&device);
        let logits = scorer.forward(&batch).unwrap();
        let loss = bce_with_logits(&logits, &batch.labels).unwrap();
        let grads = loss.backward().unwrap();

        let vars = scorer.parameters().all_vars();
        let with_grad = vars.iter().filter(|v| grads.get(v).is_some()).count();
        assert_eq!(with_grad, vars.len());
    }
}
