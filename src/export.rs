//! Export to a static inference artifact.
//!
//! An artifact directory holds a read-only weight snapshot
//! (`model.safetensors`), the vocabulary sidecar (`vocab.json`, index
//! order), and a versioned `manifest.json` fixing the tensor interface:
//! named inputs `token_ids` and `attention_mask` of shape
//! `[batch, seq_len]`, named output `logits` of shape `[batch, num_labels]`.
//! Output position `i` always means `vocabulary[i]`, so a downstream runtime
//! never has to re-derive the label mapping.
//!
//! Export is only considered successful after a round-trip check: the probe
//! batch is scored by the in-memory scorer and by a scorer rebuilt from the
//! artifact, and the logits must agree within [`ROUND_TRIP_TOLERANCE`]. A
//! failed export does not invalidate the checkpoint it came from.

use std::path::Path;

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::config::{EncoderConfig, ModelConfig};
use crate::encoder::Encoder;
use crate::error::{Result, TacticError};
use crate::sampler::{collate, Batch};
use crate::scorer::{Scorer, TacticClassifier};
use crate::vocab::Vocabulary;

/// Current export manifest version.
pub const EXPORT_FORMAT_VERSION: u32 = 1;

/// Maximum absolute logit difference tolerated by the round-trip check.
pub const ROUND_TRIP_TOLERANCE: f64 = 1e-4;

/// Statement used to build the default probe batch, mirroring the dummy
/// input the training side always has available.
pub const PROBE_STATEMENT: &str =
    "Find all functions f: R to R such that f(x + y) = f(x) + f(y).";

/// A named tensor in the artifact interface. Symbolic dimensions (`batch`)
/// are recorded as strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorSpec {
    /// Tensor name in the artifact interface.
    pub name: String,
    /// Element type.
    pub dtype: String,
    /// Shape with symbolic batch dimension, e.g. `["batch", "256"]`.
    pub shape: Vec<String>,
}

/// Versioned artifact manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifest {
    /// Manifest format version.
    pub format_version: u32,
    /// Named input tensors.
    pub inputs: Vec<TensorSpec>,
    /// Named output tensors.
    pub outputs: Vec<TensorSpec>,
    /// Output dimensionality; equals the sidecar vocabulary length.
    pub num_labels: usize,
    /// Architecture needed to rebuild the scorer for verification or
    /// inference.
    pub model: ModelConfig,
    /// Encoder configuration the artifact expects inputs to come from.
    pub encoder: EncoderConfig,
}

/// Serializes a trained scorer into an inference artifact.
pub struct Exporter;

impl Exporter {
    /// Write and verify an artifact directory.
    ///
    /// The caller supplies a probe batch (any encoded input works; see
    /// [`probe_batch`]) used for the round-trip check.
    ///
    /// # Errors
    ///
    /// Returns [`TacticError::Export`] if writing fails or the round-trip
    /// tolerance is exceeded.
    pub fn export(
        scorer: &dyn Scorer,
        vocab: &Vocabulary,
        model: &ModelConfig,
        encoder: &EncoderConfig,
        probe: &Batch,
        out_dir: &Path,
    ) -> Result<ExportManifest> {
        if scorer.num_labels() != vocab.len() {
            return Err(TacticError::Export(format!(
                "scorer produces {} logits but vocabulary has {} labels",
                scorer.num_labels(),
                vocab.len()
            )));
        }

        std::fs::create_dir_all(out_dir)?;

        let seq_len = encoder.max_length.to_string();
        let manifest = ExportManifest {
            format_version: EXPORT_FORMAT_VERSION,
            inputs: vec![
                TensorSpec {
                    name: "token_ids".to_string(),
                    dtype: "u32".to_string(),
                    shape: vec!["batch".to_string(), seq_len.clone()],
                },
                TensorSpec {
                    name: "attention_mask".to_string(),
                    dtype: "f32".to_string(),
                    shape: vec!["batch".to_string(), seq_len],
                },
            ],
            outputs: vec![TensorSpec {
                name: "logits".to_string(),
                dtype: "f32".to_string(),
                shape: vec!["batch".to_string(), vocab.len().to_string()],
            }],
            num_labels: vocab.len(),
            model: ModelConfig {
                // Warm-start provenance is a training concern, not part of
                // the artifact interface.
                pretrained: None,
                ..model.clone()
            },
            encoder: encoder.clone(),
        };

        scorer.save_state(&out_dir.join("model.safetensors"))?;
        vocab.to_file(out_dir.join("vocab.json"))?;
        std::fs::write(
            out_dir.join("manifest.json"),
            serde_json::to_string_pretty(&manifest)?,
        )?;

        Self::verify_round_trip(scorer, probe, out_dir)?;
        tracing::info!(
            "Exported {}-label artifact to {}",
            vocab.len(),
            out_dir.display()
        );
        Ok(manifest)
    }

    /// Rebuild an inference scorer and vocabulary from an artifact.
    ///
    /// This is the contract the downstream runtime relies on, and what the
    /// round-trip check exercises.
    ///
    /// # Errors
    ///
    /// Returns [`TacticError::Export`] if the artifact is missing pieces or
    /// internally inconsistent.
    pub fn load_artifact(
        dir: &Path,
        device: &Device,
    ) -> Result<(TacticClassifier, Vocabulary, ExportManifest)> {
        let manifest_path = dir.join("manifest.json");
        let raw = std::fs::read_to_string(&manifest_path).map_err(|e| {
            TacticError::Export(format!("cannot read {}: {e}", manifest_path.display()))
        })?;
        let manifest: ExportManifest = serde_json::from_str(&raw)
            .map_err(|e| TacticError::Export(format!("cannot parse manifest: {e}")))?;
        if manifest.format_version != EXPORT_FORMAT_VERSION {
            return Err(TacticError::Export(format!(
                "unsupported artifact format version {} (expected {})",
                manifest.format_version, EXPORT_FORMAT_VERSION
            )));
        }

        let vocab = Vocabulary::from_file(dir.join("vocab.json"))?;
        if vocab.len() != manifest.num_labels {
            return Err(TacticError::Export(format!(
                "sidecar vocabulary has {} labels but manifest declares {}",
                vocab.len(),
                manifest.num_labels
            )));
        }

        let mut classifier = TacticClassifier::new(&manifest.model, manifest.num_labels, device)?;
        classifier
            .load_state(&dir.join("model.safetensors"))
            .map_err(|e| TacticError::Export(format!("cannot load artifact weights: {e}")))?;
        Ok((classifier, vocab, manifest))
    }

    fn verify_round_trip(scorer: &dyn Scorer, probe: &Batch, dir: &Path) -> Result<()> {
        let device = probe.token_ids.device().clone();
        let (reloaded, _, _) = Self::load_artifact(dir, &device)?;

        let expected = scorer.forward(probe)?.detach();
        let actual = reloaded.forward(probe)?.detach();
        let max_diff: f32 = (expected - actual)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_scalar()?;

        if f64::from(max_diff) >= ROUND_TRIP_TOLERANCE {
            return Err(TacticError::Export(format!(
                "round-trip verification failed: max logit difference {max_diff:e} exceeds {ROUND_TRIP_TOLERANCE:e}"
            )));
        }
        Ok(())
    }
}

/// Encode the fixed probe statement into a single-example batch.
///
/// # Errors
///
/// Returns an error if encoding fails.
pub fn probe_batch(encoder: &Encoder, vocab: &Vocabulary, device: &Device) -> Result<Batch> {
    let example = crate::dataset::Example {
        statement: PROBE_STATEMENT.to_string(),
        tactics: Vec::new(),
    };
    let (encoded, _) = encoder.encode_example(&example, vocab)?;
    collate(&[encoded], 0, device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::EncodedExample;
    use tempfile::TempDir;

    fn tiny_model() -> ModelConfig {
        ModelConfig {
            token_vocab_size: 32,
            hidden_size: 8,
            intermediate_size: 10,
            pretrained: None,
        }
    }

    fn tiny_encoder_config() -> EncoderConfig {
        EncoderConfig {
            tokenizer_path: "tokenizer.json".to_string(),
            max_length: 4,
        }
    }

    fn tiny_probe(device: &Device, num_labels: usize) -> Batch {
        collate(
            &[EncodedExample {
                token_ids: vec![2, 3, 4, 0],
                attention_mask: vec![1.0, 1.0, 1.0, 0.0],
                label_vector: vec![0.0; num_labels],
            }],
            0,
            device,
        )
        .unwrap()
    }

    #[test]
    fn test_export_round_trip_within_tolerance() {
        let device = Device::Cpu;
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("artifact");

        let vocab = Vocabulary::new(["x = 0", "y = 0", "x = y"]).unwrap();
        let scorer = TacticClassifier::new(&tiny_model(), 3, &device).unwrap();
        let probe = tiny_probe(&device, 3);

        let manifest = Exporter::export(
            &scorer,
            &vocab,
            &tiny_model(),
            &tiny_encoder_config(),
            &probe,
            &out,
        )
        .unwrap();

        assert_eq!(manifest.num_labels, 3);
        assert!(out.join("model.safetensors").exists());
        assert!(out.join("vocab.json").exists());
        assert!(out.join("manifest.json").exists());

        // The reloaded artifact scores identically (same weights, same
        // graph), well within the 1e-4 contract.
        let (reloaded, loaded_vocab, _) = Exporter::load_artifact(&out, &device).unwrap();
        let a = scorer.forward(&probe).unwrap().to_vec2::<f32>().unwrap();
        let b = reloaded.forward(&probe).unwrap().to_vec2::<f32>().unwrap();
        for (x, y) in a[0].iter().zip(b[0].iter()) {
            assert!((x - y).abs() < 1e-4);
        }
        assert_eq!(loaded_vocab.label_at(2), "x = y");
    }

    #[test]
    fn test_manifest_records_tensor_interface() {
        let device = Device::Cpu;
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("artifact");

        let vocab = Vocabulary::new(["a", "b"]).unwrap();
        let scorer = TacticClassifier::new(&tiny_model(), 2, &device).unwrap();
        let probe = tiny_probe(&device, 2);

        let manifest = Exporter::export(
            &scorer,
            &vocab,
            &tiny_model(),
            &tiny_encoder_config(),
            &probe,
            &out,
        )
        .unwrap();

        let input_names: Vec<&str> = manifest.inputs.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(input_names, ["token_ids", "attention_mask"]);
        assert_eq!(manifest.outputs[0].name, "logits");
        assert_eq!(manifest.outputs[0].shape, ["batch", "2"]);
        assert_eq!(manifest.inputs[0].shape, ["batch", "4"]);
    }

    #[test]
    fn test_export_rejects_label_count_mismatch() {
        let device = Device::Cpu;
        let temp = TempDir::new().unwrap();

        let vocab = Vocabulary::new(["a", "b", "c"]).unwrap();
        let scorer = TacticClassifier::new(&tiny_model(), 2, &device).unwrap();
        let probe = tiny_probe(&device, 2);

        let result = Exporter::export(
            &scorer,
            &vocab,
            &tiny_model(),
            &tiny_encoder_config(),
            &probe,
            &temp.path().join("artifact"),
        );
        assert!(matches!(result, Err(TacticError::Export(_))));
    }

    #[test]
    fn test_load_artifact_missing_dir_is_export_error() {
        let result = Exporter::load_artifact(Path::new("/nonexistent/artifact"), &Device::Cpu);
        assert!(matches!(result, Err(TacticError::Export(_))));
    }

    #[test]
    fn test_tampered_vocab_sidecar_is_rejected() {
        let device = Device::Cpu;
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("artifact");

        let vocab = Vocabulary::new(["a", "b"]).unwrap();
        let scorer = TacticClassifier::new(&tiny_model(), 2, &device).unwrap();
        let probe = tiny_probe(&device, 2);
        Exporter::export(
            &scorer,
            &vocab,
            &tiny_model(),
            &tiny_encoder_config(),
            &probe,
            &out,
        )
        .unwrap();

        // Shrink the sidecar behind the manifest's back.
        std::fs::write(out.join("vocab.json"), "[\"a\"]").unwrap();
        let result = Exporter::load_artifact(&out, &device);
        assert!(matches!(result, Err(TacticError::Export(_))));
    }
}
