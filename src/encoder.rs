//! Tokenizer wrapper implementing the fixed-length encoding contract.
//!
//! The encoder is an external capability: a `tokenizers` model turning a
//! statement into `(token_ids[max_length], attention_mask[max_length])`,
//! deterministic for a given text and configuration. Checkpoints and export
//! manifests record the [`EncoderConfig`](crate::config::EncoderConfig) so
//! restores can reject an incompatible tokenizer.

use std::path::Path;

use tokenizers::Tokenizer;

use crate::config::EncoderConfig;
use crate::dataset::Example;
use crate::error::{Result, TacticError};
use crate::vocab::Vocabulary;

/// A statement encoded for the scorer, together with its multi-hot label
/// vector. Owned per batch and regenerated each epoch from the source
/// [`Example`], never mutated in place.
#[derive(Debug, Clone)]
pub struct EncodedExample {
    /// Token ids, exactly `max_length` long.
    pub token_ids: Vec<u32>,
    /// 1.0 for real tokens, 0.0 for padding; same length as `token_ids`.
    pub attention_mask: Vec<f32>,
    /// Multi-hot label vector of vocabulary size.
    pub label_vector: Vec<f32>,
}

/// Wraps a `tokenizers` tokenizer with truncate-then-pad to a fixed length.
pub struct Encoder {
    tokenizer: Tokenizer,
    config: EncoderConfig,
    pad_id: u32,
}

impl Encoder {
    /// Load the tokenizer named by the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TacticError::Config`] if the tokenizer file is missing or
    /// unparseable.
    pub fn from_config(config: &EncoderConfig) -> Result<Self> {
        let path = Path::new(&config.tokenizer_path);
        let tokenizer = Tokenizer::from_file(path).map_err(|e| {
            TacticError::Config(format!(
                "cannot load tokenizer {}: {e}",
                config.tokenizer_path
            ))
        })?;
        let pad_id = tokenizer
            .token_to_id("[PAD]")
            .or_else(|| tokenizer.token_to_id("<pad>"))
            .unwrap_or(0);
        Ok(Self {
            tokenizer,
            config: config.clone(),
            pad_id,
        })
    }

    /// The configuration this encoder was built from.
    #[must_use]
    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Fixed sequence length produced by [`encode`](Self::encode).
    #[must_use]
    pub fn max_length(&self) -> usize {
        self.config.max_length
    }

    /// Size of the tokenizer's id space, including added tokens.
    #[must_use]
    pub fn token_vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    /// Encode a statement into a fixed-length id sequence and mask.
    ///
    /// # Errors
    ///
    /// Returns an error if tokenization fails.
    pub fn encode(&self, text: &str) -> Result<(Vec<u32>, Vec<f32>)> {
        let max_len = self.config.max_length;
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(TacticError::Tokenizer)?;

        let mut ids = encoding.get_ids().to_vec();
        ids.truncate(max_len);
        let real_len = ids.len();
        ids.resize(max_len, self.pad_id);

        let mut mask = vec![1.0f32; real_len];
        mask.resize(max_len, 0.0);

        Ok((ids, mask))
    }

    /// Encode a full example, attaching the multi-hot label vector.
    ///
    /// The returned drop count is the number of tactics outside the
    /// vocabulary (dropped silently per the label policy; callers aggregate
    /// and log it).
    ///
    /// # Errors
    ///
    /// Returns an error if tokenization fails.
    pub fn encode_example(
        &self,
        example: &Example,
        vocab: &Vocabulary,
    ) -> Result<(EncodedExample, usize)> {
        let (token_ids, attention_mask) = self.encode(&example.statement)?;
        let (label_vector, dropped) = vocab.encode_labels(&example.tactics);
        Ok((
            EncodedExample {
                token_ids,
                attention_mask,
                label_vector,
            },
            dropped,
        ))
    }
}
