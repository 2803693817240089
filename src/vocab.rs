//! Substitution-tactic label vocabulary.
//!
//! The vocabulary is a fixed, ordered set of tactic strings that defines the
//! output dimensionality of the classifier and the meaning of every position
//! in a multi-hot label vector. It is immutable once a training run begins:
//! position `i` of the exported logit tensor always means `labels[i]`, so
//! checkpoints and export artifacts carry a full copy of the vocabulary they
//! were trained against and refuse to load under a mismatch.

use std::collections::HashMap;
use std::path::Path;

use crate::error::{Result, TacticError};

/// The default substitution vocabulary (20 tactics).
///
/// Ordering is part of the contract: changing it invalidates every existing
/// checkpoint and export artifact.
pub const DEFAULT_TACTICS: [&str; 20] = [
    "x = 0",
    "y = 0",
    "x = y",
    "x = 1",
    "y = 1",
    "a = b = c = 1",
    "abc = 1 constraint",
    "Apply AM-GM",
    "Apply Cauchy-Schwarz",
    "Assume f is linear",
    "Assume f is injective",
    "Assume f is monotonic",
    "Check small cases",
    "Use modular arithmetic",
    "Homogenize",
    "WLOG assume ordering",
    "Substitute c = 1/(ab)",
    "y = f(x)",
    "x = -y",
    "Consider p = 2 separately",
];

/// Ordered, duplicate-free set of tactic labels, index-addressable both ways.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabulary {
    labels: Vec<String>,
    index: HashMap<String, usize>,
}

impl Vocabulary {
    /// Build a vocabulary from an ordered label list.
    ///
    /// # Errors
    ///
    /// Returns [`TacticError::Config`] if the list is empty or contains a
    /// duplicate entry.
    pub fn new<I, S>(labels: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let labels: Vec<String> = labels.into_iter().map(Into::into).collect();
        if labels.is_empty() {
            return Err(TacticError::Config("vocabulary is empty".to_string()));
        }
        let mut index = HashMap::with_capacity(labels.len());
        for (i, label) in labels.iter().enumerate() {
            if index.insert(label.clone(), i).is_some() {
                return Err(TacticError::Config(format!(
                    "duplicate vocabulary entry: {label:?}"
                )));
            }
        }
        Ok(Self { labels, index })
    }

    /// Load a vocabulary from a JSON sidecar file (an array of strings in
    /// index order).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or contains
    /// duplicates.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let labels: Vec<String> = serde_json::from_str(&raw)?;
        Self::new(labels)
    }

    /// Write the vocabulary as a JSON array in index order, the sidecar
    /// format consumed by the inference runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.labels)?;
        std::fs::write(path.as_ref(), json)?;
        Ok(())
    }

    /// Number of labels `N`.
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Returns true if the vocabulary has no labels. Construction rejects
    /// this, so it only holds for manually built test doubles.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Index of a label, or `None` for an unknown label.
    #[must_use]
    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.index.get(label).copied()
    }

    /// Label at an index.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len()`; callers index with positions produced by
    /// this vocabulary.
    #[must_use]
    pub fn label_at(&self, index: usize) -> &str {
        &self.labels[index]
    }

    /// All labels in index order.
    #[must_use]
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Encode a tactic list as a multi-hot vector.
    ///
    /// Unknown labels carry no signal and are dropped rather than raising;
    /// the second element of the return value is the number of dropped
    /// entries so callers can log drop counts prominently (typo'd tactic
    /// names in upstream data are a known hazard).
    #[must_use]
    pub fn encode_labels(&self, tactics: &[String]) -> (Vec<f32>, usize) {
        let mut vector = vec![0.0f32; self.labels.len()];
        let mut dropped = 0;
        for tactic in tactics {
            match self.index_of(tactic) {
                Some(i) => vector[i] = 1.0,
                None => dropped += 1,
            }
        }
        (vector, dropped)
    }
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self::new(DEFAULT_TACTICS).expect("default vocabulary is duplicate-free")
    }
}
