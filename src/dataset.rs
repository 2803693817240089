//! Example store loading and splitting.
//!
//! The store is a JSON array or JSONL file of records carrying a free-text
//! statement and a list of applicable tactics. Malformed records (missing or
//! non-string statement) are recovered locally: skipped, counted, and
//! reported in the post-load summary rather than aborting the run.

use std::path::Path;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::config::DatasetConfig;
use crate::error::{Result, TacticError};

/// A single training example: a problem statement and the tactics that apply
/// to it. The tactic set may be empty.
#[derive(Debug, Clone)]
pub struct Example {
    /// Problem statement text.
    pub statement: String,
    /// Applicable tactic labels; entries outside the vocabulary are dropped
    /// at encoding time.
    pub tactics: Vec<String>,
}

/// A loaded, split example store.
#[derive(Debug)]
pub struct Dataset {
    /// Training split.
    pub train: Vec<Example>,
    /// Held-out evaluation split.
    pub val: Vec<Example>,
    /// Records skipped because of a missing or malformed statement.
    pub skipped_records: usize,
}

impl Dataset {
    /// Load the example store, skip malformed records, and split train/val.
    ///
    /// Splitting shuffles with `seed` when given (reproducible) or entropy
    /// otherwise, then cuts at `1 - val_split`. A degenerate store still
    /// yields a non-empty training split.
    ///
    /// # Errors
    ///
    /// Returns [`TacticError::Data`] if the file is unreadable, not valid
    /// JSON/JSONL, or contains no usable records at all.
    pub fn load(config: &DatasetConfig, seed: Option<u64>) -> Result<Self> {
        let raw = std::fs::read_to_string(Path::new(&config.path)).map_err(|e| {
            TacticError::Data(format!("cannot read example store {}: {e}", config.path))
        })?;

        let records = parse_records(&raw)?;
        let total = records.len();

        let mut examples = Vec::with_capacity(total);
        let mut skipped = 0usize;
        for record in records {
            match parse_example(&record, config) {
                Some(example) => examples.push(example),
                None => skipped += 1,
            }
        }

        if examples.is_empty() {
            return Err(TacticError::Data(format!(
                "no usable records in {} ({total} read, {skipped} skipped)",
                config.path
            )));
        }
        if skipped > 0 {
            tracing::warn!(
                "Skipped {skipped}/{total} malformed records (missing '{}' field)",
                config.statement_field
            );
        }

        let mut rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        examples.shuffle(&mut rng);

        // The cut keeps at least one training example; tiny stores may end
        // up with an empty validation split, which evaluation tolerates.
        let val_len = ((examples.len() as f64) * config.val_split) as usize;
        let val_len = val_len.min(examples.len() - 1);
        let val = examples.split_off(examples.len() - val_len);

        Ok(Self {
            train: examples,
            val,
            skipped_records: skipped,
        })
    }

    /// Total usable examples across both splits.
    #[must_use]
    pub fn len(&self) -> usize {
        self.train.len() + self.val.len()
    }

    /// True when both splits are empty. Loading rejects this, so it only
    /// holds for manually built test doubles.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.train.is_empty() && self.val.is_empty()
    }
}

fn parse_records(raw: &str) -> Result<Vec<serde_json::Value>> {
    let trimmed = raw.trim_start();
    if trimmed.starts_with('[') {
        let records: Vec<serde_json::Value> = serde_json::from_str(raw)
            .map_err(|e| TacticError::Data(format!("invalid JSON example store: {e}")))?;
        Ok(records)
    } else {
        // JSONL: one record per line, blank and unparseable lines skipped.
        let mut records = Vec::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(value) => records.push(value),
                Err(_) => records.push(serde_json::Value::Null),
            }
        }
        Ok(records)
    }
}

fn parse_example(record: &serde_json::Value, config: &DatasetConfig) -> Option<Example> {
    let statement = record.get(&config.statement_field)?.as_str()?;
    if statement.is_empty() {
        return None;
    }
    let tactics = record
        .get(&config.labels_field)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(ToString::to_string))
                .collect()
        })
        .unwrap_or_default();
    Some(Example {
        statement: statement.to_string(),
        tactics,
    })
}
