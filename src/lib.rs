//! # tactic-trainer-rs
//!
//! Training pipeline for a multi-label substitution-tactic classifier over
//! competition-math problem statements.
//!
//! A fixed, closed vocabulary of tactic labels ("x = 0", "Apply AM-GM", ...)
//! defines the output space; each statement may carry zero or more of them.
//! The crate covers the whole train/evaluate/export path:
//!
//! - **Vocabulary** management with stable label indices
//! - **Dataset** intake with malformed-record recovery and seeded splitting
//! - **Encoding** through a `tokenizers` tokenizer with a fixed-length
//!   pad/truncate contract
//! - **Batching** with a background prefetch worker that overlaps encoding
//!   with compute without reordering the epoch
//! - **Training** with gradient accumulation, optional mixed precision
//!   under a dynamic loss scale, global gradient clipping, and
//!   warmup-then-decay LR schedules
//! - **Evaluation** with threshold-based multi-label metrics (exact match,
//!   micro precision/recall/F1, macro F1)
//! - **Checkpointing** with best/periodic snapshots, early stopping, and
//!   strict compatibility validation on restore
//! - **Export** to a static inference artifact with a versioned tensor
//!   interface and a mandatory round-trip check
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Validate configuration
//! tactic-trainer validate config.yaml
//!
//! # Start training
//! tactic-trainer train config.yaml
//!
//! # Evaluate a checkpoint
//! tactic-trainer eval config.yaml --checkpoint outputs/checkpoint-best
//!
//! # Export the best checkpoint for the inference runtime
//! tactic-trainer export config.yaml --checkpoint outputs/checkpoint-best \
//!     --output outputs/artifact
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use tactic_trainer_rs::{TacticConfig, Trainer};
//!
//! # fn main() -> tactic_trainer_rs::Result<()> {
//! let config = TacticConfig::from_file("config.yaml")?;
//! let mut trainer = Trainer::new(config)?;
//! trainer.train()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod amp;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod encoder;
pub mod error;
pub mod evaluator;
pub mod export;
pub mod optimizer;
pub mod sampler;
pub mod scheduler;
pub mod scorer;
pub mod trainer;
pub mod vocab;

#[cfg(test)]
pub(crate) mod test_util;

pub use config::{TacticConfig, TrainingConfig};
pub use error::{Result, TacticError};
pub use trainer::Trainer;
pub use vocab::Vocabulary;
