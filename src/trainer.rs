//! Training loop and optimization.
//!
//! A single control thread drives the epoch/step state machine
//! (`ready → forward → backward → accumulate | step → ready`); the only
//! concurrency is the prefetch worker feeding encoded batches through a
//! bounded buffer. Parameter updates, metric aggregation and checkpoint
//! writes are strictly sequential with respect to the control thread.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use candle_core::{Device, Tensor};
use indicatif::{ProgressBar, ProgressStyle};

use crate::amp::{LossScaler, Precision};
use crate::checkpoint::{
    CheckpointMeta, Checkpointer, Decision, ModelSelector, CHECKPOINT_FORMAT_VERSION,
};
use crate::config::TacticConfig;
use crate::dataset::Dataset;
use crate::encoder::Encoder;
use crate::error::{Result, TacticError};
use crate::evaluator::{EvalMetrics, Evaluator};
use crate::optimizer::{clip_grad_norm, AdamWOptimizer, OptimizerConfig};
use crate::sampler::{BatchSampler, PrefetchLoader};
use crate::scheduler::{LRScheduler, SchedulerType};
use crate::scorer::{bce_with_logits, Scorer, ScorerFactory};
use crate::vocab::Vocabulary;

/// Per-optimizer-step metrics for monitoring and convergence checks.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    /// Mean BCE loss over the accumulation window.
    pub loss: f64,
    /// Global gradient norm before clipping.
    pub grad_norm: f64,
    /// Learning rate after the scheduler step.
    pub lr: f64,
}

/// Training orchestrator.
///
/// # Example
///
/// ```no_run
/// use tactic_trainer_rs::{TacticConfig, Trainer};
///
/// # fn main() -> tactic_trainer_rs::Result<()> {
/// let config = TacticConfig::from_file("config.yaml")?;
/// let mut trainer = Trainer::new(config)?;
/// trainer.train()?;
/// # Ok(())
/// # }
/// ```
pub struct Trainer {
    config: TacticConfig,
    vocab: Arc<Vocabulary>,
    device: Device,
    /// Optimizer-step counter; also the LR-schedule position.
    step: usize,
    /// Current epoch (1-based once training starts).
    epoch: usize,
    /// Unknown labels dropped during encoding, aggregated for the post-run
    /// summary.
    dropped_labels: usize,
    /// Steps skipped because of loss-scale overflow.
    overflow_skipped: usize,
    /// Evaluation history, one entry per completed epoch.
    metric_history: Vec<EvalMetrics>,
    /// Step metrics from the current run.
    pub training_metrics: Vec<StepMetrics>,
    stop: Arc<AtomicBool>,
    resume_dir: Option<PathBuf>,
}

impl Trainer {
    /// Create a trainer, validating the configuration and resolving the
    /// vocabulary up front.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration or vocabulary is invalid.
    pub fn new(config: TacticConfig) -> Result<Self> {
        config.validate()?;
        let vocab = match &config.vocab_path {
            Some(path) => Vocabulary::from_file(path)?,
            None => Vocabulary::default(),
        };
        let device = select_device();
        Ok(Self {
            config,
            vocab: Arc::new(vocab),
            device,
            step: 0,
            epoch: 0,
            dropped_labels: 0,
            overflow_skipped: 0,
            metric_history: Vec::new(),
            training_metrics: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
            resume_dir: None,
        })
    }

    /// Resume from a checkpoint directory. The restore happens inside
    /// [`train`](Self::train) once the scorer exists; compatibility is
    /// validated before any state is applied.
    pub fn resume_from(&mut self, checkpoint_dir: impl Into<PathBuf>) {
        self.resume_dir = Some(checkpoint_dir.into());
    }

    /// Handle for requesting a graceful stop from another thread (deadline
    /// or manual interrupt). The flag is checked at batch boundaries; the
    /// in-flight accumulation window completes and a checkpoint is persisted
    /// before the run halts.
    #[must_use]
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// The vocabulary this run trains against.
    #[must_use]
    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocab
    }

    /// Current optimizer step.
    #[must_use]
    pub fn step(&self) -> usize {
        self.step
    }

    /// Current epoch (1-based; 0 before training starts).
    #[must_use]
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Evaluation history collected so far.
    #[must_use]
    pub fn metric_history(&self) -> &[EvalMetrics] {
        &self.metric_history
    }

    /// Loss values for all optimizer steps.
    #[must_use]
    pub fn losses(&self) -> Vec<f64> {
        self.training_metrics.iter().map(|m| m.loss).collect()
    }

    /// Steps skipped by the loss scaler during the last run.
    #[must_use]
    pub fn overflow_skipped(&self) -> usize {
        self.overflow_skipped
    }

    /// Run the training loop: epochs over prefetched batches with gradient
    /// accumulation, per-epoch evaluation, best/periodic checkpointing and
    /// early stopping.
    ///
    /// # Errors
    ///
    /// Returns an error on configuration, data-store, numeric, or
    /// checkpoint failures. A non-finite loss is fatal; an overflowed
    /// mixed-precision step is skipped, not an error.
    pub fn train(&mut self) -> Result<()> {
        let training = self.config.training.clone();
        tracing::info!("Starting training");
        tracing::info!("  Labels: {}", self.vocab.len());
        tracing::info!("  Epochs: {}", training.epochs);
        tracing::info!(
            "  Effective batch: {} x {} = {}",
            training.batch_size,
            training.accumulation_steps,
            training.batch_size * training.accumulation_steps
        );

        let encoder = Arc::new(Encoder::from_config(&self.config.encoder)?);
        if encoder.token_vocab_size() > self.config.model.token_vocab_size {
            return Err(TacticError::Config(format!(
                "model.token_vocab_size {} is smaller than the tokenizer's id space {}",
                self.config.model.token_vocab_size,
                encoder.token_vocab_size()
            )));
        }

        let Dataset {
            train,
            val,
            skipped_records,
        } = Dataset::load(&self.config.dataset, self.config.seed)?;
        tracing::info!(
            "Loaded {} training / {} validation examples ({} skipped)",
            train.len(),
            val.len(),
            skipped_records
        );
        let train = Arc::new(train);

        std::fs::create_dir_all(&self.config.output_dir)?;

        let mut scorer = ScorerFactory::build(&self.config.model, self.vocab.len(), &self.device)?;
        if training.mixed_precision {
            scorer.set_precision(Precision::Fp16);
            tracing::info!("Mixed precision enabled (fp16 compute, dynamic loss scale)");
        }

        let sampler = BatchSampler::new(training.batch_size, self.config.seed);
        let batches_per_epoch = sampler.batches_per_epoch(train.len());
        let steps_per_epoch = batches_per_epoch.div_ceil(training.accumulation_steps);
        let total_steps = steps_per_epoch * training.epochs;
        let warmup_steps = (total_steps as f64 * training.warmup_ratio) as usize;

        let mut optimizer = OptimizerConfig {
            learning_rate: training.learning_rate,
            weight_decay: training.weight_decay,
            ..OptimizerConfig::default()
        }
        .build_adamw(scorer.parameters())?;
        let mut scheduler = LRScheduler::new(
            SchedulerType::from_config(training.lr_scheduler, warmup_steps, total_steps),
            training.learning_rate,
        );
        tracing::info!(
            "Scheduler: {:?}, {} total steps, {} warmup",
            training.lr_scheduler,
            total_steps,
            warmup_steps
        );

        let mut start_epoch = 0usize;
        if let Some(resume_dir) = self.resume_dir.take() {
            let meta = Checkpointer::restore(
                &resume_dir,
                scorer.as_mut(),
                &self.vocab,
                &self.config.encoder,
            )?;
            self.step = meta.step;
            scheduler.set_step(meta.step);
            optimizer.set_learning_rate(meta.learning_rate);
            self.metric_history.clone_from(&meta.metric_history);
            start_epoch = meta.epoch;
            tracing::info!(
                "Resumed from {} (epoch {}, step {})",
                resume_dir.display(),
                meta.epoch,
                meta.step
            );
        }

        let checkpointer = Checkpointer::new(&self.config.output_dir);
        let mut selector = ModelSelector::new(
            self.config.selection.metric,
            self.config.selection.patience,
            self.config.selection.min_delta,
        );
        let evaluator = Evaluator::new(self.config.eval.threshold, training.batch_size);
        let mut scaler = LossScaler::new();

        let pb = ProgressBar::new(total_steps as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {msg}",
                )?
                .progress_chars("#>-"),
        );
        pb.set_position(self.step as u64);

        self.training_metrics.clear();

        'training: for epoch in start_epoch..training.epochs {
            self.epoch = epoch + 1;
            tracing::info!("Starting epoch {}/{}", epoch + 1, training.epochs);

            let order = sampler.epoch_order(train.len(), epoch);
            let loader = PrefetchLoader::spawn(
                Arc::clone(&train),
                order,
                Arc::clone(&encoder),
                Arc::clone(&self.vocab),
                training.batch_size,
                self.device.clone(),
                training.prefetch_batches,
            );

            // Accumulation window: micro-losses scaled by 1/K and summed as
            // a graph tensor, so one backward per optimizer step produces
            // the same gradients as averaging over the effective batch.
            let mut window: Option<Tensor> = None;
            let mut window_loss_sum = 0f64;
            let mut window_micro = 0usize;
            let mut interrupted = false;

            while let Some(batch) = loader.next_batch() {
                let batch = batch?;
                self.dropped_labels += batch.dropped_labels;

                let logits = scorer.forward(&batch)?;
                let loss = bce_with_logits(&logits, &batch.labels)?;
                let loss_value = f64::from(loss.to_scalar::<f32>()?);
                if !loss_value.is_finite() {
                    // Not a scale overflow (this is the unscaled loss):
                    // continuing would corrupt every subsequent step.
                    return Err(TacticError::Numeric(format!(
                        "non-finite loss {loss_value} at optimizer step {} (epoch {})",
                        self.step + 1,
                        epoch + 1
                    )));
                }

                let scaled = loss.affine(1.0 / training.accumulation_steps as f64, 0.0)?;
                window = Some(match window.take() {
                    Some(acc) => (acc + scaled)?,
                    None => scaled,
                });
                window_loss_sum += loss_value;
                window_micro += 1;

                if window_micro == training.accumulation_steps {
                    let acc = window.take().ok_or_else(|| {
                        TacticError::Training("accumulation window vanished".to_string())
                    })?;
                    self.optimizer_step(
                        &acc,
                        window_loss_sum / window_micro as f64,
                        scorer.as_ref(),
                        &mut optimizer,
                        &mut scheduler,
                        &mut scaler,
                        &pb,
                        total_steps,
                    )?;
                    window_loss_sum = 0.0;
                    window_micro = 0;
                }

                if self.stop.load(Ordering::Relaxed) {
                    interrupted = true;
                    break;
                }
            }

            // Trailing partial window still steps, so every example of the
            // epoch contributes to an update.
            if let Some(acc) = window.take() {
                self.optimizer_step(
                    &acc,
                    window_loss_sum / window_micro.max(1) as f64,
                    scorer.as_ref(),
                    &mut optimizer,
                    &mut scheduler,
                    &mut scaler,
                    &pb,
                    total_steps,
                )?;
            }

            if interrupted {
                tracing::info!("Stop requested; persisting checkpoint before halting");
                let meta = self.checkpoint_meta(optimizer.learning_rate());
                checkpointer.save(&(epoch + 1).to_string(), scorer.as_ref(), &meta)?;
                break 'training;
            }

            let metrics =
                evaluator.evaluate(scorer.as_ref(), &val, &encoder, &self.vocab, &self.device)?;
            tracing::info!(
                "Epoch {}/{} | Val loss: {:.4} | Exact: {:.3} | Micro-F1: {:.4} | Macro-F1: {:.4}",
                epoch + 1,
                training.epochs,
                metrics.loss,
                metrics.exact_match,
                metrics.micro_f1,
                metrics.macro_f1
            );
            self.metric_history.push(metrics.clone());

            match selector.observe(&metrics) {
                Decision::Improved => {
                    let meta = self.checkpoint_meta(optimizer.learning_rate());
                    checkpointer.save("best", scorer.as_ref(), &meta)?;
                    tracing::info!(
                        "New best {:?}: {:.4}",
                        self.config.selection.metric,
                        selector.best().unwrap_or_default()
                    );
                }
                Decision::NoImprovement => {}
                Decision::Stop => {
                    tracing::info!("Early stopping at epoch {} (patience exhausted)", epoch + 1);
                    break 'training;
                }
            }

            if (epoch + 1) % self.config.selection.checkpoint_interval == 0 {
                let meta = self.checkpoint_meta(optimizer.learning_rate());
                checkpointer.save(&(epoch + 1).to_string(), scorer.as_ref(), &meta)?;
            }
        }

        pb.finish_with_message("Training complete");

        let meta = self.checkpoint_meta(optimizer.learning_rate());
        checkpointer.save("final", scorer.as_ref(), &meta)?;

        let history_path = PathBuf::from(&self.config.output_dir).join("history.json");
        std::fs::write(
            &history_path,
            serde_json::to_string_pretty(&self.metric_history)?,
        )?;

        self.overflow_skipped = scaler.skipped_steps();
        tracing::info!(
            "Run summary: {} optimizer steps, {} skipped records, {} dropped labels, {} overflow-skipped steps",
            self.step,
            skipped_records,
            self.dropped_labels,
            self.overflow_skipped
        );
        Ok(())
    }

    /// One optimizer step from an accumulated window loss: backward, the
    /// mixed-precision overflow check, unscale, clip, update, schedule.
    #[allow(clippy::too_many_arguments)]
    fn optimizer_step(
        &mut self,
        window_loss: &Tensor,
        reported_loss: f64,
        scorer: &dyn Scorer,
        optimizer: &mut AdamWOptimizer,
        scheduler: &mut LRScheduler,
        scaler: &mut LossScaler,
        pb: &ProgressBar,
        total_steps: usize,
    ) -> Result<()> {
        let mixed = self.config.training.mixed_precision;
        let vars = scorer.parameters().all_vars();

        let mut grads = if mixed {
            scaler.scale_loss(window_loss)?.backward()?
        } else {
            window_loss.backward()?
        };

        if mixed {
            if !LossScaler::grads_finite(&vars, &grads)? {
                // Overflowed step: no parameter, optimizer-state or schedule
                // update; only the scale factor changes.
                scaler.update(true);
                tracing::warn!(
                    "Gradient overflow at step {}; step skipped, loss scale now {}",
                    self.step + 1,
                    scaler.scale()
                );
                return Ok(());
            }
            scaler.unscale(&vars, &mut grads)?;
        }

        let grad_norm = clip_grad_norm(&vars, &mut grads, self.config.training.max_grad_norm)?;
        optimizer.step_with_grads(&grads)?;
        scheduler.step(optimizer);
        if mixed {
            scaler.update(false);
        }

        self.step += 1;
        pb.set_message(format!("{reported_loss:.4}"));
        pb.inc(1);

        self.training_metrics.push(StepMetrics {
            loss: reported_loss,
            grad_norm,
            lr: optimizer.learning_rate(),
        });

        if self.step % self.config.training.logging_steps == 0 {
            tracing::info!(
                "Step {}/{}, Epoch {}, Loss: {:.4}, GradNorm: {:.4}, LR: {:.2e}",
                self.step,
                total_steps,
                self.epoch,
                reported_loss,
                grad_norm,
                optimizer.learning_rate()
            );
        }
        Ok(())
    }

    fn checkpoint_meta(&self, learning_rate: f64) -> CheckpointMeta {
        CheckpointMeta {
            format_version: CHECKPOINT_FORMAT_VERSION,
            epoch: self.epoch,
            step: self.step,
            learning_rate,
            vocabulary: self.vocab.labels().to_vec(),
            encoder: self.config.encoder.clone(),
            metric_history: self.metric_history.clone(),
        }
    }
}

/// Device selection: CUDA when built with the feature and available, CPU
/// otherwise.
#[must_use]
pub fn select_device() -> Device {
    if cfg!(feature = "cuda") {
        match Device::cuda_if_available(0) {
            Ok(device @ Device::Cuda(_)) => {
                tracing::info!("Training device: CUDA");
                device
            }
            Ok(_) => {
                tracing::warn!("CUDA not available; falling back to CPU");
                Device::Cpu
            }
            Err(err) => {
                tracing::warn!("CUDA init failed ({err}); falling back to CPU");
                Device::Cpu
            }
        }
    } else {
        Device::Cpu
    }
}
