//! Learning rate schedulers.
//!
//! The learning rate is a pure function of the optimizer-step counter, so
//! schedule state resumes exactly from a checkpoint's step count. The
//! scheduler only steps on real optimizer steps, never on accumulation
//! micro-batches or overflow-skipped steps.

use crate::config::LrScheduler;
use crate::optimizer::AdamWOptimizer;

/// Learning rate scheduler types.
#[derive(Debug, Clone)]
pub enum SchedulerType {
    /// Constant learning rate
    Constant,
    /// Linear warmup then linear decay
    Linear {
        /// Number of warmup steps
        warmup_steps: usize,
        /// Total number of training steps
        total_steps: usize,
    },
    /// Cosine annealing with warmup
    Cosine {
        /// Number of warmup steps
        warmup_steps: usize,
        /// Total number of training steps
        total_steps: usize,
    },
}

impl SchedulerType {
    /// Build the schedule shape selected in the run configuration.
    #[must_use]
    pub fn from_config(kind: LrScheduler, warmup_steps: usize, total_steps: usize) -> Self {
        match kind {
            LrScheduler::Constant => Self::Constant,
            LrScheduler::Linear => Self::Linear {
                warmup_steps,
                total_steps,
            },
            LrScheduler::Cosine => Self::Cosine {
                warmup_steps,
                total_steps,
            },
        }
    }
}

/// Learning rate scheduler.
pub struct LRScheduler {
    /// Scheduler type
    scheduler_type: SchedulerType,
    /// Base learning rate
    base_lr: f64,
    /// Current step
    current_step: usize,
}

impl LRScheduler {
    /// Create a new scheduler.
    #[must_use]
    pub fn new(scheduler_type: SchedulerType, base_lr: f64) -> Self {
        Self {
            scheduler_type,
            base_lr,
            current_step: 0,
        }
    }

    /// Get learning rate for current step.
    #[must_use]
    pub fn get_lr(&self) -> f64 {
        match &self.scheduler_type {
            SchedulerType::Constant => self.base_lr,

            SchedulerType::Linear {
                warmup_steps,
                total_steps,
            } => self.linear_schedule(*warmup_steps, *total_steps),

            SchedulerType::Cosine {
                warmup_steps,
                total_steps,
            } => self.cosine_schedule(*warmup_steps, *total_steps),
        }
    }

    /// Current optimizer-step counter.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.current_step
    }

    /// Restore the step counter from a checkpoint.
    pub fn set_step(&mut self, step: usize) {
        self.current_step = step;
    }

    /// Step the scheduler and update optimizer.
    pub fn step(&mut self, optimizer: &mut AdamWOptimizer) {
        self.current_step += 1;
        let lr = self.get_lr();
        optimizer.set_learning_rate(lr);
    }

    /// Linear warmup then linear decay.
    fn linear_schedule(&self, warmup_steps: usize, total_steps: usize) -> f64 {
        if self.current_step < warmup_steps {
            self.base_lr * (self.current_step as f64 / warmup_steps.max(1) as f64)
        } else {
            let progress = (self.current_step - warmup_steps) as f64
                / (total_steps.saturating_sub(warmup_steps)).max(1) as f64;
            self.base_lr * (1.0 - progress).max(0.0)
        }
    }

    /// Cosine annealing with linear warmup.
    fn cosine_schedule(&self, warmup_steps: usize, total_steps: usize) -> f64 {
        if self.current_step < warmup_steps {
            self.base_lr * (self.current_step as f64 / warmup_steps.max(1) as f64)
        } else {
            let progress = (self.current_step - warmup_steps) as f64
                / (total_steps.saturating_sub(warmup_steps)).max(1) as f64;
            let progress = progress.min(1.0);
            let cosine_decay = 0.5 * (1.0 + (std::f64::consts::PI * progress).cos());
            self.base_lr * cosine_decay
        }
    }
}
