//! Optimizer construction and gradient clipping.

use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::{Optimizer, ParamsAdamW, VarMap};

use crate::error::{Result, TacticError};

/// Optimizer configuration.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// Beta1 for Adam
    pub beta1: f64,
    /// Beta2 for Adam
    pub beta2: f64,
    /// Weight decay
    pub weight_decay: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 2e-5,
            beta1: 0.9,
            beta2: 0.999,
            weight_decay: 0.01,
            eps: 1e-8,
        }
    }
}

impl OptimizerConfig {
    /// Create an AdamW optimizer over all variables in the map.
    ///
    /// # Errors
    ///
    /// Returns an error if the optimizer cannot be created.
    pub fn build_adamw(&self, varmap: &VarMap) -> Result<AdamWOptimizer> {
        let vars = varmap.all_vars();
        let params = ParamsAdamW {
            lr: self.learning_rate,
            beta1: self.beta1,
            beta2: self.beta2,
            eps: self.eps,
            weight_decay: self.weight_decay,
        };

        let opt = candle_nn::AdamW::new(vars, params)
            .map_err(|e| TacticError::Training(format!("failed to create AdamW: {e}")))?;

        Ok(AdamWOptimizer { inner: opt })
    }
}

/// AdamW optimizer wrapper.
pub struct AdamWOptimizer {
    inner: candle_nn::AdamW,
}

impl AdamWOptimizer {
    /// Apply one update from an already-computed gradient store.
    ///
    /// The trainer computes gradients itself (it unscales, checks for
    /// overflow, and clips between backward and step), so the combined
    /// backward-and-step entry point is not used here.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn step_with_grads(&mut self, grads: &GradStore) -> Result<()> {
        self.inner
            .step(grads)
            .map_err(|e| TacticError::Training(format!("optimizer step failed: {e}")))
    }

    /// Get current learning rate.
    #[must_use]
    pub fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }

    /// Set learning rate (used by schedulers).
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.inner.set_learning_rate(lr);
    }
}

/// Clip gradients to a global L2 norm, returning the pre-clip norm.
///
/// Applied after unscaling and before the optimizer step, so one outlier
/// batch cannot produce an unbounded update.
///
/// # Errors
///
/// Returns an error if a tensor operation fails.
pub fn clip_grad_norm(vars: &[Var], grads: &mut GradStore, max_norm: f64) -> Result<f64> {
    let mut total_sq = 0f64;
    for var in vars {
        if let Some(grad) = grads.get(var) {
            let sq: f32 = grad.sqr()?.sum_all()?.to_scalar()?;
            total_sq += f64::from(sq);
        }
    }
    let norm = total_sq.sqrt();

    if norm > max_norm && norm.is_finite() && norm > 0.0 {
        let factor = max_norm / norm;
        for var in vars {
            if let Some(grad) = grads.remove(var) {
                grads.insert(var, grad.affine(factor, 0.0)?);
            }
        }
    }
    Ok(norm)
}
