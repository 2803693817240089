//! Mixed-precision support: compute precision selection and dynamic loss
//! scaling.
//!
//! When mixed precision is enabled the scorer runs its forward math in a
//! reduced-precision dtype while master weights stay in FP32, and the loss is
//! multiplied by a dynamic scale factor before backward to keep small
//! gradients above the representable range. A step whose scaled gradients
//! overflow is skipped entirely (no parameter, scheduler, or optimizer-state
//! update) and the scale factor is halved; after a run of consecutive clean
//! steps the factor is doubled again. An overflowed step must never corrupt
//! parameters.

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Floating-point precision for scorer compute.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// 32-bit floating point, the full-precision default.
    #[default]
    Fp32,
    /// 16-bit half precision; narrow exponent range, needs loss scaling.
    Fp16,
    /// bfloat16; FP32 exponent range with reduced mantissa.
    Bf16,
}

impl Precision {
    /// The candle dtype for this precision.
    #[must_use]
    pub const fn dtype(self) -> DType {
        match self {
            Self::Fp32 => DType::F32,
            Self::Fp16 => DType::F16,
            Self::Bf16 => DType::BF16,
        }
    }

    /// True for the 16-bit formats.
    #[must_use]
    pub const fn is_reduced(self) -> bool {
        matches!(self, Self::Fp16 | Self::Bf16)
    }
}

/// Dynamic loss-scale state.
#[derive(Debug, Clone)]
pub struct LossScaler {
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: usize,
    min_scale: f64,
    ok_steps: usize,
    skipped_steps: usize,
}

impl Default for LossScaler {
    fn default() -> Self {
        Self::new()
    }
}

impl LossScaler {
    /// Default scaler: initial scale 2^16, halve on overflow, double after
    /// 2000 consecutive clean steps.
    #[must_use]
    pub fn new() -> Self {
        Self::with_scale(65536.0)
    }

    /// Scaler with an explicit initial scale.
    #[must_use]
    pub fn with_scale(initial: f64) -> Self {
        Self {
            scale: initial,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            min_scale: 1.0,
            ok_steps: 0,
            skipped_steps: 0,
        }
    }

    /// Current scale factor.
    #[must_use]
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Steps skipped so far because of gradient overflow.
    #[must_use]
    pub fn skipped_steps(&self) -> usize {
        self.skipped_steps
    }

    /// Multiply the loss by the current scale factor before backward.
    ///
    /// # Errors
    ///
    /// Returns an error if the tensor operation fails.
    pub fn scale_loss(&self, loss: &Tensor) -> Result<Tensor> {
        Ok(loss.affine(self.scale, 0.0)?)
    }

    /// True when every gradient in the store is finite.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor reduction fails.
    pub fn grads_finite(vars: &[Var], grads: &GradStore) -> Result<bool> {
        for var in vars {
            if let Some(grad) = grads.get(var) {
                let max_abs: f32 = grad
                    .abs()?
                    .flatten_all()?
                    .max(0)?
                    .to_dtype(DType::F32)?
                    .to_scalar()?;
                if !max_abs.is_finite() {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Divide every gradient by the scale factor, restoring true magnitudes
    /// before clipping and the optimizer step.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor operation fails.
    pub fn unscale(&self, vars: &[Var], grads: &mut GradStore) -> Result<()> {
        let inv = 1.0 / self.scale;
        for var in vars {
            if let Some(grad) = grads.remove(var) {
                grads.insert(var, grad.affine(inv, 0.0)?);
            }
        }
        Ok(())
    }

    /// Record the outcome of a step and adjust the scale factor.
    pub fn update(&mut self, found_overflow: bool) {
        if found_overflow {
            self.scale = (self.scale * self.backoff_factor).max(self.min_scale);
            self.ok_steps = 0;
            self.skipped_steps += 1;
        } else {
            self.ok_steps += 1;
            if self.ok_steps >= self.growth_interval {
                self.scale *= self.growth_factor;
                self.ok_steps = 0;
            }
        }
    }
}
