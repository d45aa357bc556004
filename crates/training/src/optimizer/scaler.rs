//! Dynamic loss scaling for reduced-precision runs.
//!
//! The scale multiplies each loss before backward and divides the gradients
//! afterwards. A batch with any non-finite gradient shrinks it; a run of
//! `growth_interval` clean batches grows it.

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::{config::Precision, error::to_runtime_error, TrainingError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossScaleConfig {
    pub initial_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    /// Clean batches required before the scale grows.
    pub growth_interval: usize,
    pub min_scale: f32,
    pub max_scale: f32,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: 65_536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            min_scale: 1.0,
            max_scale: 16_777_216.0,
        }
    }
}

impl LossScaleConfig {
    /// Replaces out-of-range values with usable ones instead of failing
    /// startup over a tuning knob.
    fn normalized(self) -> Self {
        let defaults = Self::default();
        let min_scale = if self.min_scale > 0.0 {
            self.min_scale
        } else {
            defaults.min_scale
        };
        let max_scale = self.max_scale.max(min_scale);
        Self {
            initial_scale: self.initial_scale.clamp(min_scale, max_scale),
            growth_factor: self.growth_factor.max(1.0),
            backoff_factor: if self.backoff_factor > 0.0 && self.backoff_factor < 1.0 {
                self.backoff_factor
            } else {
                defaults.backoff_factor
            },
            growth_interval: self.growth_interval.max(1),
            min_scale,
            max_scale,
        }
    }
}

/// Persisted with the generator checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientScalerState {
    pub loss_scale: f32,
    /// Consecutive clean batches since the last scale change.
    pub growth_tracker: usize,
}

#[derive(Debug, Clone)]
pub struct GradientScaler {
    dynamic: Option<DynamicScale>,
}

#[derive(Debug, Clone)]
struct DynamicScale {
    scale: f32,
    growth_tracker: usize,
    config: LossScaleConfig,
}

fn needs_scaling(precision: Precision) -> bool {
    match precision {
        Precision::Fp32 => false,
        Precision::Fp16 | Precision::Bf16 | Precision::Mixed => true,
    }
}

impl GradientScaler {
    pub fn new(precision: Precision) -> Self {
        Self::with_config(LossScaleConfig::default(), precision)
    }

    /// Full-precision runs get a pass-through scaler.
    pub fn with_config(config: LossScaleConfig, precision: Precision) -> Self {
        let dynamic = needs_scaling(precision).then(|| {
            let config = config.normalized();
            DynamicScale {
                scale: config.initial_scale,
                growth_tracker: 0,
                config,
            }
        });
        Self { dynamic }
    }

    pub fn is_enabled(&self) -> bool {
        self.dynamic.is_some()
    }

    pub fn loss_scale(&self) -> f32 {
        self.dynamic.as_ref().map_or(1.0, |dynamic| dynamic.scale)
    }

    pub fn scale(&self, loss: &Tensor) -> Result<Tensor, TrainingError> {
        self.multiply(loss, f64::from(self.loss_scale()))
    }

    pub fn unscale(&self, grad: &Tensor) -> Result<Tensor, TrainingError> {
        self.multiply(grad, 1.0 / f64::from(self.loss_scale()))
    }

    fn multiply(&self, tensor: &Tensor, factor: f64) -> Result<Tensor, TrainingError> {
        if self.dynamic.is_none() {
            return Ok(tensor.clone());
        }
        tensor.affine(factor, 0.0).map_err(to_runtime_error)
    }

    /// True when any unscaled gradient holds an infinity or NaN. Always
    /// false without dynamic scaling.
    pub fn has_overflow<I>(&self, grads: I) -> Result<bool, TrainingError>
    where
        I: IntoIterator,
        I::Item: AsRef<Tensor>,
    {
        if self.dynamic.is_none() {
            return Ok(false);
        }
        for grad in grads {
            if !all_finite(grad.as_ref())? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn state(&self) -> Option<GradientScalerState> {
        self.dynamic.as_ref().map(|dynamic| GradientScalerState {
            loss_scale: dynamic.scale,
            growth_tracker: dynamic.growth_tracker,
        })
    }

    /// No-op when this run does not scale, e.g. resuming an fp16 run in fp32.
    pub fn load_state(&mut self, saved: &GradientScalerState) {
        if let Some(dynamic) = &mut self.dynamic {
            dynamic.scale = saved
                .loss_scale
                .clamp(dynamic.config.min_scale, dynamic.config.max_scale);
            dynamic.growth_tracker = saved.growth_tracker;
        }
    }

    /// Called once per batch, after both optimizer passes.
    pub fn update(&mut self, found_inf: bool) {
        let Some(dynamic) = &mut self.dynamic else {
            return;
        };
        let config = &dynamic.config;
        if found_inf {
            dynamic.scale = (dynamic.scale * config.backoff_factor).max(config.min_scale);
            dynamic.growth_tracker = 0;
            return;
        }
        dynamic.growth_tracker += 1;
        if dynamic.growth_tracker == config.growth_interval {
            dynamic.scale = (dynamic.scale * config.growth_factor).min(config.max_scale);
            dynamic.growth_tracker = 0;
        }
    }
}

fn all_finite(tensor: &Tensor) -> Result<bool, TrainingError> {
    let values = tensor
        .to_dtype(DType::F32)
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(to_runtime_error)?;
    Ok(values.iter().all(|value| value.is_finite()))
}
