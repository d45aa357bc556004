use std::collections::HashMap;

pub mod scaler;

pub use scaler::{GradientScaler, GradientScalerState, LossScaleConfig};

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{config, error::to_runtime_error, params::ParameterPartition, TrainingError};

#[derive(Debug, Clone)]
pub enum OptimizerConfig {
    AdamW(AdamWConfig),
}

#[derive(Debug, Clone, Copy)]
pub struct AdamWConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl From<&config::TrainConfig> for OptimizerConfig {
    fn from(value: &config::TrainConfig) -> Self {
        let [beta1, beta2] = value.betas;
        OptimizerConfig::AdamW(AdamWConfig {
            learning_rate: value.learning_rate,
            beta1,
            beta2,
            epsilon: value.eps,
            weight_decay: value.weight_decay,
        })
    }
}

#[derive(Debug, Clone)]
pub struct TrainerOptimizerOptions {
    /// Keep fp32 copies of reduced-precision parameters and update those.
    pub use_master_weights: bool,
    /// Name fragments whose parameters skip weight decay.
    pub weight_decay_exclude: Vec<String>,
}

impl Default for TrainerOptimizerOptions {
    fn default() -> Self {
        Self {
            use_master_weights: true,
            weight_decay_exclude: Vec::new(),
        }
    }
}

/// AdamW over a parameter partition. Each parameter trains at the base
/// learning rate times its group's multiplier.
#[derive(Debug)]
pub struct TrainerOptimizer {
    config: OptimizerConfig,
    slots: Vec<Slot>,
    step: usize,
}

#[derive(Debug)]
struct Slot {
    name: String,
    group: String,
    lr_multiplier: f64,
    param: Var,
    master: Option<Var>,
    exp_avg: Tensor,
    exp_avg_sq: Tensor,
    decays: bool,
}

/// Per-step constants shared by every slot.
#[derive(Debug, Clone, Copy)]
struct AdamWStep {
    hyper: AdamWConfig,
    bias_correction1: f64,
    bias_correction2: f64,
}

impl AdamWStep {
    fn new(hyper: AdamWConfig, step: usize) -> Self {
        let exponent = i32::try_from(step).unwrap_or(i32::MAX);
        Self {
            hyper,
            bias_correction1: 1.0 - hyper.beta1.powi(exponent),
            bias_correction2: 1.0 - hyper.beta2.powi(exponent),
        }
    }
}

impl Slot {
    fn new(
        name: String,
        group: &str,
        lr_multiplier: f64,
        param: Var,
        options: &TrainerOptimizerOptions,
    ) -> Result<Self, TrainingError> {
        let tensor = param.as_tensor();
        if !tensor.dtype().is_float() {
            return Err(TrainingError::initialization(format!(
                "parameter '{name}' is not floating point"
            )));
        }
        let zeros = || Tensor::zeros(tensor.dims(), DType::F32, tensor.device());
        let master = if options.use_master_weights && tensor.dtype() != DType::F32 {
            let fp32 = tensor.to_dtype(DType::F32).map_err(to_runtime_error)?;
            Some(Var::from_tensor(&fp32).map_err(to_runtime_error)?)
        } else {
            None
        };
        let decays = !options
            .weight_decay_exclude
            .iter()
            .any(|fragment| !fragment.is_empty() && name.contains(fragment.as_str()));
        Ok(Self {
            exp_avg: zeros().map_err(to_runtime_error)?,
            exp_avg_sq: zeros().map_err(to_runtime_error)?,
            name,
            group: group.to_string(),
            lr_multiplier,
            param,
            master,
            decays,
        })
    }

    fn len(&self) -> usize {
        self.param.as_tensor().elem_count()
    }

    fn dims(&self) -> &[usize] {
        self.param.as_tensor().dims()
    }

    /// The value the update is applied to: the master copy when present.
    fn fp32_value(&self) -> Result<Tensor, TrainingError> {
        match &self.master {
            Some(master) => Ok(master.as_tensor().clone()),
            None => self
                .param
                .as_tensor()
                .to_dtype(DType::F32)
                .map_err(to_runtime_error),
        }
    }

    /// Stores an fp32 value into the master copy and the live parameter.
    fn write(&self, value: &Tensor) -> Result<(), TrainingError> {
        if let Some(master) = &self.master {
            master.set(value).map_err(to_runtime_error)?;
        }
        let live = value
            .to_dtype(self.param.as_tensor().dtype())
            .map_err(to_runtime_error)?;
        self.param.set(&live).map_err(to_runtime_error)
    }

    fn apply_adamw(&mut self, grad: &Tensor, step: &AdamWStep) -> Result<(), TrainingError> {
        let hyper = step.hyper;
        let lr = hyper.learning_rate * self.lr_multiplier;

        let exp_avg = self
            .exp_avg
            .affine(hyper.beta1, 0.0)
            .and_then(|m| m.add(&grad.affine(1.0 - hyper.beta1, 0.0)?))
            .map_err(to_runtime_error)?;
        let exp_avg_sq = self
            .exp_avg_sq
            .affine(hyper.beta2, 0.0)
            .and_then(|v| v.add(&grad.sqr()?.affine(1.0 - hyper.beta2, 0.0)?))
            .map_err(to_runtime_error)?;

        let denom = exp_avg_sq
            .affine(1.0 / step.bias_correction2, 0.0)
            .and_then(|v| v.sqrt())
            .and_then(|v| v.affine(1.0, hyper.epsilon))
            .map_err(to_runtime_error)?;
        let update = exp_avg
            .affine(lr / step.bias_correction1, 0.0)
            .and_then(|m| m.div(&denom))
            .map_err(to_runtime_error)?;

        let mut value = self.fp32_value()?;
        if self.decays && hyper.weight_decay != 0.0 {
            value = value
                .affine(1.0 - lr * hyper.weight_decay, 0.0)
                .map_err(to_runtime_error)?;
        }
        let next = value.sub(&update).map_err(to_runtime_error)?;
        self.write(&next)?;

        self.exp_avg = exp_avg;
        self.exp_avg_sq = exp_avg_sq;
        Ok(())
    }

    fn snapshot(&self) -> Result<ParameterState, TrainingError> {
        Ok(ParameterState {
            name: self.name.clone(),
            shape: self.dims().to_vec(),
            first_moment: flat_f32(&self.exp_avg)?,
            second_moment: flat_f32(&self.exp_avg_sq)?,
            master: match &self.master {
                Some(master) => Some(flat_f32(master.as_tensor())?),
                None => None,
            },
        })
    }

    fn restore(&mut self, state: ParameterState) -> Result<(), TrainingError> {
        if state.shape.as_slice() != self.dims() {
            return Err(TrainingError::runtime(format!(
                "optimizer state for '{}' has shape {:?}, parameter has {:?}",
                self.name,
                state.shape,
                self.dims()
            )));
        }
        let expected = self.len();
        let sizes_match = state.first_moment.len() == expected
            && state.second_moment.len() == expected
            && state.master.as_ref().map_or(true, |m| m.len() == expected);
        if !sizes_match {
            return Err(TrainingError::runtime(format!(
                "optimizer state for '{}' does not hold {expected} values",
                self.name
            )));
        }

        let device = self.param.as_tensor().device().clone();
        let dims = self.dims().to_vec();
        let shaped = |values: Vec<f32>| {
            Tensor::from_vec(values, dims.as_slice(), &device).map_err(to_runtime_error)
        };
        self.exp_avg = shaped(state.first_moment)?;
        self.exp_avg_sq = shaped(state.second_moment)?;

        match (self.master.is_some(), state.master) {
            (true, Some(values)) => self.write(&shaped(values)?)?,
            // Saved without fp32 copies: rebuild them from the restored weights.
            (true, None) => {
                let rebuilt = self.fp32_from_param()?;
                if let Some(master) = &self.master {
                    master.set(&rebuilt).map_err(to_runtime_error)?;
                }
            }
            (false, _) => {}
        }
        Ok(())
    }

    fn fp32_from_param(&self) -> Result<Tensor, TrainingError> {
        self.param
            .as_tensor()
            .to_dtype(DType::F32)
            .map_err(to_runtime_error)
    }
}

impl TrainerOptimizer {
    pub fn new(
        partition: ParameterPartition,
        config: OptimizerConfig,
        options: TrainerOptimizerOptions,
    ) -> Result<Self, TrainingError> {
        let mut slots = Vec::with_capacity(partition.parameter_count());
        for group in partition.into_groups() {
            for (name, var) in group.parameters {
                slots.push(Slot::new(
                    name,
                    &group.name,
                    group.lr_multiplier,
                    var,
                    &options,
                )?);
            }
        }
        if slots.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }
        Ok(Self {
            config,
            slots,
            step: 0,
        })
    }

    /// Base learning rate before group multipliers.
    pub fn learning_rate(&self) -> f64 {
        match self.config {
            OptimizerConfig::AdamW(cfg) => cfg.learning_rate,
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match &mut self.config {
            OptimizerConfig::AdamW(cfg) => cfg.learning_rate = lr,
        }
    }

    /// Consumes the gradients of every owned parameter from `grads`. A store
    /// holding none of them leaves the step counter untouched.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        let mut pending = Vec::new();
        for (idx, slot) in self.slots.iter().enumerate() {
            if let Some(grad) = grads.remove(slot.param.as_tensor()) {
                pending.push((idx, grad.to_dtype(DType::F32).map_err(to_runtime_error)?));
            }
        }
        if pending.is_empty() {
            return Ok(());
        }

        self.step += 1;
        let OptimizerConfig::AdamW(hyper) = self.config;
        let constants = AdamWStep::new(hyper, self.step);
        for (idx, grad) in pending {
            self.slots[idx].apply_adamw(&grad, &constants)?;
        }
        Ok(())
    }

    /// Group name and effective learning rate, in partition order.
    pub fn group_learning_rates(&self) -> Vec<(String, f64)> {
        let base = self.learning_rate();
        let mut rates: Vec<(String, f64)> = Vec::new();
        for slot in &self.slots {
            if rates.iter().all(|(group, _)| group != &slot.group) {
                rates.push((slot.group.clone(), base * slot.lr_multiplier));
            }
        }
        rates
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    pub fn parameters(&self) -> impl Iterator<Item = (&str, &Var)> {
        self.slots
            .iter()
            .map(|slot| (slot.name.as_str(), &slot.param))
    }

    /// Re-derives fp32 master copies after parameters were overwritten
    /// outside the optimizer, e.g. by a pretrained load.
    pub fn sync_master_weights(&mut self) -> Result<(), TrainingError> {
        for slot in &self.slots {
            if let Some(master) = &slot.master {
                master
                    .set(&slot.fp32_from_param()?)
                    .map_err(to_runtime_error)?;
            }
        }
        Ok(())
    }

    /// Drops this optimizer's gradients so the next `step` skips them.
    pub fn zero_grad(&self, grads: &mut GradStore) {
        for slot in &self.slots {
            grads.remove(slot.param.as_tensor());
        }
    }

    pub fn state(&self) -> Result<OptimizerState, TrainingError> {
        Ok(OptimizerState {
            step: self.step,
            parameters: self
                .slots
                .iter()
                .map(Slot::snapshot)
                .collect::<Result<_, _>>()?,
        })
    }

    /// Restores moments by parameter name. Every live parameter needs an
    /// entry and no entry may be left over.
    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        let mut by_name: HashMap<String, ParameterState> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();
        for slot in &mut self.slots {
            let saved = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::runtime(format!("optimizer state missing parameter '{}'", slot.name))
            })?;
            slot.restore(saved)?;
        }
        if !by_name.is_empty() {
            let mut extra: Vec<String> = by_name.into_keys().collect();
            extra.sort();
            return Err(TrainingError::runtime(format!(
                "optimizer state holds unknown parameters: {}",
                extra.join(", ")
            )));
        }
        self.step = state.step;
        Ok(())
    }
}

fn flat_f32(tensor: &Tensor) -> Result<Vec<f32>, TrainingError> {
    tensor
        .to_dtype(DType::F32)
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(to_runtime_error)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerState {
    pub step: usize,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub first_moment: Vec<f32>,
    pub second_moment: Vec<f32>,
    pub master: Option<Vec<f32>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParameterGroupConfig;
    use candle_core::Device;

    fn adamw(learning_rate: f64, weight_decay: f64) -> OptimizerConfig {
        OptimizerConfig::AdamW(AdamWConfig {
            learning_rate,
            beta1: 0.8,
            beta2: 0.99,
            epsilon: 1e-9,
            weight_decay,
        })
    }

    fn optimizer_for(names: &[&str], lr_multiplier: f64) -> TrainerOptimizer {
        let params = names
            .iter()
            .map(|name| {
                let var = Var::from_slice(&[1.0f32, 1.0], 2, &Device::Cpu).unwrap();
                (name.to_string(), var)
            })
            .collect();
        let partition = ParameterPartition::build(
            params,
            &[ParameterGroupConfig {
                name: "text".into(),
                prefixes: vec!["text".into()],
                lr_multiplier: Some(lr_multiplier),
            }],
            0.4,
        )
        .unwrap();
        TrainerOptimizer::new(partition, adamw(0.1, 0.0), TrainerOptimizerOptions::default())
            .unwrap()
    }

    fn values(optimizer: &TrainerOptimizer, name: &str) -> Vec<f32> {
        let (_, var) = optimizer.parameters().find(|(n, _)| *n == name).unwrap();
        var.as_tensor().to_vec1::<f32>().unwrap()
    }

    fn sum_loss(optimizer: &TrainerOptimizer) -> Tensor {
        optimizer
            .parameters()
            .map(|(_, var)| var.as_tensor().sum_all().unwrap())
            .reduce(|a, b| (a + b).unwrap())
            .unwrap()
    }

    #[test]
    fn low_rate_group_moves_proportionally_less() {
        let mut optimizer = optimizer_for(&["text.weight", "dec.weight"], 0.5);
        let mut grads = sum_loss(&optimizer).backward().unwrap();
        optimizer.step(&mut grads).unwrap();

        // First AdamW step moves each element by ~lr regardless of gradient scale.
        let text = values(&optimizer, "text.weight");
        let dec = values(&optimizer, "dec.weight");
        assert!((1.0 - text[0] - 0.05).abs() < 1e-4, "{text:?}");
        assert!((1.0 - dec[0] - 0.1).abs() < 1e-4, "{dec:?}");
        assert_eq!(optimizer.step_count(), 1);

        let rates = optimizer.group_learning_rates();
        assert!(rates.contains(&("text".to_string(), 0.05)));
        assert!(rates.contains(&("base".to_string(), 0.1)));
    }

    #[test]
    fn excluded_names_skip_weight_decay() {
        let params = vec![
            ("dec.bias".to_string(), Var::from_slice(&[1.0f32], 1, &Device::Cpu).unwrap()),
            ("dec.weight".to_string(), Var::from_slice(&[1.0f32], 1, &Device::Cpu).unwrap()),
        ];
        let mut optimizer = TrainerOptimizer::new(
            ParameterPartition::uniform(params).unwrap(),
            adamw(0.1, 0.5),
            TrainerOptimizerOptions {
                weight_decay_exclude: vec!["bias".into()],
                ..TrainerOptimizerOptions::default()
            },
        )
        .unwrap();
        let mut grads = sum_loss(&optimizer).backward().unwrap();
        optimizer.step(&mut grads).unwrap();

        let bias = values(&optimizer, "dec.bias")[0];
        let weight = values(&optimizer, "dec.weight")[0];
        assert!((bias - 0.9).abs() < 1e-4, "{bias}");
        assert!((weight - (0.95 - 0.1)).abs() < 1e-4, "{weight}");
    }

    #[test]
    fn half_precision_parameters_update_through_master_copy() {
        let var = Var::from_tensor(
            &Tensor::new(&[1.0f32, 2.0], &Device::Cpu)
                .unwrap()
                .to_dtype(DType::F16)
                .unwrap(),
        )
        .unwrap();
        let mut optimizer = TrainerOptimizer::new(
            ParameterPartition::uniform(vec![("w".to_string(), var.clone())]).unwrap(),
            adamw(1e-4, 0.0),
            TrainerOptimizerOptions::default(),
        )
        .unwrap();
        let loss = var.as_tensor().to_dtype(DType::F32).unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        optimizer.step(&mut grads).unwrap();

        let state = optimizer.state().unwrap();
        let master = state.parameters[0].master.clone().unwrap();
        // 1e-4 is below f16 resolution at 1.0; only the master copy sees it.
        assert!((master[0] - (1.0 - 1e-4)).abs() < 1e-6, "{master:?}");
        assert_eq!(var.as_tensor().dtype(), DType::F16);
    }

    #[test]
    fn state_round_trip_restores_moments() {
        let mut optimizer = optimizer_for(&["dec.weight"], 1.0);
        let loss = optimizer
            .parameters()
            .map(|(_, var)| var.as_tensor().sqr().unwrap().sum_all().unwrap())
            .next()
            .unwrap();
        let mut grads = loss.backward().unwrap();
        optimizer.step(&mut grads).unwrap();
        let state = optimizer.state().unwrap();

        let mut fresh = optimizer_for(&["dec.weight"], 1.0);
        fresh.load_state(state.clone()).unwrap();
        let restored = fresh.state().unwrap();
        assert_eq!(restored.step, 1);
        assert_eq!(
            restored.parameters[0].first_moment,
            state.parameters[0].first_moment
        );

        let mut other = optimizer_for(&["other.weight"], 1.0);
        assert!(other.load_state(state).is_err());
        assert_eq!(other.step_count(), 0);
    }

    #[test]
    fn empty_gradient_store_is_not_a_step() {
        let mut optimizer = optimizer_for(&["dec.weight"], 1.0);
        let unrelated = Var::from_slice(&[1.0f32], 1, &Device::Cpu).unwrap();
        let mut grads = unrelated.as_tensor().sum_all().unwrap().backward().unwrap();
        optimizer.step(&mut grads).unwrap();
        assert_eq!(optimizer.step_count(), 0);
        assert_eq!(values(&optimizer, "dec.weight"), vec![1.0, 1.0]);
    }
}
