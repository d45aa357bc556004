//! One adversarial step per batch: discriminator update, then generator
//! update, under a single loss scale.

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use tracing::{debug, trace};

use crate::{
    config::{LossWeights, TrainingConfig},
    data::AudioBatch,
    distributed::ComputeContext,
    error::to_runtime_error,
    loss::{feature_matching_loss, kl_loss, l1_mean, scalar, AdversarialLoss, LeastSquaresLoss},
    model::{Discriminator, Generator, MelTransform, TrainableModule},
    optimizer::{GradientScaler, TrainerOptimizer},
    scheduler::ExponentialDecay,
    TrainingError,
};

/// Process-wide progress counters, threaded explicitly through the loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrainingState {
    /// Completed (discriminator, generator) step pairs since training began.
    pub global_step: u64,
    /// 1-based epoch currently running.
    pub epoch: usize,
}

/// Model, optimizer and schedule for one role.
pub struct OptimizationUnit<M> {
    pub model: M,
    pub optimizer: TrainerOptimizer,
    pub scheduler: ExponentialDecay,
    pub parameters: Vec<(String, Var)>,
}

impl<M: TrainableModule> OptimizationUnit<M> {
    /// Builds the unit from the optimizer's own parameter view so both
    /// always agree on names.
    pub fn new(model: M, optimizer: TrainerOptimizer, scheduler: ExponentialDecay) -> Self {
        let parameters = optimizer
            .parameters()
            .map(|(name, var)| (name.to_string(), var.clone()))
            .collect();
        Self {
            model,
            optimizer,
            scheduler,
            parameters,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    DiscriminatorForward,
    DiscriminatorBackward,
    GeneratorForward,
    GeneratorBackward,
    Done,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// Training segment length in waveform samples.
    pub segment_size: usize,
    pub hop_length: usize,
    pub clip_discriminator: Option<f64>,
    pub clip_generator: Option<f64>,
    pub weights: LossWeights,
}

impl EngineSettings {
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self {
            segment_size: config.train.segment_size,
            hop_length: config.data.hop_length,
            clip_discriminator: config.train.grad_clip_discriminator,
            clip_generator: config.train.grad_clip_generator,
            weights: config.train.loss_weights,
        }
    }
}

/// Telemetry of one batch. Generator terms are already weighted.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub global_step: u64,
    pub loss_disc: f32,
    pub loss_disc_real: Vec<f32>,
    pub loss_disc_fake: Vec<f32>,
    pub loss_gen: f32,
    pub loss_fm: f32,
    pub loss_mel: f32,
    pub loss_kl_ssl: f32,
    pub loss_kl: f32,
    pub loss_gen_all: f32,
    pub grad_norm_d: f32,
    pub grad_norm_g: f32,
    pub skipped_d: bool,
    pub skipped_g: bool,
    pub loss_scale: f32,
    /// Mel spectrograms of the first sample, `[mels, frames]`, detached.
    pub mel_real: Tensor,
    pub mel_fake: Tensor,
}

impl StepReport {
    /// Every generator term in logging order.
    pub fn generator_terms(&self) -> [(&'static str, f32); 5] {
        [
            ("loss/g/gen", self.loss_gen),
            ("loss/g/fm", self.loss_fm),
            ("loss/g/mel", self.loss_mel),
            ("loss/g/kl_ssl", self.loss_kl_ssl),
            ("loss/g/kl", self.loss_kl),
        ]
    }

    pub fn has_non_finite_loss(&self) -> bool {
        !(self.loss_disc.is_finite() && self.loss_gen_all.is_finite())
    }
}

#[derive(Debug, Clone, Copy)]
struct PassOutcome {
    grad_norm: f32,
    skipped: bool,
}

pub struct AdversarialStepEngine {
    context: ComputeContext,
    settings: EngineSettings,
    loss: Box<dyn AdversarialLoss>,
    scaler: GradientScaler,
    phase: StepPhase,
}

impl AdversarialStepEngine {
    pub fn new(context: ComputeContext, settings: EngineSettings, scaler: GradientScaler) -> Self {
        Self::with_loss(context, settings, scaler, Box::new(LeastSquaresLoss))
    }

    pub fn with_loss(
        context: ComputeContext,
        settings: EngineSettings,
        scaler: GradientScaler,
        loss: Box<dyn AdversarialLoss>,
    ) -> Self {
        Self {
            context,
            settings,
            loss,
            scaler,
            phase: StepPhase::Done,
        }
    }

    /// Where the last step got to: `Done` after a completed step, the
    /// failing phase after an error.
    pub fn phase(&self) -> StepPhase {
        self.phase
    }

    pub fn scaler(&self) -> &GradientScaler {
        &self.scaler
    }

    pub fn scaler_mut(&mut self) -> &mut GradientScaler {
        &mut self.scaler
    }

    /// Runs the full discriminator-then-generator sequence on `batch` and
    /// advances `state.global_step` once both passes have finished, skipped
    /// or not.
    pub fn step<G, D>(
        &mut self,
        state: &mut TrainingState,
        batch: &AudioBatch,
        generator: &mut OptimizationUnit<G>,
        discriminator: &mut OptimizationUnit<D>,
        mel: &dyn MelTransform,
    ) -> Result<StepReport, TrainingError>
    where
        G: Generator,
        D: Discriminator,
    {
        self.phase = StepPhase::DiscriminatorForward;
        let output = generator.model.forward_train(batch)?;
        let real = self.slice_real(&batch.waveform, &output.slice_starts)?;
        let fake = &output.waveform;
        let scores = discriminator.model.forward(&real, &fake.detach())?;
        let disc_loss = self
            .loss
            .discriminator_loss(&scores.real_scores, &scores.fake_scores)?;
        let loss_disc = scalar(&disc_loss.total)?;

        self.phase = StepPhase::DiscriminatorBackward;
        let disc_pass = self.backward_and_step(
            &disc_loss.total,
            &mut discriminator.optimizer,
            &discriminator.parameters,
            self.settings.clip_discriminator,
        )?;

        self.phase = StepPhase::GeneratorForward;
        // Scores come from the freshly stepped discriminator.
        let scores = discriminator.model.forward(&real, fake)?;
        let weights = self.settings.weights;
        let mel_real = mel.mel(&real)?;
        let mel_fake = mel.mel(fake)?;
        let loss_mel = weighted(&l1_mean(&mel_real, &mel_fake)?, weights.mel)?;
        let latents = &output.latents;
        let loss_kl = weighted(
            &kl_loss(
                &latents.z_p,
                &latents.logs_q,
                &latents.m_p,
                &latents.logs_p,
                &output.z_mask,
            )?,
            weights.kl,
        )?;
        let loss_fm = weighted(
            &feature_matching_loss(&scores.real_features, &scores.fake_features)?,
            weights.feature_matching,
        )?;
        let loss_gen = weighted(
            &self.loss.generator_loss(&scores.fake_scores)?.total,
            weights.adversarial,
        )?;
        let loss_kl_ssl = weighted(&output.commitment_loss, weights.commitment)?;
        let loss_gen_all = [&loss_fm, &loss_mel, &loss_kl_ssl, &loss_kl]
            .into_iter()
            .try_fold(loss_gen.clone(), |acc, term| acc.add(term))
            .map_err(to_runtime_error)?;

        self.phase = StepPhase::GeneratorBackward;
        let gen_pass = self.backward_and_step(
            &loss_gen_all,
            &mut generator.optimizer,
            &generator.parameters,
            self.settings.clip_generator,
        )?;

        self.phase = StepPhase::Done;
        let loss_scale = self.scaler.loss_scale();
        self.scaler.update(disc_pass.skipped || gen_pass.skipped);
        state.global_step += 1;
        if disc_pass.skipped || gen_pass.skipped {
            debug!(
                global_step = state.global_step,
                skipped_d = disc_pass.skipped,
                skipped_g = gen_pass.skipped,
                loss_scale = self.scaler.loss_scale(),
                "non-finite gradients, optimizer step skipped"
            );
        }

        Ok(StepReport {
            global_step: state.global_step,
            loss_disc,
            loss_disc_real: disc_loss.real_losses,
            loss_disc_fake: disc_loss.fake_losses,
            loss_gen: scalar(&loss_gen)?,
            loss_fm: scalar(&loss_fm)?,
            loss_mel: scalar(&loss_mel)?,
            loss_kl_ssl: scalar(&loss_kl_ssl)?,
            loss_kl: scalar(&loss_kl)?,
            loss_gen_all: scalar(&loss_gen_all)?,
            grad_norm_d: disc_pass.grad_norm,
            grad_norm_g: gen_pass.grad_norm,
            skipped_d: disc_pass.skipped,
            skipped_g: gen_pass.skipped,
            loss_scale,
            mel_real: first_sample(&mel_real)?,
            mel_fake: first_sample(&mel_fake)?,
        })
    }

    /// Cuts each sample's training segment out of `[batch, 1, samples]`.
    fn slice_real(&self, waveform: &Tensor, starts: &[usize]) -> Result<Tensor, TrainingError> {
        let (batch, _, samples) = waveform.dims3().map_err(to_runtime_error)?;
        if starts.len() != batch {
            return Err(TrainingError::runtime(format!(
                "generator returned {} segment starts for a batch of {batch}",
                starts.len()
            )));
        }
        let segment = self.settings.segment_size;
        let mut pieces = Vec::with_capacity(batch);
        for (idx, &start_frame) in starts.iter().enumerate() {
            let start = start_frame * self.settings.hop_length;
            if start + segment > samples {
                return Err(TrainingError::runtime(format!(
                    "segment {start}..{} exceeds waveform of {samples} samples",
                    start + segment
                )));
            }
            pieces.push(
                waveform
                    .narrow(0, idx, 1)
                    .and_then(|t| t.narrow(2, start, segment))
                    .map_err(to_runtime_error)?,
            );
        }
        Tensor::cat(&pieces, 0).map_err(to_runtime_error)
    }

    /// Scale, backward, all-reduce, unscale, overflow check, clip, step.
    fn backward_and_step(
        &self,
        loss: &Tensor,
        optimizer: &mut TrainerOptimizer,
        parameters: &[(String, Var)],
        clip: Option<f64>,
    ) -> Result<PassOutcome, TrainingError> {
        let scaled = self.scaler.scale(loss)?;
        let mut grads = scaled.backward().map_err(to_runtime_error)?;
        self.context.group.all_reduce_mean(&mut grads, parameters)?;

        let unscaled = unscale_owned(&self.scaler, &mut grads, parameters)?;
        let grad_norm = global_norm(&unscaled)?;
        if self.scaler.has_overflow(&unscaled)? {
            optimizer.zero_grad(&mut grads);
            return Ok(PassOutcome {
                grad_norm,
                skipped: true,
            });
        }

        if let Some(bound) = clip.filter(|bound| *bound > 0.0) {
            for (_, var) in parameters {
                if let Some(grad) = grads.remove(var.as_tensor()) {
                    let clipped = grad.clamp(-bound, bound).map_err(to_runtime_error)?;
                    grads.insert(var.as_tensor(), clipped);
                }
            }
        }

        trace!(grad_norm, "optimizer step");
        optimizer.step(&mut grads)?;
        Ok(PassOutcome {
            grad_norm,
            skipped: false,
        })
    }
}

/// Replaces each owned gradient with its unscaled value and returns them.
fn unscale_owned(
    scaler: &GradientScaler,
    grads: &mut GradStore,
    parameters: &[(String, Var)],
) -> Result<Vec<Tensor>, TrainingError> {
    let mut unscaled = Vec::with_capacity(parameters.len());
    for (_, var) in parameters {
        if let Some(grad) = grads.remove(var.as_tensor()) {
            let grad = scaler.unscale(&grad)?;
            grads.insert(var.as_tensor(), grad.clone());
            unscaled.push(grad);
        }
    }
    Ok(unscaled)
}

fn global_norm(grads: &[Tensor]) -> Result<f32, TrainingError> {
    let mut total = 0.0f32;
    for grad in grads {
        total += grad
            .to_dtype(DType::F32)
            .and_then(|g| g.sqr())
            .and_then(|g| g.sum_all())
            .and_then(|g| g.to_vec0::<f32>())
            .map_err(to_runtime_error)?;
    }
    Ok(total.sqrt())
}

fn weighted(term: &Tensor, weight: f64) -> Result<Tensor, TrainingError> {
    term.to_dtype(DType::F32)
        .and_then(|t| t.affine(weight, 0.0))
        .map_err(to_runtime_error)
}

fn first_sample(mel: &Tensor) -> Result<Tensor, TrainingError> {
    mel.detach()
        .narrow(0, 0, 1)
        .and_then(|t| t.squeeze(0))
        .and_then(|t| t.to_dtype(DType::F32))
        .map_err(to_runtime_error)
}
