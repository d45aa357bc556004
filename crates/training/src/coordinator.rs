use std::{fmt, sync::Arc};

use candle_core::Tensor;
use tracing::{debug, error, info, warn};

use crate::{
    checkpoint::{load_pretrained, CheckpointStore, EpochCheckpointPolicy, Role, SaveRequest},
    data::{AudioBatch, BucketedBatchSource, Dataset, EpochBatches, PrefetchLoader},
    distributed::ComputeContext,
    engine::{AdversarialStepEngine, EngineSettings, OptimizationUnit, StepReport, TrainingState},
    error::to_runtime_error,
    logging::{MetricSink, NullSink},
    metrics::{EpochMetrics, EpochSummary},
    model::{Discriminator, Generator, MelTransform},
    optimizer::{
        GradientScaler, OptimizerConfig, TrainerOptimizer, TrainerOptimizerOptions,
    },
    params::ParameterPartition,
    scheduler::{ExponentialDecay, LRScheduler},
    TrainingConfig, TrainingError,
};

/// How startup initialized the models.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryPath {
    Resumed { epoch: usize, global_step: u64 },
    Pretrained,
    Fresh,
}

impl fmt::Display for RecoveryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryPath::Resumed { epoch, global_step } => {
                write!(f, "resumed at epoch {epoch}, step {global_step}")
            }
            RecoveryPath::Pretrained => f.write_str("pretrained"),
            RecoveryPath::Fresh => f.write_str("fresh"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub state: TrainingState,
    pub epochs: Vec<EpochSummary>,
    /// Training ended early on a stop request.
    pub stopped: bool,
}

/// Drives the epoch loop for one worker. Only the primary worker writes
/// checkpoints and metrics.
pub struct TrainingCoordinator<G, D, S>
where
    G: Generator,
    D: Discriminator,
    S: Dataset + 'static,
{
    config: TrainingConfig,
    context: ComputeContext,
    generator: OptimizationUnit<G>,
    discriminator: OptimizationUnit<D>,
    engine: AdversarialStepEngine,
    mel: Box<dyn MelTransform>,
    dataset: Arc<S>,
    sampler: BucketedBatchSource,
    store: CheckpointStore,
    policy: EpochCheckpointPolicy,
    sink: Box<dyn MetricSink>,
    state: TrainingState,
    start_epoch: usize,
}

impl<G, D, S> TrainingCoordinator<G, D, S>
where
    G: Generator,
    D: Discriminator,
    S: Dataset + 'static,
{
    pub fn new(
        config: TrainingConfig,
        context: ComputeContext,
        generator: G,
        discriminator: D,
        mel: Box<dyn MelTransform>,
        dataset: Arc<S>,
        sink: Box<dyn MetricSink>,
    ) -> Result<Self, TrainingError> {
        config.validate()?;
        let train = &config.train;

        let generator_partition = ParameterPartition::build(
            generator.named_parameters(),
            &train.parameter_groups,
            train.text_low_lr_rate,
        )?;
        for group in generator_partition.groups() {
            info!(
                group = %group.name,
                parameters = group.parameters.len(),
                lr_multiplier = group.lr_multiplier,
                "generator parameter group"
            );
        }
        let discriminator_partition = ParameterPartition::uniform(discriminator.named_parameters())?;

        let generator = OptimizationUnit::new(
            generator,
            build_optimizer(generator_partition, &config)?,
            ExponentialDecay::new(train.learning_rate, train.lr_decay)?,
        );
        let discriminator = OptimizationUnit::new(
            discriminator,
            build_optimizer(discriminator_partition, &config)?,
            ExponentialDecay::new(train.learning_rate, train.lr_decay)?,
        );

        let sampler = BucketedBatchSource::new(
            &dataset.lengths(),
            &config.data.bucket_boundaries,
            train.batch_size,
            context.world_size(),
            train.seed,
        )?;
        let engine = AdversarialStepEngine::new(
            context.clone(),
            EngineSettings::from_config(&config),
            GradientScaler::with_config(train.loss_scale.clone(), train.precision),
        );
        let policy = EpochCheckpointPolicy::from_config(train);
        let store = policy.store(&train.checkpoint_dir);
        let sink: Box<dyn MetricSink> = if context.is_primary() {
            sink
        } else {
            Box::new(NullSink)
        };

        Ok(Self {
            config,
            context,
            generator,
            discriminator,
            engine,
            mel,
            dataset,
            sampler,
            store,
            policy,
            sink,
            state: TrainingState {
                global_step: 0,
                epoch: 1,
            },
            start_epoch: 1,
        })
    }

    pub fn state(&self) -> TrainingState {
        self.state
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    pub fn generator(&self) -> &OptimizationUnit<G> {
        &self.generator
    }

    pub fn discriminator(&self) -> &OptimizationUnit<D> {
        &self.discriminator
    }

    pub fn engine(&self) -> &AdversarialStepEngine {
        &self.engine
    }

    pub fn sampler(&self) -> &BucketedBatchSource {
        &self.sampler
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Resume from the newest checkpoints, else load pretrained weights,
    /// else keep the models' initialization. Only unrecoverable errors
    /// escape; a corrupt checkpoint falls through to the next option.
    pub fn startup(&mut self) -> Result<RecoveryPath, TrainingError> {
        let path = match self.try_resume() {
            Ok(Some(path)) => path,
            Ok(None) => {
                info!(directory = %self.store.directory().display(), "no resumable checkpoints");
                self.load_pretrained_weights()?
            }
            Err(err) if err.is_recoverable_load_failure() => {
                warn!(error = %err, "checkpoint unusable, falling back");
                self.load_pretrained_weights()?
            }
            Err(err) => return Err(err),
        };

        self.start_epoch = match &path {
            RecoveryPath::Resumed { epoch, global_step } => {
                self.state = TrainingState {
                    global_step: *global_step,
                    epoch: *epoch,
                };
                *epoch
            }
            RecoveryPath::Pretrained | RecoveryPath::Fresh => {
                self.state = TrainingState {
                    global_step: 0,
                    epoch: 1,
                };
                1
            }
        };

        let train = &self.config.train;
        self.generator.scheduler =
            ExponentialDecay::new(train.learning_rate, train.lr_decay)?.starting_at(self.start_epoch);
        self.discriminator.scheduler =
            ExponentialDecay::new(train.learning_rate, train.lr_decay)?.starting_at(self.start_epoch);

        info!(
            rank = self.context.rank(),
            recovery = %path,
            start_epoch = self.start_epoch,
            "training startup"
        );
        Ok(path)
    }

    fn try_resume(&mut self) -> Result<Option<RecoveryPath>, TrainingError> {
        let Some(discriminator_id) = self.store.find_latest(Role::Discriminator)? else {
            return Ok(None);
        };
        let Some(generator_id) = self.store.find_latest(Role::Generator)? else {
            return Ok(None);
        };

        // Validate both before touching either model.
        let discriminator_record = self
            .store
            .load(&discriminator_id, &self.discriminator.parameters)?;
        let generator_record = self.store.load(&generator_id, &self.generator.parameters)?;

        let stored_epoch = generator_record.epoch();
        if discriminator_record.epoch() != stored_epoch {
            warn!(
                generator_epoch = stored_epoch,
                discriminator_epoch = discriminator_record.epoch(),
                "generator and discriminator checkpoints come from different epochs"
            );
        }
        let recorded_step = generator_record.manifest.global_step;
        let scaler = generator_record.manifest.scaler.clone();

        discriminator_record.apply(
            &self.discriminator.parameters,
            &mut self.discriminator.optimizer,
        )?;
        generator_record.apply(&self.generator.parameters, &mut self.generator.optimizer)?;
        if let Some(saved) = scaler {
            self.engine.scaler_mut().load_state(&saved);
        }

        let global_step = stored_epoch as u64 * self.sampler.batches_per_worker() as u64;
        if global_step != recorded_step {
            warn!(
                recorded = recorded_step,
                restored = global_step,
                "batches per epoch changed since the checkpoint was written; new step-numbered checkpoints may sort below existing ones and colliding saves are refused"
            );
        }

        Ok(Some(RecoveryPath::Resumed {
            epoch: stored_epoch + 1,
            global_step,
        }))
    }

    fn load_pretrained_weights(&mut self) -> Result<RecoveryPath, TrainingError> {
        let train = &self.config.train;
        let mut loaded = false;
        for (role, path) in [
            (Role::Generator, train.pretrained_generator.as_ref()),
            (Role::Discriminator, train.pretrained_discriminator.as_ref()),
        ] {
            let Some(path) = path else {
                continue;
            };
            if !path.is_file() {
                warn!(role = %role, path = %path.display(), "pretrained weights not found");
                continue;
            }
            let (parameters, optimizer) = match role {
                Role::Discriminator => (
                    &self.discriminator.parameters,
                    &mut self.discriminator.optimizer,
                ),
                Role::Generator | Role::Semantic => {
                    (&self.generator.parameters, &mut self.generator.optimizer)
                }
            };
            match load_pretrained(path, parameters) {
                Ok(report) => {
                    optimizer.sync_master_weights()?;
                    info!(
                        role = %role,
                        loaded = report.loaded,
                        missing = report.missing.len(),
                        unexpected = report.unexpected.len(),
                        "applied pretrained weights"
                    );
                    loaded = true;
                }
                Err(err) if err.is_recoverable_load_failure() => {
                    warn!(role = %role, error = %err, "pretrained weights rejected");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(if loaded {
            RecoveryPath::Pretrained
        } else {
            RecoveryPath::Fresh
        })
    }

    pub fn train(&mut self) -> Result<TrainingOutcome, TrainingError> {
        self.train_with_shutdown(|| false)
    }

    /// `should_stop` is polled once per epoch, before the save decision; a
    /// stop request forces that epoch's checkpoint and then ends training.
    pub fn train_with_shutdown<F>(&mut self, mut should_stop: F) -> Result<TrainingOutcome, TrainingError>
    where
        F: FnMut() -> bool,
    {
        let mut epochs = Vec::new();
        let mut stopped = false;
        for epoch in self.start_epoch..=self.config.train.epochs {
            self.state.epoch = epoch;
            let (summary, sample) = self.run_epoch(epoch)?;
            info!(
                epoch,
                batches = summary.batches,
                loss_disc = summary.mean_loss_disc,
                loss_gen_all = summary.mean_loss_gen,
                skipped_d = summary.skipped_d,
                skipped_g = summary.skipped_g,
                secs = summary.duration.as_secs_f64(),
                "epoch finished"
            );

            let stop = should_stop();
            if self.policy.should_save(epoch) || stop {
                self.save_epoch(epoch);
                if let Some(batch) = sample {
                    self.log_audio(&batch);
                }
            }
            self.context.group.barrier()?;

            self.generator.scheduler.step();
            self.discriminator.scheduler.step();
            epochs.push(summary);

            if stop {
                info!(epoch, "stop requested, exiting after checkpoint");
                stopped = true;
                break;
            }
        }

        if let Err(err) = self.sink.flush() {
            warn!(error = %err, "failed to flush metrics");
        }
        Ok(TrainingOutcome {
            state: self.state,
            epochs,
            stopped,
        })
    }

    fn run_epoch(&mut self, epoch: usize) -> Result<(EpochSummary, Option<AudioBatch>), TrainingError> {
        let lr_g = self.generator.scheduler.learning_rate();
        let lr_d = self.discriminator.scheduler.learning_rate();
        self.generator.optimizer.set_learning_rate(lr_g);
        self.discriminator.optimizer.set_learning_rate(lr_d);

        let plan = self.sampler.batches_for(epoch as u64, self.context.rank())?;
        let mut batches = EpochBatches::new(PrefetchLoader::spawn(
            Arc::clone(&self.dataset),
            plan,
            self.context.device.clone(),
            self.config.data.num_workers,
            self.config.data.prefetch_depth,
        ));

        let mut metrics = EpochMetrics::new(epoch);
        let mut sample = None;
        let log_interval = self.config.train.log_interval.max(1) as u64;
        while let Some(batch) = batches.next_batch()? {
            let report = match self.engine.step(
                &mut self.state,
                &batch,
                &mut self.generator,
                &mut self.discriminator,
                self.mel.as_ref(),
            ) {
                Ok(report) => report,
                Err(err) => {
                    error!(
                        epoch,
                        global_step = self.state.global_step,
                        phase = ?self.engine.phase(),
                        error = %err,
                        "training step failed"
                    );
                    return Err(err);
                }
            };
            metrics.record(&report);
            if self.context.is_primary() && (report.global_step - 1) % log_interval == 0 {
                self.log_step(epoch, &report, metrics.smoothed_losses());
            }
            if sample.is_none() {
                sample = Some(batch);
            }
        }
        debug!(epoch, batches = batches.delivered(), "epoch data exhausted");
        Ok((metrics.finish(), sample))
    }

    fn log_step(
        &mut self,
        epoch: usize,
        report: &StepReport,
        smoothed: (Option<f64>, Option<f64>),
    ) {
        let step = report.global_step - 1;
        let lr = self.generator.optimizer.learning_rate();
        let (disc_ema, gen_ema) = smoothed;
        info!(
            epoch,
            step,
            lr,
            disc_ema = disc_ema.unwrap_or(f64::NAN),
            gen_ema = gen_ema.unwrap_or(f64::NAN),
            loss_disc = report.loss_disc,
            loss_gen = report.loss_gen,
            loss_fm = report.loss_fm,
            loss_mel = report.loss_mel,
            loss_kl_ssl = report.loss_kl_ssl,
            loss_kl = report.loss_kl,
            loss_gen_all = report.loss_gen_all,
            grad_norm_d = report.grad_norm_d,
            grad_norm_g = report.grad_norm_g,
            loss_scale = report.loss_scale,
            "train step"
        );
        if report.has_non_finite_loss() {
            warn!(step, "non-finite loss");
        }

        let mut scalars: Vec<(String, f64)> = vec![
            ("loss/g/total".to_string(), report.loss_gen_all as f64),
            ("loss/d/total".to_string(), report.loss_disc as f64),
            ("learning_rate".to_string(), lr),
            ("grad_norm_d".to_string(), report.grad_norm_d as f64),
            ("grad_norm_g".to_string(), report.grad_norm_g as f64),
            ("loss_scale".to_string(), report.loss_scale as f64),
        ];
        scalars.extend(
            report
                .generator_terms()
                .iter()
                .map(|(tag, value)| (tag.to_string(), *value as f64)),
        );
        for (idx, value) in report.loss_disc_real.iter().enumerate() {
            scalars.push((format!("loss/d_r/{idx}"), *value as f64));
        }
        for (idx, value) in report.loss_disc_fake.iter().enumerate() {
            scalars.push((format!("loss/d_g/{idx}"), *value as f64));
        }

        let result = self
            .sink
            .add_scalars(step, &scalars)
            .and_then(|_| write_image(self.sink.as_mut(), "slice/mel_org", step, &report.mel_real))
            .and_then(|_| write_image(self.sink.as_mut(), "slice/mel_gen", step, &report.mel_fake));
        if let Err(err) = result {
            warn!(step, error = %err, "failed to write metrics");
        }
    }

    fn log_audio(&mut self, batch: &AudioBatch) {
        if !self.context.is_primary() {
            return;
        }
        let step = self.state.global_step;
        let rate = self.config.data.sampling_rate;
        let result = self
            .generator
            .model
            .infer(batch)
            .and_then(|generated| first_waveform(&generated))
            .and_then(|generated| self.sink.add_audio("gen/audio", step, &generated, rate))
            .and_then(|_| first_waveform(&batch.waveform))
            .and_then(|reference| self.sink.add_audio("gt/audio", step, &reference, rate));
        if let Err(err) = result {
            warn!(step, error = %err, "failed to log audio sample");
        }
    }

    /// Primary worker only. Failures are logged and training continues with
    /// the previous checkpoint intact.
    fn save_epoch(&mut self, epoch: usize) {
        if !self.context.is_primary() {
            return;
        }
        let scaler = self.engine.scaler().state();
        for role in [Role::Generator, Role::Discriminator] {
            let (parameters, optimizer) = match role {
                Role::Discriminator => (&self.discriminator.parameters, &self.discriminator.optimizer),
                Role::Generator | Role::Semantic => {
                    (&self.generator.parameters, &self.generator.optimizer)
                }
            };
            let request = SaveRequest {
                role,
                epoch,
                global_step: self.state.global_step,
                parameters,
                optimizer,
                scaler: scaler.clone(),
                config: &self.config,
            };
            match self.policy.persist(&self.store, request) {
                Ok(outcome) => info!(
                    role = %role,
                    path = %outcome.id.path.display(),
                    pruned = outcome.removed.len(),
                    "saved checkpoint"
                ),
                Err(err) => error!(role = %role, epoch, error = %err, "checkpoint save failed"),
            }
        }

        if !self.policy.exports() {
            return;
        }
        let exported = serde_json::to_value(&self.config)
            .map_err(TrainingError::from)
            .and_then(|config| {
                self.policy.export(
                    Role::Generator,
                    epoch,
                    self.state.global_step,
                    &self.generator.parameters,
                    &config,
                )
            });
        match exported {
            Ok(Some(outcome)) => info!(path = %outcome.path.display(), "exported generator weights"),
            Ok(None) => {}
            Err(err) => error!(epoch, error = %err, "deployment export failed"),
        }
    }
}

fn build_optimizer(
    partition: ParameterPartition,
    config: &TrainingConfig,
) -> Result<TrainerOptimizer, TrainingError> {
    TrainerOptimizer::new(
        partition,
        OptimizerConfig::from(&config.train),
        TrainerOptimizerOptions::default(),
    )
}

fn write_image(
    sink: &mut dyn MetricSink,
    tag: &str,
    step: u64,
    mel: &Tensor,
) -> Result<(), TrainingError> {
    let (rows, cols) = mel.dims2().map_err(to_runtime_error)?;
    let values = mel
        .flatten_all()
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(to_runtime_error)?;
    sink.add_array2d(tag, step, &values, rows, cols)
}

fn first_waveform(waveform: &Tensor) -> Result<Vec<f32>, TrainingError> {
    waveform
        .narrow(0, 0, 1)
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.to_dtype(candle_core::DType::F32))
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(to_runtime_error)
}
