#![allow(dead_code)]

use std::{
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use adversarial_training::{
    model::{DiscriminatorOutput, GeneratorOutput, LatentStatistics},
    AudioBatch, ComputeContext, Dataset, Discriminator, Generator, MelTransform, MetricSink,
    Precision, TrainableModule, TrainingConfig, TrainingCoordinator, TrainingError,
};
use candle_core::{DType, Device, Tensor, Var};

pub const SEGMENT: usize = 8;
pub const SAMPLES: usize = 16;
pub const EXAMPLES: usize = 10;

const BASE_CONFIG: &str = r#"
[train]
checkpoint_dir = "unset"
precision = "fp32"
epochs = 2
batch_size = 2
learning_rate = 0.01
lr_decay = 0.5
segment_size = 8
log_interval = 1
save_every_n_epochs = 1
retention = "all"
experiment_name = "toy"

[data]
sampling_rate = 16000
hop_length = 2
bucket_boundaries = [4, 8, 16]
num_workers = 0
prefetch_depth = 2
"#;

pub fn config(root: &Path, epochs: usize) -> TrainingConfig {
    let mut config: TrainingConfig = toml::from_str(BASE_CONFIG).unwrap();
    config.train.checkpoint_dir = root.join("ckpt");
    config.train.epochs = epochs;
    config
}

fn candle<T>(result: candle_core::Result<T>) -> Result<T, TrainingError> {
    result.map_err(|err| TrainingError::runtime(err.to_string()))
}

/// Ten clips with frame lengths 3..=12 and deterministic waveforms.
pub struct ToyDataset;

impl Dataset for ToyDataset {
    fn len(&self) -> usize {
        EXAMPLES
    }

    fn example_length(&self, index: usize) -> usize {
        3 + index % 10
    }

    fn collate(
        &self,
        indices: &[usize],
        bucket: usize,
        device: &Device,
    ) -> Result<AudioBatch, TrainingError> {
        let batch = indices.len();
        let samples: Vec<f32> = indices
            .iter()
            .flat_map(|&index| {
                (0..SAMPLES).map(move |t| ((index * SAMPLES + t) as f32 * 0.37).sin() * 0.5)
            })
            .collect();
        let waveform = candle(Tensor::from_vec(samples, (batch, 1, SAMPLES), device))?;
        let lengths = candle(Tensor::from_vec(vec![SAMPLES as u32; batch], batch, device))?;
        let zeros = |shape: &[usize]| candle(Tensor::zeros(shape, DType::F32, device));
        Ok(AudioBatch {
            ssl: zeros(&[batch, 4, 4])?,
            spec: zeros(&[batch, 4, 8])?,
            spec_lengths: lengths.clone(),
            waveform,
            waveform_lengths: lengths.clone(),
            text: zeros(&[batch, 4])?,
            text_lengths: lengths,
            speaker_embedding: None,
            indices: indices.to_vec(),
            bucket,
        })
    }
}

/// `gain * waveform + offset` over the first segment of each clip.
pub struct ToyGenerator {
    pub gain: Var,
    pub offset: Var,
}

impl ToyGenerator {
    pub fn new(gain: f32) -> Self {
        Self {
            gain: Var::from_slice(&[gain], 1, &Device::Cpu).unwrap(),
            offset: Var::from_slice(&[0.1f32], 1, &Device::Cpu).unwrap(),
        }
    }
}

impl TrainableModule for ToyGenerator {
    fn named_parameters(&self) -> Vec<(String, Var)> {
        vec![
            ("dec.gain".to_string(), self.gain.clone()),
            ("enc_p.text_embedding.weight".to_string(), self.offset.clone()),
        ]
    }
}

impl Generator for ToyGenerator {
    fn forward_train(&self, batch: &AudioBatch) -> Result<GeneratorOutput, TrainingError> {
        let size = batch.len();
        let segment = candle(batch.waveform.narrow(2, 0, SEGMENT))?;
        let waveform = candle(
            segment
                .broadcast_mul(self.gain.as_tensor())
                .and_then(|t| t.broadcast_add(self.offset.as_tensor())),
        )?;
        let commitment_loss = candle(self.offset.as_tensor().sqr().and_then(|t| t.mean_all()))?;
        let zeros = candle(Tensor::zeros((size, 2, 4), DType::F32, &Device::Cpu))?;
        let mask = candle(Tensor::ones((size, 1, 4), DType::F32, &Device::Cpu))?;
        Ok(GeneratorOutput {
            waveform,
            commitment_loss,
            slice_starts: batch.indices.iter().map(|index| index % 5).collect(),
            x_mask: mask.clone(),
            z_mask: mask,
            latents: LatentStatistics {
                z: zeros.clone(),
                z_p: zeros.clone(),
                m_p: zeros.clone(),
                logs_p: zeros.clone(),
                m_q: zeros.clone(),
                logs_q: zeros,
            },
            ssl_stats: None,
        })
    }

    fn infer(&self, batch: &AudioBatch) -> Result<Tensor, TrainingError> {
        candle(batch.waveform.broadcast_mul(self.gain.as_tensor()))
    }
}

/// Single-scale affine critic.
pub struct ToyDiscriminator {
    pub weight: Var,
    pub bias: Var,
    fail_on_forward: Option<usize>,
    forwards: AtomicUsize,
}

impl ToyDiscriminator {
    pub fn new() -> Self {
        Self {
            weight: Var::from_slice(&[0.5f32], 1, &Device::Cpu).unwrap(),
            bias: Var::from_slice(&[0.0f32], 1, &Device::Cpu).unwrap(),
            fail_on_forward: None,
            forwards: AtomicUsize::new(0),
        }
    }

    /// Errors on the `call`-th forward pass, counting from 1. Each batch runs
    /// two passes: discriminator update, then generator update.
    pub fn failing_on_forward(call: usize) -> Self {
        Self {
            fail_on_forward: Some(call),
            ..Self::new()
        }
    }

    fn score(&self, waveform: &Tensor) -> Result<Tensor, TrainingError> {
        candle(
            waveform
                .broadcast_mul(self.weight.as_tensor())
                .and_then(|t| t.broadcast_add(self.bias.as_tensor())),
        )
    }
}

impl TrainableModule for ToyDiscriminator {
    fn named_parameters(&self) -> Vec<(String, Var)> {
        vec![
            ("mpd.weight".to_string(), self.weight.clone()),
            ("mpd.bias".to_string(), self.bias.clone()),
        ]
    }
}

impl Discriminator for ToyDiscriminator {
    fn forward(&self, real: &Tensor, fake: &Tensor) -> Result<DiscriminatorOutput, TrainingError> {
        let call = self.forwards.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_forward == Some(call) {
            return Err(TrainingError::runtime(format!("forward {call} failed")));
        }
        let real_score = self.score(real)?;
        let fake_score = self.score(fake)?;
        Ok(DiscriminatorOutput {
            real_features: vec![vec![real_score.clone()]],
            fake_features: vec![vec![fake_score.clone()]],
            real_scores: vec![real_score],
            fake_scores: vec![fake_score],
        })
    }
}

/// Folds `[batch, 1, samples]` into two "mel" rows.
pub struct ToyMel;

impl MelTransform for ToyMel {
    fn mel(&self, waveform: &Tensor) -> Result<Tensor, TrainingError> {
        let (batch, _, samples) = candle(waveform.dims3())?;
        candle(waveform.reshape((batch, 2, samples / 2)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Scalar { tag: String, step: u64 },
    Image { tag: String, rows: usize, cols: usize },
    Audio { tag: String, samples: usize },
}

#[derive(Clone, Default)]
pub struct RecordingSink {
    pub records: Arc<Mutex<Vec<Record>>>,
    fail_on_scalar_batch: Option<usize>,
    scalar_batches: Arc<AtomicUsize>,
}

impl RecordingSink {
    /// Rejects the `call`-th scalar batch, counting from 1.
    pub fn failing_on_scalar_batch(call: usize) -> Self {
        Self {
            fail_on_scalar_batch: Some(call),
            ..Self::default()
        }
    }

    pub fn scalars_at(&self, step: u64) -> usize {
        self.records()
            .iter()
            .filter(|record| matches!(record, Record::Scalar { step: s, .. } if *s == step))
            .count()
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.lock().unwrap().clone()
    }

    pub fn scalar_tags(&self) -> Vec<String> {
        self.records()
            .into_iter()
            .filter_map(|record| match record {
                Record::Scalar { tag, .. } => Some(tag),
                _ => None,
            })
            .collect()
    }
}

impl MetricSink for RecordingSink {
    fn add_scalars(&mut self, step: u64, scalars: &[(String, f64)]) -> Result<(), TrainingError> {
        let call = self.scalar_batches.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_scalar_batch == Some(call) {
            return Err(TrainingError::runtime("metric backend unavailable"));
        }
        let mut records = self.records.lock().unwrap();
        records.extend(scalars.iter().map(|(tag, _)| Record::Scalar {
            tag: tag.clone(),
            step,
        }));
        Ok(())
    }

    fn add_array2d(
        &mut self,
        tag: &str,
        _step: u64,
        _values: &[f32],
        rows: usize,
        cols: usize,
    ) -> Result<(), TrainingError> {
        self.records.lock().unwrap().push(Record::Image {
            tag: tag.to_string(),
            rows,
            cols,
        });
        Ok(())
    }

    fn add_audio(
        &mut self,
        tag: &str,
        _step: u64,
        samples: &[f32],
        _sampling_rate: u32,
    ) -> Result<(), TrainingError> {
        self.records.lock().unwrap().push(Record::Audio {
            tag: tag.to_string(),
            samples: samples.len(),
        });
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        Ok(())
    }
}

pub type ToyCoordinator = TrainingCoordinator<ToyGenerator, ToyDiscriminator, ToyDataset>;

pub fn coordinator(
    config: TrainingConfig,
    context: ComputeContext,
    gain: f32,
    sink: RecordingSink,
) -> ToyCoordinator {
    coordinator_with(config, context, ToyGenerator::new(gain), ToyDiscriminator::new(), sink)
}

pub fn coordinator_with(
    config: TrainingConfig,
    context: ComputeContext,
    generator: ToyGenerator,
    discriminator: ToyDiscriminator,
    sink: RecordingSink,
) -> ToyCoordinator {
    TrainingCoordinator::new(
        config,
        context,
        generator,
        discriminator,
        Box::new(ToyMel),
        Arc::new(ToyDataset),
        Box::new(sink),
    )
    .unwrap()
}

pub fn single_process(config: TrainingConfig, gain: f32) -> ToyCoordinator {
    coordinator(
        config,
        ComputeContext::single_process(Device::Cpu, Precision::Fp32),
        gain,
        RecordingSink::default(),
    )
}

pub fn values(var: &Var) -> Vec<f32> {
    var.as_tensor().to_vec1::<f32>().unwrap()
}
