//! Seams to the networks being trained. Architectures live outside this
//! crate; the loop only needs named parameters and these forward passes.

use candle_core::{Tensor, Var};

use crate::{data::AudioBatch, TrainingError};

pub trait TrainableModule: Send {
    /// Every trainable parameter under a stable, unique name.
    fn named_parameters(&self) -> Vec<(String, Var)>;
}

/// Posterior/prior statistics of the generator's latent path.
#[derive(Debug, Clone)]
pub struct LatentStatistics {
    pub z: Tensor,
    pub z_p: Tensor,
    pub m_p: Tensor,
    pub logs_p: Tensor,
    pub m_q: Tensor,
    pub logs_q: Tensor,
}

#[derive(Debug, Clone)]
pub struct GeneratorOutput {
    /// Generated waveform segment, `[batch, 1, segment_size]`.
    pub waveform: Tensor,
    /// Quantizer commitment loss on the content features (scalar).
    pub commitment_loss: Tensor,
    /// Start frame of each sample's training segment.
    pub slice_starts: Vec<usize>,
    pub x_mask: Tensor,
    pub z_mask: Tensor,
    pub latents: LatentStatistics,
    /// Optional content-feature statistics, passed through untouched.
    pub ssl_stats: Option<Tensor>,
}

pub trait Generator: TrainableModule {
    fn forward_train(&self, batch: &AudioBatch) -> Result<GeneratorOutput, TrainingError>;

    /// Waveform from conditioning alone.
    fn infer(&self, batch: &AudioBatch) -> Result<Tensor, TrainingError>;
}

#[derive(Debug, Clone)]
pub struct DiscriminatorOutput {
    pub real_scores: Vec<Tensor>,
    pub fake_scores: Vec<Tensor>,
    pub real_features: Vec<Vec<Tensor>>,
    pub fake_features: Vec<Vec<Tensor>>,
}

pub trait Discriminator: TrainableModule {
    fn forward(&self, real: &Tensor, fake: &Tensor) -> Result<DiscriminatorOutput, TrainingError>;
}

/// Waveform to mel spectrogram, `[batch, mels, frames]`.
pub trait MelTransform: Send {
    fn mel(&self, waveform: &Tensor) -> Result<Tensor, TrainingError>;
}
