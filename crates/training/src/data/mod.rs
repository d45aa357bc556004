use candle_core::{Device, Tensor};
use futures::future::BoxFuture;

use crate::TrainingError;

pub mod bucket;
pub mod prefetch;

pub use bucket::{BucketedBatchSource, PlannedBatch};
pub use prefetch::PrefetchLoader;

pub type Result<T> = std::result::Result<T, TrainingError>;

/// Collated batch handed to the generator. Layouts beyond the waveform are
/// model-defined.
#[derive(Debug, Clone)]
pub struct AudioBatch {
    /// Self-supervised content features.
    pub ssl: Tensor,
    /// Linear spectrogram, `[batch, bins, frames]`.
    pub spec: Tensor,
    pub spec_lengths: Tensor,
    /// Reference waveform, `[batch, 1, samples]`.
    pub waveform: Tensor,
    pub waveform_lengths: Tensor,
    pub text: Tensor,
    pub text_lengths: Tensor,
    pub speaker_embedding: Option<Tensor>,
    /// Dataset indices in batch order.
    pub indices: Vec<usize>,
    pub bucket: usize,
}

impl AudioBatch {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Random-access audio dataset. Shared with background fetch workers.
pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Length used for bucketing, in spectrogram frames.
    fn example_length(&self, index: usize) -> usize;

    fn collate(&self, indices: &[usize], bucket: usize, device: &Device) -> Result<AudioBatch>;

    fn lengths(&self) -> Vec<usize> {
        (0..self.len()).map(|idx| self.example_length(idx)).collect()
    }
}

/// Source of collated batches for one epoch, in plan order. `None` ends
/// the epoch.
pub trait BatchStream: Send {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<AudioBatch>>>;
}

/// Drives a [`BatchStream`] from the synchronous training loop.
pub struct EpochBatches<L: BatchStream> {
    stream: L,
    delivered: usize,
}

impl<L: BatchStream> EpochBatches<L> {
    pub fn new(stream: L) -> Self {
        Self {
            stream,
            delivered: 0,
        }
    }

    pub fn next_batch(&mut self) -> Result<Option<AudioBatch>> {
        let batch = futures::executor::block_on(self.stream.next_batch())?;
        if batch.is_some() {
            self.delivered += 1;
        }
        Ok(batch)
    }

    /// Batches handed out so far.
    pub fn delivered(&self) -> usize {
        self.delivered
    }
}
