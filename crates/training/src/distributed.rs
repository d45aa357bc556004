//! Process-group abstraction and the resolved compute context.

use std::{
    fmt,
    sync::{Arc, Barrier, Mutex},
};

use candle_core::{backprop::GradStore, DType, Device, Tensor, Var};
use tracing::trace;

use crate::{config::Precision, error::to_runtime_error, TrainingError};

/// Gradient synchronization across data-parallel workers. Every call is a
/// blocking collective without timeout.
pub trait ProcessGroup: Send + Sync + fmt::Debug {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;

    /// Replaces each parameter's gradient with the mean over all workers.
    /// Parameters without a gradient contribute zeros.
    fn all_reduce_mean(
        &self,
        grads: &mut GradStore,
        parameters: &[(String, Var)],
    ) -> Result<(), TrainingError>;

    fn barrier(&self) -> Result<(), TrainingError>;

    fn is_primary(&self) -> bool {
        self.rank() == 0
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_mean(
        &self,
        _grads: &mut GradStore,
        _parameters: &[(String, Var)],
    ) -> Result<(), TrainingError> {
        Ok(())
    }

    fn barrier(&self) -> Result<(), TrainingError> {
        Ok(())
    }
}

/// In-memory group where each worker is a thread of the current process.
pub struct LocalProcessGroup {
    rank: usize,
    shared: Arc<SharedState>,
}

struct SharedState {
    world_size: usize,
    barrier: Barrier,
    slots: Mutex<Vec<Vec<f32>>>,
}

impl fmt::Debug for LocalProcessGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalProcessGroup")
            .field("rank", &self.rank)
            .field("world_size", &self.shared.world_size)
            .finish()
    }
}

impl LocalProcessGroup {
    /// One handle per rank; hand each to its own thread.
    pub fn create(world_size: usize) -> Result<Vec<Arc<LocalProcessGroup>>, TrainingError> {
        if world_size == 0 {
            return Err(TrainingError::initialization(
                "process group needs at least one worker",
            ));
        }
        let shared = Arc::new(SharedState {
            world_size,
            barrier: Barrier::new(world_size),
            slots: Mutex::new(vec![Vec::new(); world_size]),
        });
        Ok((0..world_size)
            .map(|rank| {
                Arc::new(LocalProcessGroup {
                    rank,
                    shared: Arc::clone(&shared),
                })
            })
            .collect())
    }

    fn exchange(&self, local: Vec<f32>) -> Result<Vec<f32>, TrainingError> {
        let expected = local.len();
        match self.shared.slots.lock() {
            Ok(mut slots) => slots[self.rank] = local,
            Err(_) => return Err(TrainingError::desync("gradient exchange lock poisoned")),
        }
        self.shared.barrier.wait();

        let reduced = match self.shared.slots.lock() {
            Ok(slots) => mean_of(&slots, expected),
            Err(_) => Err(TrainingError::desync("gradient exchange lock poisoned")),
        };
        // Keep slots stable until every worker has read them.
        self.shared.barrier.wait();
        reduced
    }
}

fn mean_of(slots: &[Vec<f32>], expected: usize) -> Result<Vec<f32>, TrainingError> {
    if let Some((rank, slot)) = slots
        .iter()
        .enumerate()
        .find(|(_, slot)| slot.len() != expected)
    {
        return Err(TrainingError::desync(format!(
            "worker {rank} contributed {} gradient values, expected {expected}",
            slot.len()
        )));
    }
    let scale = 1.0 / slots.len() as f32;
    let mut mean = vec![0.0f32; expected];
    for slot in slots {
        for (acc, value) in mean.iter_mut().zip(slot) {
            *acc += value;
        }
    }
    for value in &mut mean {
        *value *= scale;
    }
    Ok(mean)
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn all_reduce_mean(
        &self,
        grads: &mut GradStore,
        parameters: &[(String, Var)],
    ) -> Result<(), TrainingError> {
        let mut flat = Vec::new();
        let mut layout = Vec::with_capacity(parameters.len());
        for (_, var) in parameters {
            let tensor = var.as_tensor();
            let values = match grads.get(tensor) {
                Some(grad) => grad
                    .to_dtype(DType::F32)
                    .and_then(|g| g.flatten_all())
                    .and_then(|g| g.to_vec1::<f32>())
                    .map_err(to_runtime_error)?,
                None => vec![0.0; tensor.elem_count()],
            };
            layout.push(values.len());
            flat.extend(values);
        }

        trace!(rank = self.rank, values = flat.len(), "all-reduce");
        let reduced = self.exchange(flat)?;

        let mut offset = 0;
        for ((_, var), len) in parameters.iter().zip(layout) {
            let tensor = var.as_tensor();
            let mean = Tensor::from_slice(&reduced[offset..offset + len], tensor.dims(), tensor.device())
                .and_then(|g| g.to_dtype(tensor.dtype()))
                .map_err(to_runtime_error)?;
            grads.insert(tensor, mean);
            offset += len;
        }
        Ok(())
    }

    fn barrier(&self) -> Result<(), TrainingError> {
        self.shared.barrier.wait();
        Ok(())
    }
}

/// Device, precision and process group, resolved once at startup.
#[derive(Debug, Clone)]
pub struct ComputeContext {
    pub device: Device,
    pub precision: Precision,
    pub group: Arc<dyn ProcessGroup>,
}

impl ComputeContext {
    pub fn new(device: Device, precision: Precision, group: Arc<dyn ProcessGroup>) -> Self {
        Self {
            device,
            precision,
            group,
        }
    }

    pub fn single_process(device: Device, precision: Precision) -> Self {
        Self::new(device, precision, Arc::new(SingleProcess))
    }

    pub fn rank(&self) -> usize {
        self.group.rank()
    }

    pub fn world_size(&self) -> usize {
        self.group.world_size()
    }

    pub fn is_primary(&self) -> bool {
        self.group.is_primary()
    }
}
