use crate::TrainingError;

pub trait LRScheduler: Send {
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
}

/// Per-epoch exponential decay shared by every parameter group of an
/// optimizer. During epoch `e` (1-based) the base rate is `base_lr * gamma^e`.
#[derive(Debug, Clone)]
pub struct ExponentialDecay {
    base_lr: f64,
    gamma: f64,
    epoch: usize,
    current_lr: f64,
}

impl ExponentialDecay {
    pub fn new(base_lr: f64, gamma: f64) -> Result<Self, TrainingError> {
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        if !(0.0 < gamma && gamma <= 1.0) {
            return Err(TrainingError::initialization(
                "scheduler decay must be in (0, 1]",
            ));
        }
        Ok(Self {
            base_lr,
            gamma,
            epoch: 0,
            current_lr: base_lr,
        })
    }

    /// Positions the schedule for training `epoch`.
    pub fn starting_at(mut self, epoch: usize) -> Self {
        while self.epoch < epoch {
            self.step();
        }
        self
    }

    pub fn lr_for_epoch(&self, epoch: usize) -> f64 {
        self.base_lr * self.gamma.powi(epoch as i32)
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }
}

impl LRScheduler for ExponentialDecay {
    fn step(&mut self) -> f64 {
        self.epoch = self.epoch.saturating_add(1);
        self.current_lr = self.lr_for_epoch(self.epoch);
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }
}
